//! Document sinks receiving crawled items

use crate::connector::Item;
use crate::state::RunKey;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur writing documents
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode document {id}: {message}")]
    Encode { id: String, message: String },
}

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Destination for the documents one attempt produces
///
/// `flush` is called before every checkpoint persist: once it returns, every
/// document written so far must be durable, so a checkpoint never claims items
/// the sink could still lose.
pub trait DocumentSink: Send {
    fn write(&mut self, item: &Item) -> SinkResult<()>;

    fn flush(&mut self) -> SinkResult<()>;
}

/// Appends one JSON object per line to `<dir>/<source>_<generation>.jsonl`
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Opens (or creates) the output file for a run key
    ///
    /// # Arguments
    ///
    /// * `dir` - Output directory, created if missing
    /// * `source_name` - Source name used in the file name
    /// * `key` - The run's (source, generation) pair
    pub fn create(dir: &Path, source_name: &str, key: RunKey) -> SinkResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(source_name, key.generation_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!("Writing documents to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn file_name(source_name: &str, generation_id: i64) -> String {
        let safe: String = source_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{}_{}.jsonl", safe, generation_id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DocumentSink for JsonlSink {
    fn write(&mut self, item: &Item) -> SinkResult<()> {
        serde_json::to_writer(&mut self.writer, item).map_err(|e| SinkError::Encode {
            id: item.id.clone(),
            message: e.to_string(),
        })?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> SinkResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// In-memory sink; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    items: Arc<Mutex<Vec<Item>>>,
    flushes: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<Item> {
        self.items.lock().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.lock().iter().map(|item| item.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn flush_count(&self) -> usize {
        *self.flushes.lock()
    }
}

impl DocumentSink for MemorySink {
    fn write(&mut self, item: &Item) -> SinkResult<()> {
        self.items.lock().push(item.clone());
        Ok(())
    }

    fn flush(&mut self) -> SinkResult<()> {
        *self.flushes.lock() += 1;
        Ok(())
    }
}
