//! Local filesystem connector
//!
//! Files directly under the root are read in the non-partitionable `root_files`
//! stage. Each immediate sub-directory is a container of the partitionable
//! `folders` stage and is walked recursively.

use crate::connector::cache::NameCache;
use crate::connector::traits::{
    Item, Page, PageRequest, RetrievalMode, Retrieved, ScopedFailure, Source, SourceError,
    StageSpec,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

pub const ROOT_STAGE: &str = "root_files";
pub const FOLDER_STAGE: &str = "folders";

const DEFAULT_PAGE_SIZE: usize = 100;

/// A file found while listing a container
struct Listed {
    id: String,
    path: PathBuf,
    modified: f64,
}

/// Connector crawling a directory tree on the local filesystem
pub struct DirectorySource {
    name: String,
    root: PathBuf,
    names: NameCache,
    page_size: usize,
}

impl DirectorySource {
    pub fn new(name: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            root: root.into(),
            names: NameCache::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn container_dir(&self, stage: &str, container: &str) -> Result<PathBuf, SourceError> {
        match stage {
            ROOT_STAGE => Ok(self.root.clone()),
            FOLDER_STAGE => Ok(self.root.join(container)),
            other => Err(SourceError::Systemic(format!("unknown stage {}", other))),
        }
    }

    /// Human-readable container name, resolved once per stage
    fn display_name(&self, container: &str) -> String {
        self.names.get_or_insert_with(container, || {
            Path::new(container)
                .file_name()
                .map(|name| name.to_string_lossy().replace(['_', '-'], " "))
                .unwrap_or_else(|| container.to_string())
        })
    }

    /// Lists files under `dir`, recursing when asked
    ///
    /// Entries whose metadata cannot be read are returned as item failures.
    fn list_files(
        &self,
        dir: &Path,
        recursive: bool,
    ) -> Result<(Vec<Listed>, Vec<ScopedFailure>), std::io::Error> {
        let mut files = Vec::new();
        let mut failures = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            for entry in fs::read_dir(&current)? {
                let entry = entry?;
                let path = entry.path();
                let id = self.relative_id(&path);
                let file_type = match entry.file_type() {
                    Ok(file_type) => file_type,
                    Err(e) => {
                        failures.push(item_failure(&id, &path, e));
                        continue;
                    }
                };

                if file_type.is_dir() {
                    if recursive {
                        pending.push(path);
                    }
                } else if file_type.is_file() {
                    match modified_secs(&path) {
                        Ok(modified) => files.push(Listed { id, path, modified }),
                        Err(e) => failures.push(item_failure(&id, &path, e)),
                    }
                }
            }
        }

        Ok((files, failures))
    }

    fn relative_id(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn to_retrieved(&self, listed: Listed, request: &PageRequest<'_>) -> Retrieved {
        let content = match request.mode {
            RetrievalMode::Slim => None,
            RetrievalMode::Full => match fs::read(&listed.path) {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => return Retrieved::Failure(item_failure(&listed.id, &listed.path, e)),
            },
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("container".to_string(), request.container.to_string());
        if request.stage == FOLDER_STAGE {
            metadata.insert(
                "container_name".to_string(),
                self.display_name(request.container),
            );
        }

        Retrieved::Item(Item {
            title: listed
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| listed.id.clone()),
            link: Some(format!("file://{}", listed.path.display())),
            id: listed.id,
            modified: listed.modified,
            metadata,
            content,
        })
    }
}

fn modified_secs(path: &Path) -> std::io::Result<f64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0))
}

fn item_failure(id: &str, path: &Path, error: std::io::Error) -> ScopedFailure {
    ScopedFailure::Item {
        id: id.to_string(),
        link: Some(format!("file://{}", path.display())),
        message: error.to_string(),
    }
}

impl Source for DirectorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![
            StageSpec::new(ROOT_STAGE, false),
            StageSpec::new(FOLDER_STAGE, true),
        ]
    }

    fn discover_containers(&self, stage: &StageSpec) -> Result<Vec<String>, SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::Systemic(format!(
                "root {} is not a readable directory",
                self.root.display()
            )));
        }

        if stage.name != FOLDER_STAGE {
            return Ok(vec![stage.name.clone()]);
        }

        // Folder names may have changed since the last stage entry
        self.names.clear();

        let entries = fs::read_dir(&self.root)
            .map_err(|e| SourceError::Transient(format!("listing {}: {}", self.root.display(), e)))?;
        let mut containers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SourceError::Transient(e.to_string()))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                containers.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        containers.sort();
        Ok(containers)
    }

    fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, SourceError> {
        let dir = self.container_dir(request.stage, request.container)?;
        if !dir.is_dir() {
            let message = format!("{} is not a readable directory", dir.display());
            return if request.stage == ROOT_STAGE {
                Err(SourceError::Systemic(message))
            } else {
                Err(SourceError::Scoped {
                    container: request.container.to_string(),
                    message,
                })
            };
        }

        let offset = match request.page_token {
            None => 0,
            Some(token) => token.parse::<usize>().map_err(|_| SourceError::Scoped {
                container: request.container.to_string(),
                message: format!("invalid page token {}", token),
            })?,
        };

        let recursive = request.stage == FOLDER_STAGE;
        let (mut files, failures) = self.list_files(&dir, recursive).map_err(|e| {
            SourceError::Transient(format!("listing {}: {}", dir.display(), e))
        })?;

        files.retain(|f| {
            request.window.contains(f.modified) && request.since.map_or(true, |s| f.modified >= s)
        });
        files.sort_by(|a, b| a.modified.total_cmp(&b.modified).then_with(|| a.id.cmp(&b.id)));

        let end = (offset + self.page_size).min(files.len());
        let next_page_token = (end < files.len()).then(|| end.to_string());

        // Listing failures are reported once, with the first page
        let mut entries: Vec<Retrieved> = if offset == 0 {
            failures.into_iter().map(Retrieved::Failure).collect()
        } else {
            Vec::new()
        };
        entries.extend(
            files
                .into_iter()
                .skip(offset)
                .take(end.saturating_sub(offset))
                .map(|listed| self.to_retrieved(listed, request)),
        );

        Ok(Page {
            entries,
            next_page_token,
        })
    }
}
