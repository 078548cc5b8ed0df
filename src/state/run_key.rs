use std::fmt;

/// Identifies the unit of mutual exclusion: one (source, index generation) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunKey {
    pub source_id: i64,
    pub generation_id: i64,
}

impl RunKey {
    pub fn new(source_id: i64, generation_id: i64) -> Self {
        Self {
            source_id,
            generation_id,
        }
    }

    /// Parses the `<source>/<generation>` form produced by `Display`
    ///
    /// Returns None for anything else, including negative or empty parts.
    pub fn parse(s: &str) -> Option<Self> {
        let (source, generation) = s.split_once('/')?;
        let source_id = source.parse::<i64>().ok().filter(|id| *id >= 0)?;
        let generation_id = generation.parse::<i64>().ok().filter(|id| *id >= 0)?;
        Some(Self::new(source_id, generation_id))
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.generation_id)
    }
}
