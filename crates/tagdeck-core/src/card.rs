//! Last-seen tag id, consulted during the grace window to tell a
//! re-presented tag from a different one.

use std::path::PathBuf;

use crate::error::Result;
use crate::tag::TagId;

pub trait CardStore {
    fn record(&mut self, tag: &TagId) -> Result<()>;
    fn last(&self) -> Result<Option<TagId>>;
}

/// Single-line text file, rewritten atomically on every new tag.
pub struct FileCardStore {
    path: PathBuf,
}

impl FileCardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CardStore for FileCardStore {
    fn record(&mut self, tag: &TagId) -> Result<()> {
        crate::io::atomic_write(&self.path, tag.as_str().as_bytes())
    }

    fn last(&self) -> Result<Option<TagId>> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) if s.trim().is_empty() => Ok(None),
            Ok(s) => Ok(Some(TagId::new(s))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-lifetime store for deployments that opt out of persistence.
#[derive(Default)]
pub struct MemoryCardStore {
    last: Option<TagId>,
}

impl CardStore for MemoryCardStore {
    fn record(&mut self, tag: &TagId) -> Result<()> {
        self.last = Some(tag.clone());
        Ok(())
    }

    fn last(&self) -> Result<Option<TagId>> {
        Ok(self.last.clone())
    }
}
