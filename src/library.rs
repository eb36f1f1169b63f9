//! Finished recordings
//!
//! Entries are added when an encoded file lands. `clear` only forgets the
//! entries; `delete` also removes the file.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub label: String,
    pub path: PathBuf,
    pub created_at: DateTime<Local>,
}

#[derive(Debug, Default)]
pub struct RecordingsLibrary {
    /// Oldest first
    entries: Vec<Recording>,
}

impl RecordingsLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, label: &str, path: PathBuf) {
        log::info!("Library: added {:?} ({:?})", label, path);
        self.entries.push(Recording {
            label: label.to_string(),
            path,
            created_at: Local::now(),
        });
    }

    pub fn list(&self) -> Vec<Recording> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry; files stay on disk.
    pub fn clear(&mut self) {
        log::info!("Library: cleared {} entries", self.entries.len());
        self.entries.clear();
    }

    /// Delete the file behind an entry and drop the entry.
    ///
    /// If the file cannot be removed the entry is kept. A file that is already
    /// gone just drops the entry.
    pub fn delete(&mut self, path: &Path) -> io::Result<Recording> {
        let index = self
            .entries
            .iter()
            .position(|r| r.path == path)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{:?} is not in the library", path),
                )
            })?;

        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("Library: {:?} was already gone", path);
            }
            Err(e) => {
                log::error!("Library: could not delete {:?}: {}", path, e);
                return Err(e);
            }
        }

        let removed = self.entries.remove(index);
        log::info!("Library: deleted {:?}", removed.path);
        Ok(removed)
    }
}
