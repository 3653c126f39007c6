//! Pending-deletion queue applied at next start.
//!
//! Leaves that stay locked after elevation and a retry are recorded here;
//! `flush` removes them once whatever held them is gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ResidueError, Result};
use crate::util::write_atomic;

const QUEUE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDeletion {
    pub path: PathBuf,
    pub scheduled: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    pending: Vec<PendingDeletion>,
}

/// Result of applying the queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    pub removed: Vec<PathBuf>,
    pub remaining: Vec<PathBuf>,
}

pub struct RebootQueue {
    file: PathBuf,
    lock: Mutex<()>,
}

impl RebootQueue {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Add a path to the queue. Scheduling the same path twice is a no-op.
    pub fn schedule(&self, path: &Path) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut queue = self.load()?;
        if queue.pending.iter().any(|p| p.path == path) {
            return Ok(());
        }
        queue.pending.push(PendingDeletion {
            path: path.to_path_buf(),
            scheduled: Utc::now(),
        });
        self.store(&queue)?;
        tracing::info!(path = %path.display(), "scheduled for deletion at next start");
        Ok(())
    }

    pub fn pending(&self) -> Result<Vec<PendingDeletion>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.pending)
    }

    /// Delete every queued path, deepest first. Paths already gone count as removed;
    /// failures stay queued for the next attempt.
    pub fn flush(&self) -> Result<FlushReport> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut queue = self.load()?;
        queue
            .pending
            .sort_by_key(|p| std::cmp::Reverse(p.path.components().count()));

        let mut report = FlushReport::default();
        let mut kept = Vec::new();
        for entry in queue.pending {
            match remove_node(&entry.path) {
                Ok(()) => report.removed.push(entry.path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => report.removed.push(entry.path),
                Err(e) => {
                    tracing::debug!(path = %entry.path.display(), error = %e, "deferred deletion still blocked");
                    report.remaining.push(entry.path.clone());
                    kept.push(entry);
                }
            }
        }

        queue.pending = kept;
        self.store(&queue)?;
        Ok(report)
    }

    fn load(&self) -> Result<QueueFile> {
        match fs::read(&self.file) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ResidueError::ManifestCorrupt {
                path: self.file.clone(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(QueueFile {
                version: QUEUE_VERSION,
                pending: Vec::new(),
            }),
            Err(e) => Err(ResidueError::from_io_error(
                e,
                "reading reboot queue",
                self.file.display().to_string(),
            )),
        }
    }

    fn store(&self, queue: &QueueFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(queue).map_err(|e| ResidueError::Io {
            path: self.file.display().to_string(),
            operation: "encoding reboot queue".to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        write_atomic(&self.file, &bytes).map_err(|e| {
            ResidueError::from_io_error(e, "writing reboot queue", self.file.display().to_string())
        })
    }
}

fn remove_node(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}
