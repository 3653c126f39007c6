// Backup manifest: the on-disk contract between a clean and a later restore.
// A session directory holds `manifest.json` and a `payload/` tree; every
// payload reference in the manifest is relative to the session directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::error::{ResidueError, Result};
use crate::resource::{Attributes, BackendKind, NodeKind};
use crate::util::write_atomic;

pub const MANIFEST_VERSION: &str = "1.0";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const PAYLOAD_DIR: &str = "payload";

/// Captured state of one node and its subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedNode {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub attributes: Attributes,
    /// Session-relative path of the copied leaf payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<CapturedNode>,
}

impl CapturedNode {
    /// Number of nodes in this subtree, itself included.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub sequence: u64,
    pub backend: BackendKind,
    pub original_path: String,
    pub backup_store_path: String,
    pub timestamp: DateTime<Utc>,
    pub snapshot: CapturedNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub session_id: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<BackupEntry>,
}

impl Manifest {
    pub fn new(session_id: &str) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            session_id: session_id.to_string(),
            created: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            ResidueError::from_io_error(e, "reading manifest", path.display().to_string())
        })?;
        let manifest: Manifest =
            serde_json::from_slice(&bytes).map_err(|e| ResidueError::ManifestCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if manifest.version != MANIFEST_VERSION {
            return Err(ResidueError::ManifestCorrupt {
                path: path.to_path_buf(),
                reason: format!("unsupported manifest version {}", manifest.version),
            });
        }
        Ok(manifest)
    }

    /// Durable write: temp file, fsync, rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| ResidueError::Io {
            path: path.display().to_string(),
            operation: "encoding manifest".to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        write_atomic(path, &bytes).map_err(|e| {
            ResidueError::from_io_error(e, "writing manifest", path.display().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::AttrValue;

    #[test]
    fn test_manifest_layout() {
        let mut manifest = Manifest::new("20240101_120000-abc123");
        let mut attributes = Attributes::new();
        attributes.insert("InstallPath".into(), AttrValue::from(r"C:\Acme"));
        manifest.entries.push(BackupEntry {
            sequence: 1,
            backend: BackendKind::ConfigStore,
            original_path: r"HKCU\Software\Acme".into(),
            backup_store_path: "payload/000001".into(),
            timestamp: Utc::now(),
            snapshot: CapturedNode {
                name: "Acme".into(),
                kind: NodeKind::Container,
                attributes,
                payload: None,
                children: Vec::new(),
            },
        });

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["entries"][0]["backend"], "config_store");
        assert_eq!(value["entries"][0]["snapshot"]["kind"], "container");
        assert_eq!(
            value["entries"][0]["snapshot"]["attributes"]["InstallPath"]["type"],
            "str"
        );
    }

    #[test]
    fn test_corrupt_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        fs::write(&path, b"{ not json").unwrap();
        let err = Manifest::load(&path).unwrap_err();
        assert!(matches!(err, ResidueError::ManifestCorrupt { .. }));
    }
}
