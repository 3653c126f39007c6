//! Backup and restore.
//!
//! A [`BackupSession`] lives for one clean run. Every snapshot captures the
//! whole subtree of a resource (attributes, structure, leaf payload copies)
//! and rewrites the manifest durably before returning, so a deletion is never
//! attempted against a resource whose backup is not on disk. Restore replays
//! a session in reverse order and only re-creates what is missing.

pub mod manifest;

pub use manifest::{BackupEntry, CapturedNode, Manifest, MANIFEST_FILE, MANIFEST_VERSION, PAYLOAD_DIR};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ErrorKind, ResidueError, Result};
use crate::resource::{NodeKind, ResourceTree, TreeSet};

static SESSION_SALT: AtomicU64 = AtomicU64::new(0);

/// Listing entry for a persisted session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub dir: PathBuf,
    pub created: DateTime<Utc>,
    pub entries: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Entries whose every node now exists
    pub restored: usize,
    pub failed: usize,
    /// Nodes that had to be re-created
    pub nodes_created: usize,
}

pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    /// Open (creating if needed) the backup root.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(ResidueError::InvalidBackupDir {
                path: root,
                reason: "not a directory".to_string(),
            });
        }
        if let Err(e) = fs::create_dir_all(&root) {
            return Err(ResidueError::InvalidBackupDir {
                path: root,
                reason: e.to_string(),
            });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn start_session(&self) -> Result<Arc<BackupSession>> {
        loop {
            let id = new_session_id();
            let dir = self.root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(ResidueError::InvalidBackupDir {
                        path: dir,
                        reason: e.to_string(),
                    })
                }
            }
            fs::create_dir_all(dir.join(PAYLOAD_DIR)).map_err(|e| {
                ResidueError::from_io_error(e, "creating payload dir", dir.display().to_string())
            })?;
            let manifest = Manifest::new(&id);
            manifest.save(&dir.join(MANIFEST_FILE))?;
            tracing::info!(session = %id, dir = %dir.display(), "backup session started");
            return Ok(Arc::new(BackupSession::from_manifest(dir, manifest)));
        }
    }

    pub fn open_session(&self, id: &str) -> Result<Arc<BackupSession>> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(ResidueError::InvalidConfig {
                message: format!("invalid session id '{}'", id),
            });
        }
        let dir = self.root.join(id);
        let manifest = Manifest::load(&dir.join(MANIFEST_FILE))?;
        Ok(Arc::new(BackupSession::from_manifest(dir, manifest)))
    }

    /// Persisted sessions, oldest first. Unreadable manifests are skipped.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let read_dir = fs::read_dir(&self.root).map_err(|e| {
            ResidueError::from_io_error(e, "listing sessions in", self.root.display().to_string())
        })?;

        let mut sessions = Vec::new();
        for entry in read_dir.flatten() {
            let dir = entry.path();
            let manifest_path = dir.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }
            match Manifest::load(&manifest_path) {
                Ok(manifest) => sessions.push(SessionSummary {
                    id: manifest.session_id,
                    created: manifest.created,
                    entries: manifest.entries.len(),
                    dir,
                }),
                Err(e) => tracing::warn!(path = %manifest_path.display(), error = %e, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Replay `session` in reverse order. Existing nodes are left untouched;
    /// per-node failures are counted, never returned.
    pub fn restore(&self, session: &BackupSession, trees: &TreeSet) -> RestoreReport {
        let mut report = RestoreReport::default();
        for entry in session.entries().iter().rev() {
            let Some(tree) = trees.get(entry.backend) else {
                tracing::warn!(path = %entry.original_path, backend = %entry.backend, "no tree for backend");
                report.failed += 1;
                continue;
            };
            let (created, failures) = restore_entry(tree.as_ref(), session.dir(), entry);
            report.nodes_created += created;
            if failures == 0 {
                report.restored += 1;
            } else {
                report.failed += 1;
            }
        }
        tracing::info!(
            session = %session.id(),
            restored = report.restored,
            failed = report.failed,
            "restore finished"
        );
        report
    }
}

fn new_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or_default();
    let salt = SESSION_SALT.fetch_add(1, Ordering::Relaxed);
    let suffix = (nanos ^ (u64::from(std::process::id()) << 20) ^ salt.wrapping_mul(0x9E37_79B9))
        & 0xFF_FFFF;
    format!("{}-{:06x}", Utc::now().format("%Y%m%d_%H%M%S"), suffix)
}

enum Step<'a> {
    Enter(String, &'a CapturedNode),
    Finish(String, &'a CapturedNode),
}

/// Re-create the missing parts of one entry. Returns (nodes created, failures).
fn restore_entry(tree: &dyn ResourceTree, session_dir: &Path, entry: &BackupEntry) -> (usize, usize) {
    let mut created = 0;
    let mut failures = 0;
    let mut stack = vec![Step::Enter(entry.original_path.clone(), &entry.snapshot)];

    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(path, node) => {
                match tree.exists(&path) {
                    Ok(true) => {
                        // Present already: descend, but do not touch the node itself.
                        for child in node.children.iter().rev() {
                            stack.push(Step::Enter(tree.join(&path, &child.name), child));
                        }
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::debug!(path, error = %e, "cannot check node during restore");
                        failures += 1;
                        continue;
                    }
                }

                let payload = node.payload.as_ref().map(|p| session_dir.join(p));
                if let Err(e) = tree.create(&path, node.kind, payload.as_deref()) {
                    tracing::debug!(path, error = %e, "restore create failed");
                    failures += 1;
                    continue;
                }
                created += 1;

                match node.kind {
                    NodeKind::Leaf => {
                        if let Err(e) = tree.apply_attributes(&path, &node.attributes) {
                            tracing::debug!(path, error = %e, "restore attributes failed");
                            failures += 1;
                        }
                    }
                    NodeKind::Container => {
                        stack.push(Step::Finish(path.clone(), node));
                        for child in node.children.iter().rev() {
                            stack.push(Step::Enter(tree.join(&path, &child.name), child));
                        }
                    }
                }
            }
            Step::Finish(path, node) => {
                if let Err(e) = tree.apply_attributes(&path, &node.attributes) {
                    tracing::debug!(path, error = %e, "restore attributes failed");
                    failures += 1;
                }
            }
        }
    }
    (created, failures)
}

/// One clean run's backup. Appends are serialized by the manifest lock.
pub struct BackupSession {
    id: String,
    dir: PathBuf,
    manifest: Mutex<Manifest>,
    next_sequence: AtomicU64,
    next_payload: AtomicU64,
}

impl BackupSession {
    fn from_manifest(dir: PathBuf, manifest: Manifest) -> Self {
        let last = manifest.entries.iter().map(|e| e.sequence).max().unwrap_or(0);
        Self {
            id: manifest.session_id.clone(),
            dir,
            manifest: Mutex::new(manifest),
            next_sequence: AtomicU64::new(last + 1),
            next_payload: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn entries(&self) -> Vec<BackupEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Manifest> {
        self.manifest.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Capture `path` and its subtree, then persist the manifest. On any
    /// failure the partial payload is removed and `BackupFailure` returned.
    pub fn snapshot(&self, tree: &dyn ResourceTree, path: &str) -> Result<BackupEntry> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let store_rel = format!("{}/{:06}", PAYLOAD_DIR, sequence);
        let store_dir = self.dir.join(&store_rel);

        let captured = match self.capture(tree, path, &store_rel) {
            Ok(node) => node,
            Err(e) => {
                let _ = fs::remove_dir_all(&store_dir);
                return Err(match e.kind() {
                    ErrorKind::BackupFailure => e,
                    _ => ResidueError::backup_failure(path, e),
                });
            }
        };

        let entry = BackupEntry {
            sequence,
            backend: tree.kind(),
            original_path: path.to_string(),
            backup_store_path: store_rel,
            timestamp: Utc::now(),
            snapshot: captured,
        };

        let mut manifest = self.lock();
        manifest.entries.push(entry.clone());
        if let Err(e) = manifest.save(&self.manifest_path()) {
            manifest.entries.pop();
            drop(manifest);
            let _ = fs::remove_dir_all(&store_dir);
            return Err(ResidueError::backup_failure(path, e));
        }
        tracing::debug!(path, sequence, nodes = entry.snapshot.node_count(), "snapshot persisted");
        Ok(entry)
    }

    fn capture(&self, tree: &dyn ResourceTree, root: &str, store_rel: &str) -> Result<CapturedNode> {
        let copies_payload = tree.capabilities().payload;
        let mut nodes: Vec<Option<CapturedNode>> = Vec::new();
        let mut parents: Vec<Option<usize>> = Vec::new();
        let mut stack: Vec<(String, Option<usize>)> = vec![(root.to_string(), None)];

        while let Some((path, parent)) = stack.pop() {
            let node = tree.open(&path)?;
            let mut payload = None;
            if copies_payload && node.kind == NodeKind::Leaf {
                let rel = format!(
                    "{}/{}",
                    store_rel,
                    self.next_payload.fetch_add(1, Ordering::SeqCst)
                );
                if tree.copy_payload_to(&path, &self.dir.join(&rel))?.is_some() {
                    payload = Some(rel);
                }
            }

            let index = nodes.len();
            if node.is_container() {
                for child in tree.list_children(&path)?.iter().rev() {
                    stack.push((tree.join(&path, child), Some(index)));
                }
            }
            nodes.push(Some(CapturedNode {
                name: node.name,
                kind: node.kind,
                attributes: node.attributes,
                payload,
                children: Vec::new(),
            }));
            parents.push(parent);
        }

        // Pre-order indices: attach each node to its parent, last first.
        for index in (1..nodes.len()).rev() {
            let (Some(parent), Some(node)) = (parents[index], nodes[index].take()) else {
                continue;
            };
            if let Some(parent_node) = nodes[parent].as_mut() {
                parent_node.children.push(node);
            }
        }
        let mut root_node = nodes
            .first_mut()
            .and_then(Option::take)
            .ok_or_else(|| ResidueError::backup_failure(root, "nothing captured"))?;

        // Children were attached in reverse; restore sorted order.
        let mut fix: Vec<&mut CapturedNode> = vec![&mut root_node];
        while let Some(node) = fix.pop() {
            node.children.reverse();
            fix.extend(node.children.iter_mut());
        }
        Ok(root_node)
    }
}
