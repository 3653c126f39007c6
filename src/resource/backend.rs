use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ErrorKind, ResidueError, Result};
use crate::resource::types::{Attributes, NodeKind, ResourceNode};

/// Backend type information for display and identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Filesystem,
    ConfigStore,
}

impl BackendKind {
    /// Get a short display name for the backend
    pub fn short_name(&self) -> &'static str {
        match self {
            BackendKind::Filesystem => "filesystem",
            BackendKind::ConfigStore => "registry",
        }
    }

    /// Item type reported in findings for a node of the given kind.
    pub fn item_type(&self, kind: NodeKind) -> &'static str {
        match (self, kind) {
            (BackendKind::Filesystem, NodeKind::Container) => "directory",
            (BackendKind::Filesystem, NodeKind::Leaf) => "file",
            (BackendKind::ConfigStore, _) => "registry_key",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Backend capability flags
#[derive(Debug, Clone, Default)]
pub struct BackendCapabilities {
    /// Leaves carry payload data that must be copied into backups
    pub payload: bool,
    /// Access can be widened on demand (chmod, ACL grant)
    pub elevation: bool,
    /// Leaves can be queued for deletion at next restart
    pub deferred_delete: bool,
    /// Names compare case-insensitively
    pub case_insensitive: bool,
}

impl BackendCapabilities {
    /// Local filesystem capabilities
    pub fn local() -> Self {
        Self {
            payload: true,
            elevation: true,
            deferred_delete: true,
            case_insensitive: cfg!(windows),
        }
    }

    /// Configuration store capabilities
    pub fn config_store(elevation: bool) -> Self {
        Self {
            payload: false,
            elevation,
            deferred_delete: false,
            case_insensitive: true,
        }
    }
}

/// Node-access primitives shared by every resource tree.
///
/// The scanner, cleaner and backup manager depend only on this trait. Paths are
/// backend-native strings (`/home/u/.config/app`, `HKCU\Software\Vendor`).
/// `delete` removes exactly one node; containers must already be empty.
pub trait ResourceTree: Send + Sync {
    // ========== Identity ==========

    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    // ========== Path algebra ==========

    fn join(&self, parent: &str, name: &str) -> String;

    fn parent(&self, path: &str) -> Option<String>;

    fn name_of(&self, path: &str) -> String;

    /// Number of components, used to order deletions children-first.
    fn depth_of(&self, path: &str) -> usize;

    // ========== Reading ==========

    fn open(&self, path: &str) -> Result<ResourceNode>;

    /// Child names in a stable, sorted order.
    fn list_children(&self, path: &str) -> Result<Vec<String>>;

    fn read_attributes(&self, path: &str) -> Result<Attributes> {
        Ok(self.open(path)?.attributes)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        match self.open(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy a leaf's payload into `dest`. Returns `None` when the backend keeps
    /// no payload beyond attributes.
    fn copy_payload_to(&self, _path: &str, _dest: &Path) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Total size of a node and everything below it. Unreadable parts count as zero.
    fn subtree_size(&self, path: &str) -> u64 {
        let mut total = 0u64;
        let mut stack = vec![path.to_string()];
        while let Some(current) = stack.pop() {
            let Ok(node) = self.open(&current) else {
                continue;
            };
            total += node.size;
            if node.is_container() {
                if let Ok(children) = self.list_children(&current) {
                    stack.extend(children.iter().map(|c| self.join(&current, c)));
                }
            }
        }
        total
    }

    // ========== Mutation ==========

    fn delete(&self, path: &str) -> Result<()>;

    /// Create a node. Leaves are filled from `payload` when given.
    /// Creating a container that already exists succeeds.
    fn create(&self, path: &str, kind: NodeKind, payload: Option<&Path>) -> Result<()>;

    /// Write captured attributes back onto an existing node.
    fn apply_attributes(&self, path: &str, attributes: &Attributes) -> Result<()>;

    /// Try to widen access to `path` so a retry can succeed.
    fn try_elevate(&self, _path: &str) -> bool {
        false
    }

    fn schedule_delete_on_reboot(&self, _path: &str) -> Result<()> {
        Err(ResidueError::unsupported(
            self.kind().short_name(),
            "deferred deletion",
        ))
    }
}

/// The set of trees a pipeline works against, one per backend kind.
#[derive(Clone, Default)]
pub struct TreeSet {
    filesystem: Option<Arc<dyn ResourceTree>>,
    store: Option<Arc<dyn ResourceTree>>,
}

impl TreeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tree(mut self, tree: Arc<dyn ResourceTree>) -> Self {
        self.insert(tree);
        self
    }

    pub fn insert(&mut self, tree: Arc<dyn ResourceTree>) {
        match tree.kind() {
            BackendKind::Filesystem => self.filesystem = Some(tree),
            BackendKind::ConfigStore => self.store = Some(tree),
        }
    }

    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn ResourceTree>> {
        match kind {
            BackendKind::Filesystem => self.filesystem.as_ref(),
            BackendKind::ConfigStore => self.store.as_ref(),
        }
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds = Vec::new();
        if self.filesystem.is_some() {
            kinds.push(BackendKind::Filesystem);
        }
        if self.store.is_some() {
            kinds.push(BackendKind::ConfigStore);
        }
        kinds
    }
}
