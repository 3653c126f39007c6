// Fixtures shared by the sweep integration tests

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use residue::analyzer::AliasTable;
use residue::resource::{ConfigStore, LocalTree, ResourceTree};
use residue::{BackendKind, ModuleController, PatternAnalyzer, SafetyPolicy, TreeScanner};

pub const STORE_ROOT: &str = r"HKCU\Software\Fixture";

/// One resource tree plus a root to build test layouts under.
pub trait Fixture {
    fn label(&self) -> &'static str;
    fn tree(&self) -> Arc<dyn ResourceTree>;
    fn root(&self) -> String;
    /// Create a container at a `/`-separated path relative to the root.
    fn mkdir(&self, rel: &str);

    /// Root-relative, `/`-separated form of a full path.
    fn relative(&self, path: &str) -> String {
        let root = self.root();
        path.strip_prefix(root.as_str())
            .unwrap_or(path)
            .trim_start_matches(['/', '\\'])
            .replace('\\', "/")
    }
}

pub struct FsFixture {
    pub dir: tempfile::TempDir,
    pub tree: Arc<LocalTree>,
}

impl FsFixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            tree: Arc::new(LocalTree::new()),
        }
    }

    pub fn path(&self, rel: &str) -> std::path::PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &[u8]) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }
}

impl Fixture for FsFixture {
    fn label(&self) -> &'static str {
        "filesystem"
    }

    fn tree(&self) -> Arc<dyn ResourceTree> {
        self.tree.clone()
    }

    fn root(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    fn mkdir(&self, rel: &str) {
        fs::create_dir_all(self.dir.path().join(rel)).unwrap();
    }
}

pub struct StoreFixture {
    pub store: Arc<ConfigStore>,
}

impl StoreFixture {
    pub fn new() -> Self {
        let store = ConfigStore::new();
        store.insert_key(STORE_ROOT).unwrap();
        Self {
            store: Arc::new(store),
        }
    }
}

impl Fixture for StoreFixture {
    fn label(&self) -> &'static str {
        "registry"
    }

    fn tree(&self) -> Arc<dyn ResourceTree> {
        self.store.clone()
    }

    fn root(&self) -> String {
        STORE_ROOT.to_string()
    }

    fn mkdir(&self, rel: &str) {
        let path = format!(r"{}\{}", STORE_ROOT, rel.replace('/', "\\"));
        self.store.insert_key(&path).unwrap();
    }
}

/// Run `check` once per backend.
pub fn for_each_backend(check: impl Fn(&dyn Fixture)) {
    let fs_fixture = FsFixture::new();
    check(&fs_fixture);
    let store_fixture = StoreFixture::new();
    check(&store_fixture);
}

pub fn running_controller(name: &str) -> Arc<ModuleController> {
    let controller = Arc::new(ModuleController::new(name));
    controller.initialize().unwrap();
    controller.run().unwrap();
    controller
}

pub fn scanner(tree: Arc<dyn ResourceTree>, target: &str, max_depth: usize) -> TreeScanner {
    let name = tree.kind().short_name();
    TreeScanner::new(
        tree,
        Arc::new(PatternAnalyzer::for_target(target, &AliasTable::empty()).unwrap()),
        Arc::new(SafetyPolicy::new()),
        running_controller(name),
    )
    .with_max_depth(max_depth)
}

/// Every node below `root` with its attributes, for before/after comparisons.
pub fn tree_state(tree: &dyn ResourceTree, root: &str) -> Vec<(String, residue::resource::Attributes)> {
    let mut state = Vec::new();
    let mut stack = vec![root.to_string()];
    while let Some(path) = stack.pop() {
        let node = tree.open(&path).unwrap();
        if node.is_container() {
            for child in tree.list_children(&path).unwrap().iter().rev() {
                stack.push(tree.join(&path, child));
            }
        }
        state.push((path, node.attributes));
    }
    state
}

pub fn is_store(backend: BackendKind) -> bool {
    backend == BackendKind::ConfigStore
}

pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
