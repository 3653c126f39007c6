// Parallel root scans through the Sweep facade

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use residue::resource::{Attributes, BackendCapabilities, ConfigStore, NodeKind, ResourceNode};
use residue::{BackendKind, Config, ResourceTree, Result, Sweep, TaskStatus, TreeSet};

/// Store wrapper whose listings under one marker hang for a while.
struct SlowStore {
    inner: Arc<ConfigStore>,
    marker: &'static str,
    delay: Duration,
}

impl ResourceTree for SlowStore {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    fn join(&self, parent: &str, name: &str) -> String {
        self.inner.join(parent, name)
    }

    fn parent(&self, path: &str) -> Option<String> {
        self.inner.parent(path)
    }

    fn name_of(&self, path: &str) -> String {
        self.inner.name_of(path)
    }

    fn depth_of(&self, path: &str) -> usize {
        self.inner.depth_of(path)
    }

    fn open(&self, path: &str) -> Result<ResourceNode> {
        self.inner.open(path)
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        if path.contains(self.marker) {
            thread::sleep(self.delay);
        }
        self.inner.list_children(path)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path)
    }

    fn create(&self, path: &str, kind: NodeKind, payload: Option<&Path>) -> Result<()> {
        self.inner.create(path, kind, payload)
    }

    fn apply_attributes(&self, path: &str, attributes: &Attributes) -> Result<()> {
        self.inner.apply_attributes(path, attributes)
    }
}

fn config(roots: &[&str], workers: usize, backups: &Path) -> Config {
    let mut config = Config::default();
    config.max_workers = workers;
    config.task_timeout_secs = 1;
    config.roots.filesystem = Vec::new();
    config.roots.store = roots.iter().map(|r| r.to_string()).collect();
    config.backup_dir = backups.to_path_buf();
    config
}

#[test]
fn test_one_slow_root_times_out_without_blocking_the_rest() {
    let store = Arc::new(ConfigStore::new());
    for root in ["RootA", "RootB", "RootC", "RootSlow"] {
        store
            .insert_key(&format!(r"HKCU\Software\{}\Acme{}", root, root))
            .unwrap();
    }
    let slow = SlowStore {
        inner: store,
        marker: "RootSlow",
        delay: Duration::from_secs(3),
    };
    let backups = tempfile::tempdir().unwrap();
    let roots = [
        r"HKCU\Software\RootA",
        r"HKCU\Software\RootB",
        r"HKCU\Software\RootC",
        r"HKCU\Software\RootSlow",
    ];
    let sweep = Sweep::with_trees(
        config(&roots, 2, backups.path()),
        "acme",
        TreeSet::new().with_tree(Arc::new(slow)),
    )
    .unwrap();

    let started = Instant::now();
    let mut scan = sweep.scan().unwrap();
    let mut findings: Vec<String> = scan.by_ref().map(|f| f.path).collect();
    let elapsed = started.elapsed();
    findings.sort();

    assert_eq!(
        findings,
        vec![
            r"HKCU\Software\RootA\AcmeRootA",
            r"HKCU\Software\RootB\AcmeRootB",
            r"HKCU\Software\RootC\AcmeRootC",
        ]
    );
    let report = scan.report();
    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.count(TaskStatus::Completed), 3);
    assert_eq!(report.count(TaskStatus::TimedOut), 1);
    assert!(elapsed < Duration::from_secs(3), "collector waited for the stuck root");
}

#[test]
fn test_sweep_scan_then_clean_end_to_end() {
    let store = Arc::new(ConfigStore::new());
    store.insert_key(r"HKCU\Software\Acme\Cache").unwrap();
    store
        .set_value(r"HKCU\Software\Vendor\AcmeAgent", "Path", r"C:\Acme\agent.exe")
        .unwrap();
    let backups = tempfile::tempdir().unwrap();
    let sweep = Sweep::with_trees(
        config(&[r"HKCU\Software"], 2, backups.path()),
        "acme",
        TreeSet::new().with_tree(store.clone()),
    )
    .unwrap();

    let findings: Vec<_> = sweep.scan().unwrap().collect();
    assert_eq!(findings.len(), 2);
    assert!(findings.iter().all(|f| f.module == "registry"));

    let mut run = sweep.clean(findings).unwrap();
    let outcomes: Vec<_> = run.by_ref().collect();
    assert!(outcomes.iter().all(|o| o.success));
    assert!(!store.exists(r"HKCU\Software\Acme").unwrap());
    assert!(store.exists(r"HKCU\Software\Vendor").unwrap());

    let sessions = sweep.sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, run.session().unwrap().id());

    let restored = sweep.restore(&sessions[0].id).unwrap();
    assert_eq!(restored.failed, 0);
    assert!(store.exists(r"HKCU\Software\Acme\Cache").unwrap());

    let mut report = residue::RunReport::new("acme");
    sweep.collect_stats(&mut report);
    assert_eq!(report.modules.len(), 2);
    assert_eq!(report.items_found(), 2);
    assert_eq!(report.items_cleaned(), 2);
}

#[test]
fn test_invalid_store_root_is_rejected_before_scanning() {
    let backups = tempfile::tempdir().unwrap();
    let result = Sweep::with_trees(
        config(&[r"HKNOPE\Software"], 1, backups.path()),
        "acme",
        TreeSet::new().with_tree(Arc::new(ConfigStore::new())),
    );
    assert!(result.err().unwrap().is_config_error());
}
