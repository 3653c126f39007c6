// Cancellation and pausing during scans

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use residue::resource::ConfigStore;
use residue::{CancellationToken, Config, ModuleState, Sweep, TreeSet};

use crate::common::{scanner, Fixture, StoreFixture};

fn populated() -> StoreFixture {
    let fixture = StoreFixture::new();
    for branch in ["one", "two", "three"] {
        for leaf in 0..4 {
            fixture.mkdir(&format!("{}/acme-{}-{}", branch, branch, leaf));
        }
    }
    fixture
}

#[test]
fn test_cancelled_scan_yields_a_prefix() {
    let fixture = populated();
    let full: Vec<String> = scanner(fixture.tree(), "acme", 10)
        .scan(&fixture.root())
        .map(|f| f.path)
        .collect();
    assert_eq!(full.len(), 12);

    for cut in [0, 1, 5, 11] {
        let scanner = scanner(fixture.tree(), "acme", 10);
        let token = CancellationToken::new();
        let mut iter = scanner.scan_with(&fixture.root(), token.clone(), None);
        let mut partial: Vec<String> = iter.by_ref().take(cut).map(|f| f.path).collect();
        token.cancel();
        partial.extend(iter.by_ref().map(|f| f.path));

        assert_eq!(partial, full[..cut].to_vec());
        assert_eq!(iter.stopped(), Some(residue::scanner::ScanStop::Cancelled));
    }
}

#[test]
fn test_sweep_cancel_keeps_per_root_prefixes() {
    let store = Arc::new(ConfigStore::new());
    for root in ["RootA", "RootB"] {
        for n in 0..20 {
            store
                .insert_key(&format!(r"HKCU\Software\{}\Acme{:02}", root, n))
                .unwrap();
        }
    }
    let backups = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.max_workers = 2;
    config.roots.filesystem = Vec::new();
    config.roots.store = vec![r"HKCU\Software\RootA".into(), r"HKCU\Software\RootB".into()];
    config.backup_dir = backups.path().to_path_buf();

    let sweep = Sweep::with_trees(config, "acme", TreeSet::new().with_tree(store)).unwrap();

    let per_root = |paths: Vec<String>| {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in paths {
            let root = path.rsplit_once('\\').map(|(p, _)| p.to_string()).unwrap_or_default();
            grouped.entry(root).or_default().push(path);
        }
        grouped
    };

    let full = per_root(sweep.scan().unwrap().map(|f| f.path).collect());
    assert_eq!(full.values().map(Vec::len).sum::<usize>(), 40);

    let mut scan = sweep.scan().unwrap();
    let mut partial: Vec<String> = scan.by_ref().take(3).map(|f| f.path).collect();
    sweep.cancel();
    partial.extend(scan.by_ref().map(|f| f.path));

    for (root, paths) in per_root(partial) {
        let expected = &full[&root];
        assert!(paths.len() <= expected.len());
        assert_eq!(paths, expected[..paths.len()].to_vec(), "root {}", root);
    }
    let controller = sweep.controller(residue::BackendKind::ConfigStore).unwrap();
    assert_eq!(controller.state(), ModuleState::Cancelled);
}

#[test]
fn test_paused_scan_resumes() {
    let fixture = populated();
    let scanner = scanner(fixture.tree(), "acme", 10);
    let controller = scanner.controller().clone();
    controller.pause().unwrap();

    let root = fixture.root();
    let worker = thread::spawn(move || scanner.scan(&root).count());
    thread::sleep(Duration::from_millis(150));
    assert!(!worker.is_finished());

    controller.resume().unwrap();
    assert_eq!(worker.join().unwrap(), 12);
}
