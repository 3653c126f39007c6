// Backup round trips: restore rebuilds what a clean removed

use std::fs;
use std::sync::Arc;

use residue::resource::{AttrValue, ConfigStore, ResourceTree};
use residue::{BackupManager, CleanAction, Cleaner, CleanerOptions, SafetyPolicy, TreeSet};

use crate::common::{running_controller, scanner, tree_state, Fixture, FsFixture};

#[test]
fn test_filesystem_round_trip() {
    let fixture = FsFixture::new();
    fixture.write("acme/acme.log", b"trace data");
    fixture.write("acme/notes.txt", b"unrelated");
    let before = tree_state(fixture.tree.as_ref(), &fixture.path("acme").to_string_lossy());

    let backups = tempfile::tempdir().unwrap();
    let manager = Arc::new(BackupManager::new(backups.path()).unwrap());
    let trees = TreeSet::new().with_tree(fixture.tree.clone());
    let cleaner = Cleaner::new(trees.clone(), Arc::new(SafetyPolicy::new()), running_controller("cleaner"))
        .with_backup_manager(manager.clone());

    let findings: Vec<_> = scanner(fixture.tree(), "acme", 5).scan(&fixture.root()).collect();
    let mut run = cleaner.clean(findings).unwrap();
    assert!(run.by_ref().all(|o| o.action == CleanAction::Deleted));
    let session = run.into_session().unwrap();
    assert!(!fixture.path("acme").exists());

    let reopened = manager.open_session(session.id()).unwrap();
    let report = manager.restore(&reopened, &trees);
    assert_eq!((report.restored, report.failed), (2, 0));

    assert_eq!(fs::read(fixture.path("acme/acme.log")).unwrap(), b"trace data");
    assert_eq!(fs::read(fixture.path("acme/notes.txt")).unwrap(), b"unrelated");
    assert_eq!(
        tree_state(fixture.tree.as_ref(), &fixture.path("acme").to_string_lossy()),
        before
    );

    // Second restore finds everything in place.
    let again = manager.restore(&reopened, &trees);
    assert_eq!((again.restored, again.failed, again.nodes_created), (2, 0, 0));
}

#[test]
fn test_store_round_trip_keeps_values() {
    let store = Arc::new(ConfigStore::new());
    let key = r"HKCU\Software\Acme";
    store.set_value(key, "InstallLocation", r"C:\Program Files\Acme").unwrap();
    store.set_value(key, "Build", AttrValue::Dword(42)).unwrap();
    store
        .set_value(&format!(r"{}\Plugins", key), "List", AttrValue::MultiStr(vec!["a".into(), "b".into()]))
        .unwrap();
    let before = tree_state(store.as_ref(), key);

    let backups = tempfile::tempdir().unwrap();
    let manager = Arc::new(BackupManager::new(backups.path()).unwrap());
    let trees = TreeSet::new().with_tree(store.clone());
    let cleaner = Cleaner::new(trees.clone(), Arc::new(SafetyPolicy::new()), running_controller("cleaner"))
        .with_options(CleanerOptions {
            force: true,
            ..CleanerOptions::default()
        })
        .with_backup_manager(manager.clone());

    let findings: Vec<_> = scanner(store.clone(), "acme", 5).scan(r"HKCU\Software").collect();
    assert_eq!(findings.len(), 1);
    let mut run = cleaner.clean(findings).unwrap();
    let outcomes: Vec<_> = run.by_ref().collect();
    assert_eq!(outcomes[0].action, CleanAction::Deleted);
    assert!(!store.exists(key).unwrap());

    let session = run.into_session().unwrap();
    let report = manager.restore(&session, &trees);
    assert_eq!(report.nodes_created, 2);
    assert_eq!(tree_state(store.as_ref(), key), before);
}

#[test]
fn test_sessions_survive_reopening() {
    let store = Arc::new(ConfigStore::new());
    store.insert_key(r"HKCU\Software\AcmeOne").unwrap();
    store.insert_key(r"HKCU\Software\AcmeTwo").unwrap();

    let backups = tempfile::tempdir().unwrap();
    let manager = Arc::new(BackupManager::new(backups.path()).unwrap());
    let cleaner = Cleaner::new(
        TreeSet::new().with_tree(store.clone()),
        Arc::new(SafetyPolicy::new()),
        running_controller("cleaner"),
    )
    .with_backup_manager(manager.clone());

    let findings: Vec<_> = scanner(store.clone(), "acme", 5).scan(r"HKCU\Software").collect();
    let mut run = cleaner.clean(findings).unwrap();
    run.by_ref().for_each(drop);
    let session = run.into_session().unwrap();

    let listed = manager.list_sessions().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, session.id());
    assert_eq!(listed[0].entries, 2);

    let entries = manager.open_session(session.id()).unwrap().entries();
    let originals: Vec<&str> = entries.iter().map(|e| e.original_path.as_str()).collect();
    assert_eq!(originals, vec![r"HKCU\Software\AcmeOne", r"HKCU\Software\AcmeTwo"]);
}
