// Cleaner behaviour: ordering, idempotence, dry runs and the safety gate

use std::fs;
use std::sync::Arc;

use residue::resource::{ConfigStore, ResourceTree};
use residue::{
    BackupManager, CleanAction, CleanOutcome, Cleaner, CleanerOptions, SafetyPolicy, TreeSet,
};

use crate::common::{exists, running_controller, scanner, tree_state, FsFixture, Fixture};

fn fs_cleaner(fixture: &FsFixture, backups: &tempfile::TempDir, options: CleanerOptions) -> Cleaner {
    Cleaner::new(
        TreeSet::new().with_tree(fixture.tree.clone()),
        Arc::new(SafetyPolicy::new()),
        running_controller("cleaner"),
    )
    .with_options(options)
    .with_backup_manager(Arc::new(BackupManager::new(backups.path()).unwrap()))
}

/// A (container, matches), A/sub1 (leaf, matches), A/sub2 (leaf, no match)
fn scenario_layout() -> FsFixture {
    let fixture = FsFixture::new();
    fixture.write("acme/acme.log", b"trace data");
    fixture.write("acme/notes.txt", b"unrelated");
    fixture
}

#[test]
fn test_scenario_finds_matches_and_cleans_children_first() {
    let fixture = scenario_layout();
    let backups = tempfile::tempdir().unwrap();

    let findings: Vec<_> = scanner(fixture.tree(), "acme", 5).scan(&fixture.root()).collect();
    let found: Vec<String> = findings.iter().map(|f| fixture.relative(&f.path)).collect();
    assert_eq!(found, vec!["acme", "acme/acme.log"]);

    let cleaner = fs_cleaner(&fixture, &backups, CleanerOptions::default());
    let mut run = cleaner.clean(findings).unwrap();
    let outcomes: Vec<CleanOutcome> = run.by_ref().collect();

    let order: Vec<String> = outcomes.iter().map(|o| fixture.relative(&o.target)).collect();
    assert_eq!(order, vec!["acme/acme.log", "acme"]);
    assert!(outcomes
        .iter()
        .all(|o| o.action == CleanAction::Deleted && o.success));
    assert_eq!(outcomes[0].bytes_freed, 10);
    assert!(!exists(&fixture.path("acme")));

    let session = run.into_session().unwrap();
    assert_eq!(session.len(), 2);
}

#[test]
fn test_cleaning_twice_reports_already_gone() {
    let fixture = scenario_layout();
    let backups = tempfile::tempdir().unwrap();
    let findings: Vec<_> = scanner(fixture.tree(), "acme", 5).scan(&fixture.root()).collect();
    let cleaner = fs_cleaner(&fixture, &backups, CleanerOptions::default());

    let first: Vec<_> = cleaner.clean(findings.clone()).unwrap().collect();
    assert!(first.iter().all(|o| o.success));

    let second: Vec<_> = cleaner.clean(findings).unwrap().collect();
    assert_eq!(second.len(), 2);
    for outcome in second {
        assert_eq!(outcome.action, CleanAction::AlreadyGone);
        assert!(outcome.success);
        assert_eq!(outcome.bytes_freed, 0);
    }
}

#[test]
fn test_dry_run_never_mutates() {
    let fixture = scenario_layout();
    fixture.write("acme/deeper/acme.cfg", b"x=1");
    let before = tree_state(fixture.tree.as_ref(), &fixture.root());

    let findings: Vec<_> = scanner(fixture.tree(), "acme", 5).scan(&fixture.root()).collect();
    let cleaner = Cleaner::new(
        TreeSet::new().with_tree(fixture.tree.clone()),
        Arc::new(SafetyPolicy::new()),
        running_controller("cleaner"),
    )
    .with_options(CleanerOptions {
        dry_run: true,
        force: true,
        ..CleanerOptions::default()
    });
    let outcomes: Vec<_> = cleaner.clean(findings).unwrap().collect();

    assert!(!outcomes.is_empty());
    assert!(outcomes
        .iter()
        .all(|o| o.action == CleanAction::Simulated && o.success && o.bytes_freed == 0));
    assert_eq!(tree_state(fixture.tree.as_ref(), &fixture.root()), before);
}

#[test]
fn test_backups_enabled_without_manager_is_rejected() {
    let fixture = FsFixture::new();
    let cleaner = Cleaner::new(
        TreeSet::new().with_tree(fixture.tree.clone()),
        Arc::new(SafetyPolicy::new()),
        running_controller("cleaner"),
    );
    assert!(cleaner.clean(Vec::new()).err().unwrap().is_config_error());
}

#[test]
fn test_backup_failure_keeps_the_resource() {
    let fixture = scenario_layout();
    let backups = tempfile::tempdir().unwrap();
    let findings: Vec<_> = scanner(fixture.tree(), "acme", 5).scan(&fixture.root()).collect();
    let cleaner = fs_cleaner(&fixture, &backups, CleanerOptions::default());

    // Backup root disappears and is replaced by a file: sessions cannot be created.
    fs::remove_dir_all(backups.path()).unwrap();
    fs::write(backups.path(), b"not a directory").unwrap();

    let outcomes: Vec<_> = cleaner.clean(findings).unwrap().collect();
    assert!(outcomes.iter().all(|o| o.action == CleanAction::Failed && !o.success));
    assert!(exists(&fixture.path("acme/acme.log")));
    assert!(exists(&fixture.path("acme/notes.txt")));

    fs::remove_file(backups.path()).unwrap();
}

#[test]
fn test_protected_paths_are_skipped_under_every_flag() {
    let store = Arc::new(ConfigStore::new());
    store
        .insert_key(r"HKLM\SOFTWARE\Policies\Acme\Rules")
        .unwrap();
    let findings: Vec<_> = scanner(store.clone(), "acme", 5)
        .scan(r"HKLM\SOFTWARE\Policies")
        .collect();
    assert_eq!(findings.len(), 1);
    assert!(!findings[0].can_delete);

    let backups = tempfile::tempdir().unwrap();
    for dry_run in [false, true] {
        for force in [false, true] {
            let cleaner = Cleaner::new(
                TreeSet::new().with_tree(store.clone()),
                Arc::new(SafetyPolicy::new()),
                running_controller("cleaner"),
            )
            .with_options(CleanerOptions {
                dry_run,
                force,
                ..CleanerOptions::default()
            })
            .with_backup_manager(Arc::new(BackupManager::new(backups.path()).unwrap()));

            // Even a finding that claims to be deletable is refused.
            let mut forged = findings[0].clone();
            forged.can_delete = true;
            for outcome in cleaner.clean(vec![forged, findings[0].clone()]).unwrap() {
                assert_eq!(outcome.action, CleanAction::Skip);
                assert!(!outcome.success);
            }
        }
    }
    assert!(store.exists(r"HKLM\SOFTWARE\Policies\Acme").unwrap());
}

#[test]
fn test_protected_descendant_blocks_parent_removal() {
    let fixture = scenario_layout();
    let backups = tempfile::tempdir().unwrap();
    let guarded = fixture.path("acme/notes.txt").to_string_lossy().into_owned();
    let findings: Vec<_> = scanner(fixture.tree(), "acme", 5).scan(&fixture.root()).collect();

    let cleaner = Cleaner::new(
        TreeSet::new().with_tree(fixture.tree.clone()),
        Arc::new(SafetyPolicy::new().with_protected(residue::BackendKind::Filesystem, [guarded])),
        running_controller("cleaner"),
    )
    .with_backup_manager(Arc::new(BackupManager::new(backups.path()).unwrap()));

    let outcomes: Vec<_> = cleaner.clean(findings).unwrap().collect();
    assert_eq!(outcomes[0].action, CleanAction::Deleted);
    assert_eq!(outcomes[1].action, CleanAction::Skip);
    assert!(exists(&fixture.path("acme/notes.txt")));
}
