// Traversal contract, checked against the filesystem and the configuration store

use std::sync::Arc;

use residue::controller::Counter;
use residue::scanner::SkipList;

use crate::common::{for_each_backend, scanner, Fixture};

fn build_layout(fixture: &dyn Fixture) {
    fixture.mkdir("acme/acme-data/acme-inner");
    fixture.mkdir("acme/zzz");
    fixture.mkdir("alpha/acme-one");
    fixture.mkdir("beta/acme-two");
}

fn scan_relative(fixture: &dyn Fixture, scanner: &residue::TreeScanner) -> Vec<String> {
    scanner
        .scan(&fixture.root())
        .map(|f| fixture.relative(&f.path))
        .collect()
}

#[test]
fn test_findings_in_pre_order() {
    for_each_backend(|fixture| {
        build_layout(fixture);
        let scanner = scanner(fixture.tree(), "acme", 10);
        assert_eq!(
            scan_relative(fixture, &scanner),
            vec![
                "acme",
                "acme/acme-data",
                "acme/acme-data/acme-inner",
                "alpha/acme-one",
                "beta/acme-two",
            ],
            "backend {}",
            fixture.label()
        );
    });
}

#[test]
fn test_depth_bound_is_a_hard_ceiling() {
    for_each_backend(|fixture| {
        build_layout(fixture);
        let scanner = scanner(fixture.tree(), "acme", 2);
        let findings: Vec<_> = scanner.scan(&fixture.root()).collect();

        assert!(findings.iter().all(|f| f.depth().unwrap() <= 2));
        let paths: Vec<String> = findings.iter().map(|f| fixture.relative(&f.path)).collect();
        assert!(!paths.contains(&"acme/acme-data/acme-inner".to_string()));
        // root, acme, acme-data, zzz, alpha, acme-one, beta, acme-two
        assert_eq!(scanner.controller().count(Counter::Scanned), 8, "backend {}", fixture.label());
    });
}

#[test]
fn test_zero_depth_visits_only_the_root() {
    for_each_backend(|fixture| {
        build_layout(fixture);
        let scanner = scanner(fixture.tree(), "acme", 0);
        assert!(scan_relative(fixture, &scanner).is_empty());
        assert_eq!(scanner.controller().count(Counter::Scanned), 1);
    });
}

#[test]
fn test_skip_listed_containers_are_never_descended() {
    for_each_backend(|fixture| {
        build_layout(fixture);
        let skips = SkipList::from_patterns(&["acme-data"]).unwrap();
        let scanner = scanner(fixture.tree(), "acme", 50).with_skip_list(Arc::new(skips));
        assert_eq!(
            scan_relative(fixture, &scanner),
            vec!["acme", "alpha/acme-one", "beta/acme-two"],
            "backend {}",
            fixture.label()
        );
    });
}

#[test]
fn test_glob_skips_apply_at_any_depth() {
    for_each_backend(|fixture| {
        build_layout(fixture);
        let skips = SkipList::from_patterns(&["a*"]).unwrap();
        let scanner = scanner(fixture.tree(), "acme", 50).with_skip_list(Arc::new(skips));
        assert_eq!(
            scan_relative(fixture, &scanner),
            Vec::<String>::new(),
            "backend {}",
            fixture.label()
        );
    });
}

#[test]
fn test_matches_do_not_prune_descent() {
    for_each_backend(|fixture| {
        fixture.mkdir("acme/plain/acme-nested");
        let scanner = scanner(fixture.tree(), "acme", 10);
        assert_eq!(
            scan_relative(fixture, &scanner),
            vec!["acme", "acme/plain/acme-nested"]
        );
    });
}

#[test]
fn test_missing_root_yields_nothing() {
    for_each_backend(|fixture| {
        let scanner = scanner(fixture.tree(), "acme", 10);
        let missing = fixture.tree().join(&fixture.root(), "does-not-exist");
        assert_eq!(scanner.scan(&missing).count(), 0);
        assert!(scanner.controller().errors().is_empty());
    });
}
