//! Cleaner: turns findings into removals, under the safety policy and with a
//! backup taken first.
//!
//! `Cleaner::clean` validates its configuration up front and returns a lazy
//! [`CleanRun`]. Each finding is handled in isolation: whatever goes wrong
//! with one resource ends up in that resource's [`CleanOutcome`] and the run
//! moves on.

pub mod process;

pub use process::{ProcessStopper, SystemProcessStopper};

use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::backup::{BackupManager, BackupSession};
use crate::controller::{Counter, ModuleController};
use crate::error::{ErrorKind, ResidueError, Result};
use crate::model::{CleanAction, CleanOutcome, ScanFinding};
use crate::resource::{BackendKind, NodeKind, ResourceTree, TreeSet};
use crate::safety::SafetyPolicy;

#[derive(Debug, Clone)]
pub struct CleanerOptions {
    pub dry_run: bool,
    /// Clean findings below `min_confidence` and stop busy processes forcefully
    pub force: bool,
    pub create_backup: bool,
    pub min_confidence: f32,
    pub stop_timeout: Duration,
}

impl Default for CleanerOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            force: false,
            create_backup: true,
            min_confidence: 0.3,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl CleanerOptions {
    pub fn backups_required(&self) -> bool {
        self.create_backup && !self.dry_run
    }
}

#[derive(Clone)]
pub struct Cleaner {
    trees: TreeSet,
    safety: Arc<SafetyPolicy>,
    controller: Arc<ModuleController>,
    backup: Option<Arc<BackupManager>>,
    stopper: Option<Arc<dyn ProcessStopper>>,
    options: CleanerOptions,
}

impl Cleaner {
    pub fn new(trees: TreeSet, safety: Arc<SafetyPolicy>, controller: Arc<ModuleController>) -> Self {
        Self {
            trees,
            safety,
            controller,
            backup: None,
            stopper: None,
            options: CleanerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CleanerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_backup_manager(mut self, manager: Arc<BackupManager>) -> Self {
        self.backup = Some(manager);
        self
    }

    pub fn with_process_stopper(mut self, stopper: Arc<dyn ProcessStopper>) -> Self {
        self.stopper = Some(stopper);
        self
    }

    pub fn options(&self) -> &CleanerOptions {
        &self.options
    }

    pub fn controller(&self) -> &Arc<ModuleController> {
        &self.controller
    }

    /// Configuration errors that must stop a run before anything is touched.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.options.min_confidence) {
            return Err(ResidueError::InvalidConfig {
                message: format!(
                    "min_confidence {} is outside [0, 1]",
                    self.options.min_confidence
                ),
            });
        }
        if self.options.backups_required() && self.backup.is_none() {
            return Err(ResidueError::InvalidConfig {
                message: "backups are enabled but no backup manager is configured".to_string(),
            });
        }
        Ok(())
    }

    /// Start cleaning. Findings are de-duplicated and ordered so that
    /// children are handled before their parents.
    pub fn clean(&self, findings: Vec<ScanFinding>) -> Result<CleanRun> {
        self.validate()?;

        let mut seen = HashSet::new();
        let mut queue: Vec<(usize, ScanFinding)> = Vec::with_capacity(findings.len());
        for finding in findings {
            let key = (
                finding.backend,
                SafetyPolicy::normalize(finding.backend, &finding.path),
            );
            if !seen.insert(key) {
                continue;
            }
            let depth = match self.trees.get(finding.backend) {
                Some(tree) => tree.depth_of(&finding.path),
                None => 0,
            };
            queue.push((depth, finding));
        }
        queue.sort_by(|(da, a), (db, b)| db.cmp(da).then_with(|| a.path.cmp(&b.path)));

        tracing::info!(
            findings = queue.len(),
            dry_run = self.options.dry_run,
            force = self.options.force,
            "clean started"
        );
        Ok(CleanRun {
            cleaner: self.clone(),
            queue: queue.into_iter().map(|(_, f)| f).collect(),
            session: None,
            deferred: HashSet::new(),
        })
    }
}

/// How one node's removal ended.
enum Removal {
    Deleted,
    Gone,
    Deferred,
}

struct Target {
    path: String,
    kind: NodeKind,
    size: u64,
}

/// Lazy sequence of outcomes, one per distinct finding.
pub struct CleanRun {
    cleaner: Cleaner,
    queue: VecDeque<ScanFinding>,
    session: Option<Arc<BackupSession>>,
    deferred: HashSet<(BackendKind, String)>,
}

impl CleanRun {
    /// Backup session opened by this run, if any snapshot was needed.
    pub fn session(&self) -> Option<&Arc<BackupSession>> {
        self.session.as_ref()
    }

    pub fn into_session(self) -> Option<Arc<BackupSession>> {
        self.session
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    fn process(&mut self, finding: &ScanFinding) -> CleanOutcome {
        let options = self.cleaner.options.clone();

        let Some(tree) = self.cleaner.trees.get(finding.backend).cloned() else {
            return CleanOutcome::new(finding, CleanAction::Failed, false, "no tree for backend")
                .with_error(ErrorKind::Unsupported);
        };

        if self.cleaner.safety.is_protected(finding.backend, &finding.path) {
            return CleanOutcome::new(finding, CleanAction::Skip, false, "protected resource")
                .with_error(ErrorKind::ProtectedResource);
        }
        if !finding.can_delete {
            return CleanOutcome::new(finding, CleanAction::Skip, false, "marked as not deletable");
        }
        if finding.confidence < options.min_confidence && !options.force {
            return CleanOutcome::new(
                finding,
                CleanAction::Skip,
                false,
                format!(
                    "confidence {:.2} below threshold {:.2}",
                    finding.confidence, options.min_confidence
                ),
            );
        }
        if options.dry_run {
            return CleanOutcome::new(
                finding,
                CleanAction::Simulated,
                true,
                format!(
                    "would remove {} ({})",
                    finding.item_type,
                    humansize::format_size(finding.size, humansize::BINARY)
                ),
            );
        }

        match tree.exists(&finding.path) {
            Ok(true) => {}
            Ok(false) => {
                return CleanOutcome::new(finding, CleanAction::AlreadyGone, true, "already gone")
            }
            Err(e) => return self.failed(finding, &e),
        }

        let targets = match self.collect_targets(tree.as_ref(), finding) {
            Ok(targets) => targets,
            Err(e) if e.kind() == ErrorKind::ProtectedResource => {
                return CleanOutcome::new(finding, CleanAction::Skip, false, e.to_string())
                    .with_error(ErrorKind::ProtectedResource)
            }
            Err(e) => return self.failed(finding, &e),
        };

        if options.create_backup {
            if let Err(e) = self.snapshot(tree.as_ref(), &finding.path) {
                return self.failed(finding, &e);
            }
        }

        let mut bytes_freed = 0u64;
        let mut any_deferred = false;
        // Pre-order reversed: every child before its parent.
        for target in targets.iter().rev() {
            match self.remove(tree.as_ref(), target) {
                Ok(Removal::Deleted) => bytes_freed += target.size,
                Ok(Removal::Gone) => {}
                Ok(Removal::Deferred) => any_deferred = true,
                Err(e) => {
                    let mut outcome = self.failed(finding, &e);
                    outcome.bytes_freed = bytes_freed;
                    return outcome;
                }
            }
        }

        if any_deferred {
            CleanOutcome::new(
                finding,
                CleanAction::Deferred,
                true,
                "scheduled for deletion at next restart",
            )
            .with_bytes(bytes_freed)
        } else {
            CleanOutcome::new(finding, CleanAction::Deleted, true, "removed").with_bytes(bytes_freed)
        }
    }

    /// The finding's subtree in pre-order. Refuses when a protected node sits below it.
    fn collect_targets(&self, tree: &dyn ResourceTree, finding: &ScanFinding) -> Result<Vec<Target>> {
        let mut targets = Vec::new();
        let mut stack = vec![finding.path.clone()];
        while let Some(path) = stack.pop() {
            let node = tree.open(&path)?;
            if self.cleaner.safety.is_protected(finding.backend, &path) {
                return Err(ResidueError::ProtectedResource { path });
            }
            if node.is_container() {
                for child in tree.list_children(&path)?.iter().rev() {
                    stack.push(tree.join(&path, child));
                }
            }
            targets.push(Target {
                path,
                kind: node.kind,
                size: node.size,
            });
        }
        Ok(targets)
    }

    fn snapshot(&mut self, tree: &dyn ResourceTree, path: &str) -> Result<()> {
        if self.session.is_none() {
            let manager = self.cleaner.backup.as_ref().ok_or_else(|| ResidueError::InvalidConfig {
                message: "no backup manager".to_string(),
            })?;
            self.session = Some(manager.start_session()?);
        }
        if let Some(session) = &self.session {
            session.snapshot(tree, path)?;
        }
        Ok(())
    }

    fn remove(&mut self, tree: &dyn ResourceTree, target: &Target) -> Result<Removal> {
        let backend = tree.kind();
        if target.kind == NodeKind::Container && self.has_deferred_below(tree, &target.path) {
            return self.defer(tree, target);
        }

        let err = match tree.delete(&target.path) {
            Ok(()) => return Ok(Removal::Deleted),
            Err(e) => e,
        };

        match err.kind() {
            ErrorKind::NotFound => Ok(Removal::Gone),
            ErrorKind::PermissionDenied => {
                if tree.try_elevate(&target.path) {
                    match tree.delete(&target.path) {
                        Ok(()) => return Ok(Removal::Deleted),
                        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Removal::Gone),
                        Err(e) if e.kind() != ErrorKind::PermissionDenied => return Err(e),
                        Err(_) => {}
                    }
                }
                if target.kind == NodeKind::Leaf && tree.capabilities().deferred_delete {
                    return self.defer(tree, target);
                }
                Err(err)
            }
            ErrorKind::BusyInUse if backend == BackendKind::Filesystem => {
                if let Some(stopper) = &self.cleaner.stopper {
                    let options = &self.cleaner.options;
                    match stopper.stop_holders(
                        Path::new(&target.path),
                        options.force,
                        options.stop_timeout,
                    ) {
                        Ok(n) => tracing::debug!(path = %target.path, stopped = n, "stopped holders"),
                        Err(e) => tracing::debug!(path = %target.path, error = %e, "could not stop holders"),
                    }
                }
                match tree.delete(&target.path) {
                    Ok(()) => Ok(Removal::Deleted),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(Removal::Gone),
                    Err(e) => Err(e),
                }
            }
            _ => Err(err),
        }
    }

    fn defer(&mut self, tree: &dyn ResourceTree, target: &Target) -> Result<Removal> {
        tree.schedule_delete_on_reboot(&target.path)?;
        let backend = tree.kind();
        self.deferred
            .insert((backend, SafetyPolicy::normalize(backend, &target.path)));
        Ok(Removal::Deferred)
    }

    fn has_deferred_below(&self, tree: &dyn ResourceTree, path: &str) -> bool {
        let backend = tree.kind();
        let base = SafetyPolicy::normalize(backend, path);
        let separator = match backend {
            BackendKind::Filesystem => '/',
            BackendKind::ConfigStore => '\\',
        };
        self.deferred.iter().any(|(b, p)| {
            *b == backend && p.len() > base.len() && p.starts_with(&base) && p[base.len()..].starts_with(separator)
        })
    }

    fn failed(&self, finding: &ScanFinding, err: &ResidueError) -> CleanOutcome {
        self.cleaner.controller.record_error(&finding.path, err);
        CleanOutcome::new(finding, CleanAction::Failed, false, err.to_string()).with_error(err.kind())
    }

    fn record(&self, outcome: &CleanOutcome) {
        let controller = &self.cleaner.controller;
        match outcome.action {
            CleanAction::Deleted | CleanAction::Deferred => {
                controller.bump(Counter::Cleaned);
                controller.add_bytes_freed(outcome.bytes_freed);
            }
            CleanAction::Failed => controller.bump(Counter::Failed),
            CleanAction::Skip => controller.bump(Counter::Skipped),
            CleanAction::Simulated | CleanAction::AlreadyGone => {}
        }
        if outcome.action == CleanAction::Failed {
            tracing::debug!(target_path = %outcome.target, message = %outcome.message, "clean failed");
        }
    }
}

impl Iterator for CleanRun {
    type Item = CleanOutcome;

    fn next(&mut self) -> Option<CleanOutcome> {
        if self.cleaner.controller.checkpoint().is_err() {
            self.queue.clear();
            return None;
        }
        let Some(finding) = self.queue.pop_front() else {
            let controller = &self.cleaner.controller;
            if controller.state().is_active() {
                if let Err(e) = controller.complete() {
                    tracing::debug!(error = %e, "cleaner already finished");
                }
            }
            return None;
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.process(&finding))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                self.cleaner
                    .controller
                    .record_panic(&finding.path, payload.as_ref());
                CleanOutcome::new(&finding, CleanAction::Failed, false, "panicked while cleaning")
                    .with_error(ErrorKind::Io)
            }
        };
        self.record(&outcome);
        Some(outcome)
    }
}
