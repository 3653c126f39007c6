//! `Sweep`: one target, wired end to end.
//!
//! Builds the trees, safety policy, analyzer, controllers, executor, backup
//! manager and cleaner from a [`Config`], then exposes the run-level
//! operations the command-line driver needs.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::analyzer::{AliasTable, PatternAnalyzer};
use crate::backup::{BackupManager, RestoreReport, SessionSummary};
use crate::cleaner::{CleanRun, Cleaner, SystemProcessStopper};
use crate::config::Config;
use crate::controller::{ModuleController, ProgressObserver};
use crate::error::{ResidueError, Result};
use crate::executor::{ParallelExecutor, Task, TaskReport, TaskStream};
use crate::model::ScanFinding;
use crate::report::RunReport;
use crate::resource::{
    BackendKind, ConfigStore, FlushReport, InstalledProgram, LocalTree, RebootQueue, TreeSet,
};
use crate::safety::SafetyPolicy;
use crate::scanner::{ScanStop, SkipList, TreeScanner};

pub const CLEANER_MODULE: &str = "cleaner";

pub struct Sweep {
    config: Config,
    target: String,
    trees: TreeSet,
    store: Option<Arc<ConfigStore>>,
    reboot: Option<Arc<RebootQueue>>,
    safety: Arc<SafetyPolicy>,
    analyzer: Arc<PatternAnalyzer>,
    scanners: Vec<TreeScanner>,
    cleaner: Arc<ModuleController>,
    executor: ParallelExecutor,
}

impl Sweep {
    /// Local filesystem plus the configuration store named by `store_file`.
    pub fn from_config(config: Config, target: &str) -> Result<Self> {
        config.validate()?;

        let reboot = Arc::new(RebootQueue::new(&config.reboot_queue_file));
        let local = LocalTree::new()
            .with_io_timeout(config.io_timeout())
            .with_reboot_queue(reboot.clone());

        let store = match &config.store_file {
            Some(path) if path.exists() => ConfigStore::load(path)?.with_persist_path(path),
            Some(path) => ConfigStore::new().with_persist_path(path),
            None => ConfigStore::new(),
        };
        let store = Arc::new(store);

        let trees = TreeSet::new()
            .with_tree(Arc::new(local))
            .with_tree(store.clone());
        let mut sweep = Self::with_trees(config, target, trees)?;
        sweep.store = Some(store);
        sweep.reboot = Some(reboot);
        Ok(sweep)
    }

    /// Caller-supplied trees; no reboot queue or store lookups.
    pub fn with_trees(config: Config, target: &str, trees: TreeSet) -> Result<Self> {
        config.validate()?;

        let mut aliases = AliasTable::builtin();
        aliases.merge(&config.aliases);
        let analyzer = Arc::new(PatternAnalyzer::for_target(target, &aliases)?);

        let safety = Arc::new(
            SafetyPolicy::new()
                .with_protected(BackendKind::Filesystem, &config.extra_protected.filesystem)
                .with_protected(BackendKind::ConfigStore, &config.extra_protected.store),
        );

        let mut scanners = Vec::new();
        for kind in trees.kinds() {
            let Some(tree) = trees.get(kind) else {
                continue;
            };
            let extra = match kind {
                BackendKind::Filesystem => &config.extra_skips.filesystem,
                BackendKind::ConfigStore => &config.extra_skips.store,
            };
            let skips = SkipList::defaults_for(kind).with_extra(extra)?;
            let controller = Arc::new(ModuleController::new(kind.short_name()));
            controller.initialize()?;
            scanners.push(
                TreeScanner::new(tree.clone(), analyzer.clone(), safety.clone(), controller)
                    .with_depth(config.depth)
                    .with_skip_list(Arc::new(skips)),
            );
        }

        let cleaner = Arc::new(ModuleController::new(CLEANER_MODULE));
        cleaner.initialize()?;

        let executor = ParallelExecutor::new(config.max_workers)?
            .with_default_timeout(config.task_timeout());

        tracing::info!(
            subject = target,
            backends = scanners.len(),
            workers = config.max_workers,
            depth = ?config.depth,
            "sweep configured"
        );

        Ok(Self {
            config,
            target: target.to_string(),
            trees,
            store: None,
            reboot: None,
            safety,
            analyzer,
            scanners,
            cleaner,
            executor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn trees(&self) -> &TreeSet {
        &self.trees
    }

    pub fn safety(&self) -> &Arc<SafetyPolicy> {
        &self.safety
    }

    pub fn analyzer(&self) -> &Arc<PatternAnalyzer> {
        &self.analyzer
    }

    pub fn controller(&self, backend: BackendKind) -> Option<&Arc<ModuleController>> {
        self.scanners
            .iter()
            .find(|s| s.backend() == backend)
            .map(TreeScanner::controller)
    }

    pub fn cleaner_controller(&self) -> &Arc<ModuleController> {
        &self.cleaner
    }

    fn controllers(&self) -> impl Iterator<Item = &Arc<ModuleController>> {
        self.scanners
            .iter()
            .map(TreeScanner::controller)
            .chain(std::iter::once(&self.cleaner))
    }

    /// Install one progress observer on every module.
    pub fn set_observer(&self, observer: ProgressObserver) {
        for controller in self.controllers() {
            controller.set_observer(observer.clone());
        }
    }

    pub fn cancel(&self) {
        for controller in self.controllers() {
            controller.cancel();
        }
    }

    pub fn pause(&self) {
        for controller in self.controllers() {
            if controller.state().is_active() {
                let _ = controller.pause();
            }
        }
    }

    pub fn resume(&self) {
        for controller in self.controllers() {
            let _ = controller.resume();
        }
    }

    // ========== Scan ==========

    /// Registered programs whose display name matches the target.
    pub fn matching_programs(&self) -> Vec<InstalledProgram> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        let signature = self.analyzer.signature();
        store
            .installed_programs()
            .into_iter()
            .filter(|p| signature.matches(&p.display_name.to_lowercase()))
            .collect()
    }

    /// Configured roots per backend, plus install locations of matching programs.
    pub fn roots(&self, backend: BackendKind) -> Vec<String> {
        let mut roots: Vec<String> = match backend {
            BackendKind::Filesystem => self
                .config
                .roots
                .filesystem
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            BackendKind::ConfigStore => self.config.roots.store.clone(),
        };
        if backend == BackendKind::Filesystem {
            for program in self.matching_programs() {
                if let Some(location) = program.install_location.filter(|l| Path::new(l).is_absolute()) {
                    tracing::debug!(program = %program.display_name, location, "adding install location");
                    roots.push(location);
                }
            }
        }

        let mut seen = HashSet::new();
        roots.retain(|r| seen.insert(SafetyPolicy::normalize(backend, r)));
        roots
    }

    /// Start scanning every root of every backend. Roots run in parallel;
    /// findings come back lazily.
    pub fn scan(&self) -> Result<ScanRun> {
        let mut streams = Vec::new();
        let mut next_id = 0;
        for scanner in &self.scanners {
            let controller = scanner.controller().clone();
            controller.reset()?;
            controller.run()?;

            let backend = scanner.backend();
            let mut tasks = Vec::new();
            for root in self.roots(backend) {
                let Some(tree) = self.trees.get(backend) else {
                    continue;
                };
                match tree.exists(&root) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(root, "root does not exist, skipping");
                        continue;
                    }
                    Err(e) => {
                        controller.record_error(&root, &e);
                        continue;
                    }
                }
                tasks.push(scan_task(next_id, scanner.clone(), root));
                next_id += 1;
            }
            let stream = self
                .executor
                .submit(tasks, controller.token())
                .with_progress(controller.clone());
            streams.push((controller, stream));
        }
        tracing::info!(subject = %self.target, tasks = next_id, "scan started");
        Ok(ScanRun {
            streams,
            current: 0,
            finished: Vec::new(),
        })
    }

    // ========== Clean ==========

    pub fn backup_manager(&self) -> Result<Arc<BackupManager>> {
        Ok(Arc::new(BackupManager::new(&self.config.backup_dir)?))
    }

    pub fn clean(&self, findings: Vec<ScanFinding>) -> Result<CleanRun> {
        let options = self.config.cleaner_options();
        let mut cleaner = Cleaner::new(self.trees.clone(), self.safety.clone(), self.cleaner.clone())
            .with_options(options.clone())
            .with_process_stopper(Arc::new(SystemProcessStopper));
        if options.backups_required() {
            cleaner = cleaner.with_backup_manager(self.backup_manager()?);
        }
        cleaner.validate()?;

        self.cleaner.reset()?;
        self.cleaner.run()?;
        cleaner.clean(findings)
    }

    // ========== Sessions ==========

    pub fn sessions(&self) -> Result<Vec<SessionSummary>> {
        self.backup_manager()?.list_sessions()
    }

    pub fn restore(&self, session_id: &str) -> Result<RestoreReport> {
        let manager = self.backup_manager()?;
        let session = manager.open_session(session_id)?;
        Ok(manager.restore(&session, &self.trees))
    }

    /// Apply deletions deferred by earlier runs.
    pub fn flush_deferred(&self) -> Result<FlushReport> {
        match &self.reboot {
            Some(queue) => queue.flush(),
            None => Err(ResidueError::unsupported(
                BackendKind::Filesystem.short_name(),
                "deferred deletion",
            )),
        }
    }

    /// Counters and recorded errors of every module.
    pub fn collect_stats(&self, report: &mut RunReport) {
        for controller in self.controllers() {
            report.add_module(controller.stats(), controller.errors());
        }
    }
}

fn scan_task(id: usize, scanner: TreeScanner, root: String) -> Task<ScanFinding> {
    let label = format!("{}:{}", scanner.backend().short_name(), root);
    Task::new(id, label, move |ctx, emit| {
        let mut iter = scanner.scan_with(&root, ctx.token.clone(), ctx.deadline);
        for finding in iter.by_ref() {
            emit(finding);
        }
        match iter.stopped() {
            None => Ok(()),
            Some(ScanStop::Cancelled) => Err(ResidueError::Cancelled),
            Some(ScanStop::DeadlineExceeded) => Err(ResidueError::Timeout {
                what: format!("scan of {}", root),
                limit: ctx.timeout().unwrap_or_default(),
            }),
        }
    })
}

/// Findings from every backend's scan.
pub struct ScanRun {
    streams: Vec<(Arc<ModuleController>, TaskStream<ScanFinding>)>,
    current: usize,
    finished: Vec<TaskReport>,
}

impl ScanRun {
    /// Per-root task outcomes so far.
    pub fn report(&self) -> TaskReport {
        let mut report = TaskReport::default();
        for done in &self.finished {
            report.outcomes.extend(done.outcomes.iter().cloned());
        }
        for (_, stream) in &self.streams[self.current.min(self.streams.len())..] {
            report.outcomes.extend(stream.report().outcomes);
        }
        report.outcomes.sort_by_key(|o| o.id);
        report
    }
}

impl Iterator for ScanRun {
    type Item = ScanFinding;

    fn next(&mut self) -> Option<ScanFinding> {
        while let Some((controller, stream)) = self.streams.get_mut(self.current) {
            if let Some((_, finding)) = stream.next() {
                return Some(finding);
            }
            self.finished.push(stream.report());
            if controller.state().is_active() {
                if let Err(e) = controller.complete() {
                    tracing::debug!(error = %e, "scan module already finished");
                }
            }
            self.current += 1;
        }
        None
    }
}
