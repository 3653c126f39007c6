//! Bounded-depth tree scanner.
//!
//! `TreeScanner::scan` returns a lazy iterator that walks one resource tree
//! depth-first in pre-order with an explicit work stack. Every visited node is
//! tested by the analyzer; matches are yielded as [`ScanFinding`]s and descent
//! continues below them. Per-node failures never end the walk: permission
//! errors and vanished nodes are skipped, anything else is recorded on the
//! controller and the scan moves on to the next sibling.

pub mod skip;

pub use skip::SkipList;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::analyzer::{PatternAnalyzer, Surface};
use crate::controller::{CancellationToken, Counter, ModuleController};
use crate::error::{ErrorKind, ResidueError, Result};
use crate::model::ScanFinding;
use crate::resource::{BackendKind, ResourceNode, ResourceTree};
use crate::safety::SafetyPolicy;

/// Scan profile; each level is a hard ceiling on descent below the root.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ScanDepth {
    Quick,
    #[default]
    Standard,
    Deep,
    Forensic,
}

impl ScanDepth {
    pub fn max_depth(&self) -> usize {
        match self {
            ScanDepth::Quick => 2,
            ScanDepth::Standard => 5,
            ScanDepth::Deep => 15,
            ScanDepth::Forensic => 50,
        }
    }
}

#[derive(Clone)]
pub struct TreeScanner {
    module: String,
    tree: Arc<dyn ResourceTree>,
    analyzer: Arc<PatternAnalyzer>,
    safety: Arc<SafetyPolicy>,
    skips: Arc<SkipList>,
    controller: Arc<ModuleController>,
    max_depth: usize,
    measure_size: bool,
}

impl TreeScanner {
    pub fn new(
        tree: Arc<dyn ResourceTree>,
        analyzer: Arc<PatternAnalyzer>,
        safety: Arc<SafetyPolicy>,
        controller: Arc<ModuleController>,
    ) -> Self {
        let backend = tree.kind();
        Self {
            module: controller.name().to_string(),
            skips: Arc::new(SkipList::defaults_for(backend)),
            max_depth: ScanDepth::default().max_depth(),
            measure_size: true,
            tree,
            analyzer,
            safety,
            controller,
        }
    }

    pub fn with_depth(mut self, depth: ScanDepth) -> Self {
        self.max_depth = depth.max_depth();
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_skip_list(mut self, skips: Arc<SkipList>) -> Self {
        self.skips = skips;
        self
    }

    /// Report subtree totals for container findings (one extra walk per match).
    pub fn with_size_measurement(mut self, enabled: bool) -> Self {
        self.measure_size = enabled;
        self
    }

    pub fn backend(&self) -> BackendKind {
        self.tree.kind()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn controller(&self) -> &Arc<ModuleController> {
        &self.controller
    }

    /// Walk `root` under the controller's current token.
    pub fn scan(&self, root: &str) -> ScanIter {
        self.scan_with(root, self.controller.token(), None)
    }

    /// Walk `root`, stopping when `token` fires or `deadline` passes.
    pub fn scan_with(
        &self,
        root: &str,
        token: CancellationToken,
        deadline: Option<Instant>,
    ) -> ScanIter {
        tracing::debug!(module = %self.module, root, max_depth = self.max_depth, "scan started");
        ScanIter {
            scanner: self.clone(),
            stack: vec![(root.to_string(), 0)],
            token,
            deadline,
            stop: None,
        }
    }

    fn build_finding(&self, node: &ResourceNode, depth: usize, surface: &Surface<'_>) -> Option<ScanFinding> {
        let analysis = self.analyzer.analyze(surface);
        if !analysis.matched {
            return None;
        }

        let backend = self.tree.kind();
        let protected = self.safety.is_protected(backend, &node.path);
        let size = if node.is_container() && self.measure_size {
            self.tree.subtree_size(&node.path)
        } else {
            node.size
        };

        let mut details: BTreeMap<String, Value> = BTreeMap::new();
        details.insert("depth".into(), json!(depth));
        details.insert("evidence".into(), json!(analysis.hits));
        details.insert("categories".into(), json!(analysis.categories));
        if protected {
            details.insert("protected".into(), json!(true));
        }
        match backend {
            BackendKind::ConfigStore => {
                let values: Vec<&String> = node.attributes.keys().collect();
                details.insert("values".into(), json!(values));
            }
            BackendKind::Filesystem if !node.is_container() => {
                if let Some((_, ext)) = node.name.rsplit_once('.') {
                    details.insert("extension".into(), json!(ext.to_lowercase()));
                }
            }
            BackendKind::Filesystem => {}
        }

        Some(ScanFinding {
            module: self.module.clone(),
            backend,
            item_type: backend.item_type(node.kind).to_string(),
            path: node.path.clone(),
            name: node.name.clone(),
            size,
            details,
            confidence: analysis.confidence,
            can_delete: !protected,
            risk_level: self.analyzer.assess_risk(surface, analysis.confidence),
        })
    }
}

/// Why a scan ended before exhausting its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    Cancelled,
    DeadlineExceeded,
}

/// Lazy, single-pass scan of one root.
pub struct ScanIter {
    scanner: TreeScanner,
    stack: Vec<(String, usize)>,
    token: CancellationToken,
    deadline: Option<Instant>,
    stop: Option<ScanStop>,
}

impl ScanIter {
    pub fn stopped(&self) -> Option<ScanStop> {
        self.stop
    }

    fn interrupted(&mut self) -> bool {
        if self.stop.is_some() {
            return true;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.stop = Some(ScanStop::DeadlineExceeded);
        } else if self
            .scanner
            .controller
            .pause_gate()
            .wait(&self.token)
            .is_err()
        {
            self.stop = Some(ScanStop::Cancelled);
        }
        if self.stop.is_some() {
            self.stack.clear();
            return true;
        }
        false
    }

    fn visit(&mut self, path: &str, depth: usize) -> Result<Option<ScanFinding>> {
        let scanner = &self.scanner;
        let node = scanner.tree.open(path)?;

        if depth > 0 && node.is_container() && scanner.skips.is_skipped(&node.name) {
            tracing::trace!(path, "skip-listed container");
            return Ok(None);
        }
        scanner.controller.bump(Counter::Scanned);

        let surface = Surface::of(scanner.tree.kind(), &node);
        let finding = scanner.build_finding(&node, depth, &surface);
        if finding.is_some() {
            scanner.controller.bump(Counter::Found);
        }

        if node.is_container() && depth < scanner.max_depth {
            match scanner.tree.list_children(path) {
                Ok(children) => {
                    // Reversed so the smallest name is popped first.
                    for child in children.iter().rev() {
                        self.stack
                            .push((scanner.tree.join(path, child), depth + 1));
                    }
                }
                Err(e) => self.note_error(path, &e),
            }
        }

        Ok(finding)
    }

    fn note_error(&self, path: &str, err: &ResidueError) {
        let controller = &self.scanner.controller;
        match err.kind() {
            ErrorKind::PermissionDenied => {
                controller.bump(Counter::Denied);
                tracing::trace!(path, "access denied, skipping");
            }
            ErrorKind::NotFound => tracing::trace!(path, "vanished during scan"),
            _ => controller.record_error(path, err),
        }
    }
}

impl Iterator for ScanIter {
    type Item = ScanFinding;

    fn next(&mut self) -> Option<ScanFinding> {
        loop {
            if self.interrupted() {
                return None;
            }
            let (path, depth) = self.stack.pop()?;

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.visit(&path, depth)));
            match outcome {
                Ok(Ok(Some(finding))) => return Some(finding),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => self.note_error(&path, &e),
                Err(payload) => self.scanner.controller.record_panic(&path, payload.as_ref()),
            }
        }
    }
}
