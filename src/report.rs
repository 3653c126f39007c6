//! Aggregate report for one scan or clean run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::controller::{serialize_duration, ModuleStats, RecordedError};
use crate::executor::{TaskReport, TaskStatus};
use crate::model::{CleanAction, CleanOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub target: String,
    pub started: DateTime<Utc>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub modules: Vec<ModuleStats>,
    pub tasks: TaskReport,
    pub findings: usize,
    /// Clean outcomes per action name
    pub actions: BTreeMap<String, usize>,
    pub bytes_freed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RecordedError>,
    #[serde(skip)]
    clock: Option<Instant>,
}

impl RunReport {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            started: Utc::now(),
            duration: Duration::ZERO,
            modules: Vec::new(),
            tasks: TaskReport::default(),
            findings: 0,
            actions: BTreeMap::new(),
            bytes_freed: 0,
            session_id: None,
            errors: Vec::new(),
            clock: Some(Instant::now()),
        }
    }

    pub fn add_module(&mut self, stats: ModuleStats, errors: Vec<RecordedError>) {
        self.modules.push(stats);
        self.errors.extend(errors);
    }

    pub fn set_tasks(&mut self, tasks: TaskReport) {
        self.tasks = tasks;
    }

    pub fn record_outcome(&mut self, outcome: &CleanOutcome) {
        *self.actions.entry(outcome.action.as_str().to_string()).or_default() += 1;
        self.bytes_freed += outcome.bytes_freed;
    }

    pub fn finish(&mut self) {
        if let Some(clock) = self.clock.take() {
            self.duration = clock.elapsed();
        }
    }

    pub fn items_scanned(&self) -> u64 {
        self.modules.iter().map(|m| m.items_scanned).sum()
    }

    pub fn items_found(&self) -> u64 {
        self.modules.iter().map(|m| m.items_found).sum()
    }

    pub fn items_cleaned(&self) -> u64 {
        self.modules.iter().map(|m| m.items_cleaned).sum()
    }

    pub fn items_failed(&self) -> u64 {
        self.modules.iter().map(|m| m.items_failed).sum()
    }

    pub fn action_count(&self, action: CleanAction) -> usize {
        self.actions.get(action.as_str()).copied().unwrap_or(0)
    }

    /// Roots whose scan did not complete.
    pub fn incomplete_roots(&self) -> usize {
        self.tasks.outcomes.len() - self.tasks.count(TaskStatus::Completed)
    }
}
