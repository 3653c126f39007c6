// Library module for residue
// Re-exports the scan/clean/backup pipeline for the binary and integration tests

pub mod analyzer;
pub mod backup;
pub mod cleaner;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod model;
pub mod report;
pub mod resource;
pub mod safety;
pub mod scanner;
pub mod sweep;
mod util;

pub use analyzer::{AliasTable, PatternAnalyzer, Signature};
pub use backup::{BackupManager, BackupSession, RestoreReport};
pub use cleaner::{CleanRun, Cleaner, CleanerOptions};
pub use config::Config;
pub use controller::{CancellationToken, ModuleController, ModuleState, ModuleStats};
pub use error::{ErrorKind, ResidueError, Result};
pub use executor::{ParallelExecutor, Task, TaskReport, TaskStatus};
pub use model::{CleanAction, CleanOutcome, ScanFinding};
pub use report::RunReport;
pub use resource::{BackendKind, ConfigStore, LocalTree, ResourceTree, TreeSet};
pub use safety::SafetyPolicy;
pub use scanner::{ScanDepth, TreeScanner};
pub use sweep::{ScanRun, Sweep};
