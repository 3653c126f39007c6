//! Records produced by scanning and cleaning.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ErrorKind;
use crate::resource::BackendKind;

/// One discovered trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFinding {
    pub module: String,
    pub backend: BackendKind,
    pub item_type: String,
    pub path: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
    pub confidence: f32,
    pub can_delete: bool,
    pub risk_level: u8,
}

impl ScanFinding {
    /// Depth recorded by the scanner, if any.
    pub fn depth(&self) -> Option<usize> {
        self.details
            .get("depth")
            .and_then(Value::as_u64)
            .map(|d| d as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanAction {
    Skip,
    Simulated,
    Deleted,
    AlreadyGone,
    Deferred,
    Failed,
}

impl CleanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanAction::Skip => "skip",
            CleanAction::Simulated => "simulated",
            CleanAction::Deleted => "deleted",
            CleanAction::AlreadyGone => "already_gone",
            CleanAction::Deferred => "deferred",
            CleanAction::Failed => "failed",
        }
    }

    /// Actions that change (or will change) the tree.
    pub fn is_destructive(&self) -> bool {
        matches!(self, CleanAction::Deleted | CleanAction::Deferred)
    }
}

impl fmt::Display for CleanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of cleaning one finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanOutcome {
    pub module: String,
    pub backend: BackendKind,
    pub action: CleanAction,
    pub target: String,
    pub success: bool,
    pub message: String,
    pub bytes_freed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl CleanOutcome {
    pub(crate) fn new(
        finding: &ScanFinding,
        action: CleanAction,
        success: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            module: finding.module.clone(),
            backend: finding.backend,
            action,
            target: finding.path.clone(),
            success,
            message: message.into(),
            bytes_freed: 0,
            error_kind: None,
        }
    }

    pub(crate) fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes_freed = bytes;
        self
    }

    pub(crate) fn with_error(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }
}
