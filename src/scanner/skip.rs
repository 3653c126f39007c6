//! Container names the scanner never enters.
//!
//! Names are matched case-insensitively against glob patterns. The list only
//! applies below a scan root, so a root that happens to carry one of these
//! names is still scanned.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{ResidueError, Result};
use crate::resource::BackendKind;

/// System-critical or volatile directories.
pub const DEFAULT_FS_SKIPS: &[&str] = &[
    // Windows
    "$recycle.bin",
    "system volume information",
    "windows",
    "winsxs",
    "recovery",
    "config.msi",
    "msocache",
    "perflogs",
    // Unix pseudo filesystems and fsck debris
    "proc",
    "sys",
    "dev",
    "lost+found",
    // Version control internals
    ".git",
    ".svn",
    ".hg",
];

/// Store keys that belong to the OS and are huge to walk.
pub const DEFAULT_STORE_SKIPS: &[&str] = &[
    "sam",
    "security",
    "bcd00000000",
    "component based servicing",
    "driverdatabase",
    "winevt",
];

#[derive(Debug, Clone)]
pub struct SkipList {
    glob_set: GlobSet,
    patterns: Vec<String>,
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    /// An empty list that skips nothing.
    pub fn new() -> Self {
        Self {
            glob_set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    /// Built-in names for a backend.
    pub fn defaults_for(backend: BackendKind) -> Self {
        let defaults = match backend {
            BackendKind::Filesystem => DEFAULT_FS_SKIPS,
            BackendKind::ConfigStore => DEFAULT_STORE_SKIPS,
        };
        // Built-in patterns are plain names and always compile.
        Self::from_patterns(defaults).unwrap_or_default()
    }

    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut list = Self::new();
        for pattern in patterns {
            list.patterns.push(pattern.as_ref().to_lowercase());
        }
        list.rebuild()?;
        Ok(list)
    }

    /// Add patterns; an invalid glob is a configuration error.
    pub fn with_extra<S: AsRef<str>>(mut self, extra: &[S]) -> Result<Self> {
        for pattern in extra {
            let pattern = pattern.as_ref().to_lowercase();
            if !self.patterns.contains(&pattern) {
                self.patterns.push(pattern);
            }
        }
        self.rebuild()?;
        Ok(self)
    }

    pub fn is_skipped(&self, name: &str) -> bool {
        !self.patterns.is_empty() && self.glob_set.is_match(name.to_lowercase())
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    fn rebuild(&mut self) -> Result<()> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| ResidueError::InvalidConfig {
                    message: format!("invalid skip pattern '{}': {}", pattern, e),
                })?;
            builder.add(glob);
        }
        self.glob_set = builder.build().map_err(|e| ResidueError::InvalidConfig {
            message: format!("failed to build skip list: {}", e),
        })?;
        Ok(())
    }
}
