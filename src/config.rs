// Run configuration: TOML on disk, every field optional with a platform default.
// Defaults come from the user's standard directories plus well-known program
// and store locations; `validate` runs before any traversal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cleaner::CleanerOptions;
use crate::error::{ResidueError, Result};
use crate::resource::store::{canonical_path, hive_short_name};
use crate::scanner::ScanDepth;

pub const APP_DIR: &str = "residue";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Roots {
    pub filesystem: Vec<PathBuf>,
    pub store: Vec<String>,
}

impl Default for Roots {
    fn default() -> Self {
        Self {
            filesystem: default_filesystem_roots(),
            store: default_store_roots(),
        }
    }
}

/// Extra protected paths, added on top of the built-in lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraPaths {
    pub filesystem: Vec<String>,
    pub store: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub depth: ScanDepth,
    pub dry_run: bool,
    pub force: bool,
    pub create_backup: bool,
    pub backup_dir: PathBuf,
    pub max_workers: usize,
    /// Per-root scan limit; 0 disables it
    pub task_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub io_timeout_ms: u64,
    pub min_confidence: f32,
    pub roots: Roots,
    /// JSON hive document backing the configuration store
    pub store_file: Option<PathBuf>,
    pub reboot_queue_file: PathBuf,
    pub aliases: BTreeMap<String, Vec<String>>,
    pub extra_protected: ExtraPaths,
    pub extra_skips: ExtraPaths,
}

impl Default for Config {
    fn default() -> Self {
        let state = state_dir();
        Self {
            depth: ScanDepth::default(),
            dry_run: false,
            force: false,
            create_backup: true,
            backup_dir: state.join("backups"),
            max_workers: num_cpus::get().max(1),
            task_timeout_secs: 300,
            stop_timeout_secs: 5,
            io_timeout_ms: 2_000,
            min_confidence: 0.3,
            roots: Roots::default(),
            store_file: None,
            reboot_queue_file: state.join("pending-deletes.json"),
            aliases: BTreeMap::new(),
            extra_protected: ExtraPaths::default(),
            extra_skips: ExtraPaths::default(),
        }
    }
}

impl Config {
    /// `<config dir>/residue/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ResidueError::InvalidConfig {
            message: format!("invalid configuration: {}", e.message()),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ResidueError::from_io_error(e, "reading configuration", path.display().to_string())
        })?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load `path` when given, else the default file when present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ResidueError::InvalidConfig {
            message: format!("cannot encode configuration: {}", e),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ResidueError::InvalidConfig {
                message: "max_workers must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ResidueError::InvalidConfig {
                message: format!("min_confidence {} is outside [0, 1]", self.min_confidence),
            });
        }
        if self.backup_dir.exists() && !self.backup_dir.is_dir() {
            return Err(ResidueError::InvalidBackupDir {
                path: self.backup_dir.clone(),
                reason: "not a directory".to_string(),
            });
        }
        for root in &self.roots.filesystem {
            validate_filesystem_root(root)?;
        }
        for root in &self.roots.store {
            validate_store_root(root)?;
        }
        Ok(())
    }

    pub fn cleaner_options(&self) -> CleanerOptions {
        CleanerOptions {
            dry_run: self.dry_run,
            force: self.force,
            create_backup: self.create_backup,
            min_confidence: self.min_confidence,
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        }
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }
}

pub fn validate_filesystem_root(root: &Path) -> Result<()> {
    if root.as_os_str().is_empty() || !root.is_absolute() {
        return Err(ResidueError::InvalidRoot {
            path: root.display().to_string(),
            reason: "filesystem roots must be absolute".to_string(),
        });
    }
    if root.exists() && !root.is_dir() {
        return Err(ResidueError::InvalidRoot {
            path: root.display().to_string(),
            reason: "not a directory".to_string(),
        });
    }
    Ok(())
}

pub fn validate_store_root(root: &str) -> Result<()> {
    let canonical = canonical_path(root);
    let hive = canonical.split('\\').next().unwrap_or_default();
    if hive_short_name(hive).is_none() {
        return Err(ResidueError::InvalidRoot {
            path: root.to_string(),
            reason: format!("unknown hive '{}'", hive),
        });
    }
    Ok(())
}

fn state_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

fn default_filesystem_roots() -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = [
        dirs::config_dir(),
        dirs::data_dir(),
        dirs::data_local_dir(),
        dirs::cache_dir(),
        dirs::preference_dir(),
    ]
    .into_iter()
    .flatten()
    .collect();

    #[cfg(windows)]
    {
        for var in ["ProgramFiles", "ProgramFiles(x86)", "ProgramData"] {
            if let Some(dir) = std::env::var_os(var) {
                roots.push(PathBuf::from(dir));
            }
        }
    }
    #[cfg(target_os = "macos")]
    {
        roots.push(PathBuf::from("/Applications"));
        roots.push(PathBuf::from("/Library/Application Support"));
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        roots.push(PathBuf::from("/opt"));
        roots.push(PathBuf::from("/usr/local/share"));
        roots.push(PathBuf::from("/var/cache"));
    }

    roots.sort();
    roots.dedup();
    roots
}

// Uninstall roots live below both of these.
fn default_store_roots() -> Vec<String> {
    vec![r"HKCU\Software".to_string(), r"HKLM\SOFTWARE".to_string()]
}
