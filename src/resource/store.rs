//! Hierarchical key/value configuration store.
//!
//! Keys are containers holding typed values and subkeys, addressed by
//! backslash-separated paths whose first component is a hive
//! (`HKLM\SOFTWARE\Vendor`). Names compare case-insensitively but keep the
//! case they were created with. The store lives in memory and can be loaded
//! from and saved to a JSON hive document; with a persist path set, every
//! mutation made through [`ResourceTree`] is written back immediately.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{ResidueError, Result};
use crate::resource::backend::{BackendCapabilities, BackendKind, ResourceTree};
use crate::resource::types::{AttrValue, Attributes, NodeKind, ResourceNode};
use crate::util::write_atomic;

pub const SEPARATOR: char = '\\';

const DOCUMENT_VERSION: u32 = 1;

/// Short hive names and their long aliases.
const HIVES: &[(&str, &str)] = &[
    ("HKLM", "HKEY_LOCAL_MACHINE"),
    ("HKCU", "HKEY_CURRENT_USER"),
    ("HKCR", "HKEY_CLASSES_ROOT"),
    ("HKU", "HKEY_USERS"),
    ("HKCC", "HKEY_CURRENT_CONFIG"),
];

/// Where installed programs register their uninstall entries.
pub const UNINSTALL_ROOTS: &[&str] = &[
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKLM\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Uninstall",
];

/// Canonical form of a store path: `/` becomes `\`, empty components are
/// dropped and the hive is rewritten to its short upper-case name.
pub fn canonical_path(path: &str) -> String {
    let mut parts = path
        .split(['\\', '/'])
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if let Some(first) = parts.first_mut() {
        if let Some(short) = hive_short_name(first) {
            *first = short.to_string();
        }
    }
    parts.join("\\")
}

/// Map either form of a hive name onto its short name.
pub fn hive_short_name(name: &str) -> Option<&'static str> {
    HIVES
        .iter()
        .find(|(short, long)| name.eq_ignore_ascii_case(short) || name.eq_ignore_ascii_case(long))
        .map(|(short, _)| *short)
}

/// Simulated access control on a key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAccess {
    #[serde(default)]
    pub deny_read: bool,
    #[serde(default)]
    pub deny_write: bool,
}

impl KeyAccess {
    fn is_open(&self) -> bool {
        !self.deny_read && !self.deny_write
    }
}

#[derive(Debug, Clone)]
struct Key {
    name: String,
    values: Attributes,
    subkeys: BTreeMap<String, Key>,
    access: KeyAccess,
}

impl Key {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            values: Attributes::new(),
            subkeys: BTreeMap::new(),
            access: KeyAccess::default(),
        }
    }

    fn size(&self) -> u64 {
        self.values
            .iter()
            .map(|(name, value)| name.len() as u64 + value.data_len())
            .sum()
    }
}

/// On-disk form of a key.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DocKey {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    values: Attributes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    subkeys: BTreeMap<String, DocKey>,
    #[serde(default, skip_serializing_if = "KeyAccess::is_open")]
    access: KeyAccess,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HiveDocument {
    version: u32,
    hives: BTreeMap<String, DocKey>,
}

impl From<&Key> for DocKey {
    fn from(key: &Key) -> Self {
        DocKey {
            values: key.values.clone(),
            subkeys: key
                .subkeys
                .values()
                .map(|k| (k.name.clone(), DocKey::from(k)))
                .collect(),
            access: key.access,
        }
    }
}

impl DocKey {
    fn into_key(self, name: &str) -> Key {
        let mut key = Key::new(name);
        key.values = self.values;
        key.access = self.access;
        for (child_name, child) in self.subkeys {
            key.subkeys
                .insert(child_name.to_lowercase(), child.into_key(&child_name));
        }
        key
    }
}

/// A program registered under one of the uninstall roots
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstalledProgram {
    pub key_path: String,
    pub key_name: String,
    pub display_name: String,
    pub display_version: Option<String>,
    pub publisher: Option<String>,
    pub install_location: Option<String>,
    pub uninstall_string: Option<String>,
    pub quiet_uninstall_string: Option<String>,
    pub estimated_size_kb: Option<u32>,
}

pub struct ConfigStore {
    hives: RwLock<BTreeMap<String, Key>>,
    persist_path: Option<PathBuf>,
    allow_elevation: bool,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    /// Empty store with every hive present.
    pub fn new() -> Self {
        let hives = HIVES
            .iter()
            .map(|(short, _)| (short.to_lowercase(), Key::new(short)))
            .collect();
        Self {
            hives: RwLock::new(hives),
            persist_path: None,
            allow_elevation: false,
        }
    }

    /// Load a hive document. Hives missing from the document are created empty.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| ResidueError::from_io_error(e, "reading store", path.display().to_string()))?;
        let document: HiveDocument =
            serde_json::from_slice(&bytes).map_err(|e| ResidueError::ManifestCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let store = Self::new();
        {
            let mut hives = store.write_hives();
            for (name, doc) in document.hives {
                let short = hive_short_name(&name).ok_or_else(|| ResidueError::InvalidConfig {
                    message: format!("unknown hive '{}' in {}", name, path.display()),
                })?;
                hives.insert(short.to_lowercase(), doc.into_key(short));
            }
        }
        tracing::debug!(path = %path.display(), "loaded configuration store");
        Ok(store)
    }

    /// Write every mutation back to `path`.
    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    /// Let `try_elevate` lift write denials.
    pub fn with_elevation(mut self, allow: bool) -> Self {
        self.allow_elevation = allow;
        self
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let document = {
            let hives = self.read_hives();
            HiveDocument {
                version: DOCUMENT_VERSION,
                hives: hives
                    .values()
                    .map(|k| (k.name.clone(), DocKey::from(k)))
                    .collect(),
            }
        };
        let bytes = serde_json::to_vec_pretty(&document).map_err(|e| ResidueError::Io {
            path: path.display().to_string(),
            operation: "encoding store".to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        write_atomic(path, &bytes)
            .map_err(|e| ResidueError::from_io_error(e, "writing store", path.display().to_string()))
    }

    // ========== Builders ==========

    /// Create a key and any missing ancestors. Existing keys are left as they are.
    pub fn insert_key(&self, path: &str) -> Result<()> {
        let parts = split(path)?;
        let mut hives = self.write_hives();
        let mut current = hive_mut(&mut hives, &parts[0], path)?;
        for name in &parts[1..] {
            current = current
                .subkeys
                .entry(name.to_lowercase())
                .or_insert_with(|| Key::new(name));
        }
        Ok(())
    }

    /// Set a value, creating the key if needed.
    pub fn set_value(&self, path: &str, name: &str, value: impl Into<AttrValue>) -> Result<()> {
        self.insert_key(path)?;
        self.with_key_mut(path, |key| {
            key.values.insert(name.to_string(), value.into());
            Ok(())
        })
    }

    pub fn set_access(&self, path: &str, access: KeyAccess) -> Result<()> {
        self.with_key_mut(path, |key| {
            key.access = access;
            Ok(())
        })
    }

    pub fn value(&self, path: &str, name: &str) -> Option<AttrValue> {
        self.with_key(path, |key| {
            Ok(key
                .values
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone()))
        })
        .ok()
        .flatten()
    }

    /// Programs registered under the uninstall roots. Entries without a
    /// display name are not reported.
    pub fn installed_programs(&self) -> Vec<InstalledProgram> {
        let mut programs = Vec::new();
        for root in UNINSTALL_ROOTS {
            let Ok(children) = self.list_children(root) else {
                continue;
            };
            for child in children {
                let key_path = self.join(root, &child);
                let text = |name: &str| {
                    self.value(&key_path, name)
                        .and_then(|v| v.as_text().map(|t| t.into_owned()))
                };
                let Some(display_name) = text("DisplayName") else {
                    continue;
                };
                let estimated_size_kb = match self.value(&key_path, "EstimatedSize") {
                    Some(AttrValue::Dword(kb)) => Some(kb),
                    _ => None,
                };
                programs.push(InstalledProgram {
                    display_version: text("DisplayVersion"),
                    publisher: text("Publisher"),
                    install_location: text("InstallLocation"),
                    uninstall_string: text("UninstallString"),
                    quiet_uninstall_string: text("QuietUninstallString"),
                    estimated_size_kb,
                    display_name,
                    key_name: child,
                    key_path,
                });
            }
        }
        programs
    }

    // ========== Internals ==========

    fn read_hives(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Key>> {
        self.hives.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_hives(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Key>> {
        self.hives.write().unwrap_or_else(|e| e.into_inner())
    }

    fn with_key<T>(&self, path: &str, f: impl FnOnce(&Key) -> Result<T>) -> Result<T> {
        let parts = split(path)?;
        let hives = self.read_hives();
        let mut current = hives
            .get(&parts[0].to_lowercase())
            .ok_or_else(|| ResidueError::not_found(path))?;
        for name in &parts[1..] {
            current = current
                .subkeys
                .get(&name.to_lowercase())
                .ok_or_else(|| ResidueError::not_found(path))?;
        }
        f(current)
    }

    fn with_key_mut<T>(&self, path: &str, f: impl FnOnce(&mut Key) -> Result<T>) -> Result<T> {
        let parts = split(path)?;
        let mut hives = self.write_hives();
        let mut current = hive_mut(&mut hives, &parts[0], path)?;
        for name in &parts[1..] {
            current = current
                .subkeys
                .get_mut(&name.to_lowercase())
                .ok_or_else(|| ResidueError::not_found(path))?;
        }
        f(current)
    }

    fn persist(&self) -> Result<()> {
        match &self.persist_path {
            Some(path) => self.save(path),
            None => Ok(()),
        }
    }
}

fn split(path: &str) -> Result<Vec<String>> {
    let canonical = canonical_path(path);
    if canonical.is_empty() {
        return Err(ResidueError::not_found(path));
    }
    Ok(canonical.split(SEPARATOR).map(str::to_string).collect())
}

fn hive_mut<'a>(
    hives: &'a mut BTreeMap<String, Key>,
    hive: &str,
    path: &str,
) -> Result<&'a mut Key> {
    hives
        .get_mut(&hive.to_lowercase())
        .ok_or_else(|| ResidueError::not_found(path))
}

impl ResourceTree for ConfigStore {
    fn kind(&self) -> BackendKind {
        BackendKind::ConfigStore
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::config_store(self.allow_elevation)
    }

    fn join(&self, parent: &str, name: &str) -> String {
        let parent = parent.trim_end_matches(SEPARATOR);
        format!("{}{}{}", parent, SEPARATOR, name)
    }

    fn parent(&self, path: &str) -> Option<String> {
        let canonical = canonical_path(path);
        canonical
            .rsplit_once(SEPARATOR)
            .map(|(parent, _)| parent.to_string())
    }

    fn name_of(&self, path: &str) -> String {
        let canonical = canonical_path(path);
        match canonical.rsplit_once(SEPARATOR) {
            Some((_, name)) => name.to_string(),
            None => canonical,
        }
    }

    fn depth_of(&self, path: &str) -> usize {
        canonical_path(path).split(SEPARATOR).count()
    }

    fn open(&self, path: &str) -> Result<ResourceNode> {
        self.with_key(path, |key| {
            if key.access.deny_read {
                return Err(ResidueError::denied(path, "opening"));
            }
            Ok(ResourceNode {
                path: path.to_string(),
                name: key.name.clone(),
                kind: NodeKind::Container,
                size: key.size(),
                attributes: key.values.clone(),
            })
        })
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        self.with_key(path, |key| {
            if key.access.deny_read {
                return Err(ResidueError::denied(path, "listing"));
            }
            Ok(key.subkeys.values().map(|k| k.name.clone()).collect())
        })
    }

    fn delete(&self, path: &str) -> Result<()> {
        let parts = split(path)?;
        if parts.len() == 1 {
            return Err(ResidueError::unsupported(
                self.kind().short_name(),
                "deleting a hive root",
            ));
        }
        let (name, parent_parts) = parts.split_last().ok_or_else(|| ResidueError::not_found(path))?;
        let parent_path = parent_parts.join("\\");
        self.with_key_mut(&parent_path, |parent| {
            let lower = name.to_lowercase();
            let key = parent
                .subkeys
                .get(&lower)
                .ok_or_else(|| ResidueError::not_found(path))?;
            if key.access.deny_write {
                return Err(ResidueError::denied(path, "deleting"));
            }
            if !key.subkeys.is_empty() {
                return Err(ResidueError::NotEmpty {
                    path: path.to_string(),
                });
            }
            parent.subkeys.remove(&lower);
            Ok(())
        })?;
        self.persist()
    }

    fn create(&self, path: &str, _kind: NodeKind, _payload: Option<&Path>) -> Result<()> {
        let parts = split(path)?;
        if parts.len() == 1 {
            return self.with_key(path, |_| Ok(()));
        }
        let (name, parent_parts) = parts.split_last().ok_or_else(|| ResidueError::not_found(path))?;
        let parent_path = parent_parts.join("\\");
        // Missing ancestors are restored by their own entries; create them bare otherwise.
        self.insert_key(&parent_path)?;
        self.with_key_mut(&parent_path, |parent| {
            let lower = name.to_lowercase();
            if parent.subkeys.contains_key(&lower) {
                return Ok(());
            }
            if parent.access.deny_write {
                return Err(ResidueError::denied(path, "creating"));
            }
            parent.subkeys.insert(lower, Key::new(name));
            Ok(())
        })?;
        self.persist()
    }

    fn apply_attributes(&self, path: &str, attributes: &Attributes) -> Result<()> {
        self.with_key_mut(path, |key| {
            if key.access.deny_write {
                return Err(ResidueError::denied(path, "writing values of"));
            }
            key.values = attributes.clone();
            Ok(())
        })?;
        self.persist()
    }

    fn try_elevate(&self, path: &str) -> bool {
        if !self.allow_elevation {
            return false;
        }
        let mut changed = false;
        let mut lift = |target: &str| {
            let _ = self.with_key_mut(target, |key| {
                if key.access.deny_write {
                    key.access.deny_write = false;
                    changed = true;
                }
                Ok(())
            });
        };
        lift(path);
        if let Some(parent) = self.parent(path) {
            lift(&parent);
        }
        if changed {
            tracing::debug!(path, "lifted write denial for retry");
        }
        changed
    }
}
