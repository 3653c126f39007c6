//! Safety policy: decides whether a path may ever be modified.
//!
//! Two lists per backend. Prefixes protect a path and everything below it
//! (OS install roots, security and credential stores, the whole system hive
//! with its device and service registrations).
//! Anchors protect exactly one path, typically a shared parent such as
//! `/usr/share`, `C:\Program Files` or `HKLM\SOFTWARE`, whose children may
//! still be cleaned. Configuration can add entries; nothing removes them.

use std::path::Path;

use crate::error::{ResidueError, Result};
use crate::resource::store::canonical_path;
use crate::resource::{BackendKind, LocalTree};

const FS_PREFIXES: &[&str] = &[
    "/bin",
    "/boot",
    "/dev",
    "/etc",
    "/lib",
    "/lib32",
    "/lib64",
    "/proc",
    "/run",
    "/sbin",
    "/sys",
    "/usr/bin",
    "/usr/include",
    "/usr/lib",
    "/usr/lib64",
    "/usr/sbin",
    "/var/lib/dpkg",
    "/var/lib/rpm",
    "/System",
    "/private/var/db",
    "c:/windows",
    "c:/program files/windows",
    "c:/program files (x86)/windows",
    "c:/program files/windowsapps",
    "c:/system volume information",
    "c:/$recycle.bin",
    "c:/recovery",
    "c:/boot",
];

/// Credential and key stores under the user's home; protected with everything below.
const HOME_PREFIXES: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".password-store",
    "Library/Keychains",
    "AppData/Roaming/Microsoft/Credentials",
    "AppData/Roaming/Microsoft/Protect",
    "AppData/Roaming/Microsoft/SystemCertificates",
    "AppData/Local/Microsoft/Credentials",
];

const FS_ANCHORS: &[&str] = &[
    "/",
    "/home",
    "/root",
    "/opt",
    "/srv",
    "/tmp",
    "/usr",
    "/usr/local",
    "/usr/local/bin",
    "/usr/local/lib",
    "/usr/local/share",
    "/usr/share",
    "/var",
    "/var/cache",
    "/var/lib",
    "/var/log",
    "/var/tmp",
    "/Applications",
    "/Library",
    "/Library/Application Support",
    "/Library/Preferences",
    "/Users",
    "c:/program files",
    "c:/program files (x86)",
    "c:/program files/common files",
    "c:/program files (x86)/common files",
    "c:/programdata",
    "c:/users",
    "c:/users/public",
];

const STORE_PREFIXES: &[&str] = &[
    r"HKLM\SAM",
    r"HKLM\SECURITY",
    r"HKLM\BCD00000000",
    r"HKLM\SYSTEM",
    r"HKLM\SOFTWARE\Microsoft\Windows NT",
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Component Based Servicing",
    r"HKLM\SOFTWARE\Policies",
    r"HKCU\Software\Policies",
];

const STORE_ANCHORS: &[&str] = &[
    "HKLM",
    "HKCU",
    "HKCR",
    "HKU",
    "HKCC",
    r"HKLM\SOFTWARE",
    r"HKLM\SOFTWARE\Classes",
    r"HKLM\SOFTWARE\Microsoft",
    r"HKLM\SOFTWARE\Microsoft\Windows",
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion",
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Run",
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\RunOnce",
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKLM\SOFTWARE\WOW6432Node",
    r"HKLM\SOFTWARE\WOW6432Node\Microsoft",
    r"HKLM\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKCU\Software",
    r"HKCU\Software\Classes",
    r"HKCU\Software\Microsoft",
    r"HKCU\Software\Microsoft\Windows",
    r"HKCU\Software\Microsoft\Windows\CurrentVersion",
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Run",
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\RunOnce",
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Uninstall",
];

#[derive(Debug, Clone, Default)]
struct Rules {
    prefixes: Vec<String>,
    anchors: Vec<String>,
}

impl Rules {
    fn matches(&self, normalized: &str, separator: char) -> bool {
        if self.anchors.iter().any(|a| a == normalized) {
            return true;
        }
        self.prefixes.iter().any(|prefix| {
            normalized == prefix
                || (normalized.starts_with(prefix.as_str())
                    && normalized[prefix.len()..].starts_with(separator))
        })
    }
}

/// Immutable after construction; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    filesystem: Rules,
    store: Rules,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyPolicy {
    /// Built-in rules plus the current user's home and standard app directories.
    pub fn new() -> Self {
        let mut policy = Self {
            filesystem: Rules::default(),
            store: Rules::default(),
        };
        for prefix in FS_PREFIXES {
            policy.filesystem.prefixes.push(normalize_fs(prefix));
        }
        for anchor in FS_ANCHORS {
            policy.filesystem.anchors.push(normalize_fs(anchor));
        }
        if let Some(home) = dirs::home_dir() {
            for rel in HOME_PREFIXES {
                policy
                    .filesystem
                    .prefixes
                    .push(normalize_fs(&home.join(rel).to_string_lossy()));
            }
        }
        let user_dirs = [
            dirs::home_dir(),
            dirs::config_dir(),
            dirs::data_dir(),
            dirs::data_local_dir(),
            dirs::cache_dir(),
            dirs::document_dir(),
            dirs::desktop_dir(),
            dirs::download_dir(),
        ];
        for dir in user_dirs.into_iter().flatten() {
            policy
                .filesystem
                .anchors
                .push(normalize_fs(&dir.to_string_lossy()));
        }
        for prefix in STORE_PREFIXES {
            policy.store.prefixes.push(normalize_store(prefix));
        }
        for anchor in STORE_ANCHORS {
            policy.store.anchors.push(normalize_store(anchor));
        }
        policy
    }

    /// Protect `path` and everything below it.
    pub fn add_protected(&mut self, backend: BackendKind, path: &str) {
        let normalized = Self::normalize(backend, path);
        let rules = self.rules_mut(backend);
        if !rules.prefixes.contains(&normalized) {
            rules.prefixes.push(normalized);
        }
    }

    pub fn with_protected<I, S>(mut self, backend: BackendKind, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for path in paths {
            self.add_protected(backend, path.as_ref());
        }
        self
    }

    pub fn is_protected(&self, backend: BackendKind, path: &str) -> bool {
        let normalized = Self::normalize(backend, path);
        match backend {
            BackendKind::Filesystem => {
                is_drive_root(&normalized) || self.filesystem.matches(&normalized, '/')
            }
            BackendKind::ConfigStore => self.store.matches(&normalized, '\\'),
        }
    }

    /// `Err(ProtectedResource)` when the path may not be modified.
    pub fn check(&self, backend: BackendKind, path: &str) -> Result<()> {
        if self.is_protected(backend, path) {
            return Err(ResidueError::ProtectedResource {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Comparison form of a path for the given backend.
    pub fn normalize(backend: BackendKind, path: &str) -> String {
        match backend {
            BackendKind::Filesystem => normalize_fs(path),
            BackendKind::ConfigStore => normalize_store(path),
        }
    }

    fn rules_mut(&mut self, backend: BackendKind) -> &mut Rules {
        match backend {
            BackendKind::Filesystem => &mut self.filesystem,
            BackendKind::ConfigStore => &mut self.store,
        }
    }
}

fn looks_like_windows(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.contains('\\') || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

fn is_drive_root(normalized: &str) -> bool {
    let bytes = normalized.as_bytes();
    bytes.len() <= 3 && bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Windows-style paths become lower-case with `/` separators; POSIX paths
/// keep their case unless the host filesystem ignores it.
fn normalize_fs(path: &str) -> String {
    if looks_like_windows(path) {
        let unified = path.replace('\\', "/").to_lowercase();
        let (drive, rest) = unified.split_at(unified.find('/').unwrap_or(unified.len()));
        let resolved = resolve_dots(rest.split('/'));
        return if resolved.is_empty() {
            format!("{}/", drive)
        } else {
            format!("{}/{}", drive, resolved.join("/"))
        };
    }

    let normalized = LocalTree::normalize_path(Path::new(path))
        .to_string_lossy()
        .into_owned();
    if cfg!(any(windows, target_os = "macos")) {
        normalized.to_lowercase()
    } else {
        normalized
    }
}

fn normalize_store(path: &str) -> String {
    let canonical = canonical_path(path);
    resolve_dots(canonical.split('\\'))
        .join("\\")
        .to_lowercase()
}

fn resolve_dots<'a>(parts: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::new();
    for part in parts {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_prefixes_cover_descendants() {
        let policy = SafetyPolicy::new();
        assert!(policy.is_protected(BackendKind::Filesystem, "/etc"));
        assert!(policy.is_protected(BackendKind::Filesystem, "/etc/ssh/sshd_config"));
        assert!(!policy.is_protected(BackendKind::Filesystem, "/etcetera/app"));
    }

    #[test]
    fn test_anchors_are_exact() {
        let policy = SafetyPolicy::new();
        assert!(policy.is_protected(BackendKind::Filesystem, "/usr/share"));
        assert!(!policy.is_protected(BackendKind::Filesystem, "/usr/share/acme-widget"));
        assert!(policy.is_protected(BackendKind::Filesystem, "/"));
    }

    #[test]
    fn test_dot_segments_cannot_escape_protection() {
        let policy = SafetyPolicy::new();
        assert!(policy.is_protected(BackendKind::Filesystem, "/opt/app/../../etc/passwd"));
        assert!(policy.is_protected(BackendKind::Filesystem, "/usr/share/./"));
    }

    #[test]
    fn test_windows_paths_are_case_insensitive() {
        let policy = SafetyPolicy::new();
        assert!(policy.is_protected(BackendKind::Filesystem, r"C:\WINDOWS\System32\drivers"));
        assert!(policy.is_protected(BackendKind::Filesystem, "D:\\"));
        assert!(policy.is_protected(BackendKind::Filesystem, r"c:\Program Files"));
        assert!(!policy.is_protected(BackendKind::Filesystem, r"C:\Program Files\Acme"));
    }

    #[test]
    fn test_store_rules_use_canonical_hive_names() {
        let policy = SafetyPolicy::new();
        assert!(policy.is_protected(
            BackendKind::ConfigStore,
            r"HKEY_LOCAL_MACHINE\system\CurrentControlSet\Control\Session Manager"
        ));
        assert!(policy.is_protected(BackendKind::ConfigStore, "HKCU"));
        assert!(policy.is_protected(BackendKind::ConfigStore, r"HKCU\Software"));
        assert!(!policy.is_protected(BackendKind::ConfigStore, r"HKCU\Software\Acme"));
    }

    #[test]
    fn test_service_and_device_registrations_are_protected() {
        let policy = SafetyPolicy::new();
        for path in [
            r"HKLM\SYSTEM",
            r"HKLM\SYSTEM\CurrentControlSet\Services\AcmeSvc",
            r"HKLM\SYSTEM\CurrentControlSet\Services\Tcpip",
            r"HKLM\SYSTEM\ControlSet001\Control\Session Manager",
            r"HKLM\SYSTEM\ControlSet001\Services\Disk",
            r"HKEY_LOCAL_MACHINE\System\ControlSet002\Enum",
            r"HKLM\SYSTEM\MountedDevices",
        ] {
            assert!(policy.is_protected(BackendKind::ConfigStore, path), "{}", path);
        }
        assert!(!policy.is_protected(BackendKind::ConfigStore, r"HKLM\SYSTEMATIC\Acme"));
        assert!(!policy.is_protected(BackendKind::ConfigStore, r"HKLM\SOFTWARE\Acme"));
    }

    #[test]
    fn test_home_credential_stores_are_protected() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let policy = SafetyPolicy::new();
        let protected = [
            home.join(".ssh"),
            home.join(".ssh").join("id_ed25519"),
            home.join(".gnupg"),
            home.join(".gnupg").join("private-keys-v1.d"),
            home.join("Library").join("Keychains"),
            home.join("AppData").join("Roaming").join("Microsoft").join("Credentials"),
            home.join("AppData").join("Roaming").join("Microsoft").join("Protect").join("S-1-5"),
        ];
        for path in protected {
            let path = path.to_string_lossy();
            assert!(policy.is_protected(BackendKind::Filesystem, &path), "{}", path);
        }
        let sibling = home.join(".sshx-acme");
        assert!(!policy.is_protected(BackendKind::Filesystem, &sibling.to_string_lossy()));
    }

    #[test]
    fn test_extras_only_add_protection() {
        let policy =
            SafetyPolicy::new().with_protected(BackendKind::Filesystem, ["/data/keep"]);
        assert!(policy.is_protected(BackendKind::Filesystem, "/data/keep/inner"));
        assert!(policy.check(BackendKind::Filesystem, "/data/other").is_ok());
        assert!(policy.check(BackendKind::Filesystem, "/etc").is_err());
    }
}
