// Application signatures: the needles a target name expands into.
// The alias table groups product families; a target that names a family
// member (or contains one) pulls in the whole family.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;

use crate::error::{ResidueError, Result};

/// Needles shorter than this match too much to be useful.
pub const MIN_NEEDLE_LEN: usize = 3;

const BUILTIN_ALIASES: &[(&str, &[&str])] = &[
    ("adobe", &["adobe", "acrobat", "photoshop", "illustrator", "premiere"]),
    ("microsoft", &["microsoft", "office", "visual studio", "vscode", "teams"]),
    ("google", &["google", "chrome", "drive", "earth"]),
    ("mozilla", &["mozilla", "firefox", "thunderbird"]),
    ("nvidia", &["nvidia", "geforce", "physx", "cuda"]),
    ("amd", &["amd", "radeon", "catalyst", "ryzen"]),
    ("intel", &["intel", "graphics", "driver"]),
    ("java", &["java", "jdk", "jre", "oracle"]),
    ("python", &["python", "anaconda", "miniconda"]),
    ("node", &["node", "nodejs", "npm"]),
    ("steam", &["steam", "valve"]),
    ("epic", &["epic", "unreal", "fortnite"]),
    ("discord", &["discord"]),
    ("slack", &["slack"]),
    ("zoom", &["zoom"]),
    ("spotify", &["spotify"]),
    ("vlc", &["vlc", "videolan"]),
    ("7zip", &["7-zip", "7zip"]),
    ("winrar", &["winrar", "rarlab"]),
];

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Product families and their aliases. Alias entries may be globs.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    families: BTreeMap<String, Vec<String>>,
}

impl AliasTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (family, aliases) in BUILTIN_ALIASES {
            table.add(family, aliases.iter().copied());
        }
        table
    }

    /// Add aliases to a family, creating it if needed. Duplicates are ignored.
    pub fn add<I, S>(&mut self, family: &str, aliases: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entry = self.families.entry(family.to_lowercase()).or_default();
        for alias in aliases {
            let alias = alias.as_ref().trim().to_lowercase();
            if !alias.is_empty() && !entry.contains(&alias) {
                entry.push(alias);
            }
        }
    }

    pub fn merge(&mut self, extra: &BTreeMap<String, Vec<String>>) {
        for (family, aliases) in extra {
            self.add(family, aliases);
        }
    }

    pub fn families(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.families.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Patterns for `target`: the target itself plus every family it belongs to.
    /// An exact alias match selects that family alone.
    pub fn expand(&self, target: &str) -> Vec<String> {
        let target = target.trim().to_lowercase();
        let mut patterns = vec![target.clone()];

        for (family, aliases) in &self.families {
            if *family == target || aliases.contains(&target) {
                patterns.extend(aliases.iter().cloned());
                break;
            }
            if aliases
                .iter()
                .any(|a| !is_glob(a) && a.len() >= MIN_NEEDLE_LEN && target.contains(a.as_str()))
            {
                patterns.extend(aliases.iter().cloned());
            }
        }

        let mut seen = Vec::with_capacity(patterns.len());
        for p in patterns {
            if !seen.contains(&p) {
                seen.push(p);
            }
        }
        seen
    }
}

/// Compiled signature of one target.
#[derive(Debug, Clone)]
pub struct Signature {
    target: String,
    needles: Vec<String>,
    globs: GlobSet,
    glob_patterns: Vec<String>,
}

impl Signature {
    /// Build the signature for `target`. An invalid glob alias is a configuration error.
    pub fn for_target(target: &str, aliases: &AliasTable) -> Result<Self> {
        let target = target.trim();
        if target.len() < MIN_NEEDLE_LEN {
            return Err(ResidueError::InvalidConfig {
                message: format!(
                    "target '{}' is shorter than {} characters",
                    target, MIN_NEEDLE_LEN
                ),
            });
        }

        let mut needles = Vec::new();
        let mut glob_patterns = Vec::new();
        let mut builder = GlobSetBuilder::new();

        for pattern in aliases.expand(target) {
            if is_glob(&pattern) {
                let glob = GlobBuilder::new(&pattern)
                    .case_insensitive(true)
                    .literal_separator(false)
                    .build()
                    .map_err(|e| ResidueError::InvalidConfig {
                        message: format!("invalid alias pattern '{}': {}", pattern, e),
                    })?;
                builder.add(glob);
                glob_patterns.push(pattern);
            } else if pattern.len() >= MIN_NEEDLE_LEN {
                needles.push(pattern);
            }
        }

        let globs = builder.build().map_err(|e| ResidueError::InvalidConfig {
            message: format!("failed to build alias patterns: {}", e),
        })?;

        Ok(Self {
            target: target.to_string(),
            needles,
            globs,
            glob_patterns,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn needles(&self) -> &[String] {
        &self.needles
    }

    pub fn glob_patterns(&self) -> &[String] {
        &self.glob_patterns
    }

    /// Patterns found in `text`. Needles match as substrings; globs match the
    /// whole text. `lowered` must already be lower-case.
    pub fn hits<'a>(&'a self, lowered: &str) -> Vec<&'a str> {
        let mut found: Vec<&str> = self
            .needles
            .iter()
            .filter(|n| lowered.contains(n.as_str()))
            .map(String::as_str)
            .collect();
        if !self.glob_patterns.is_empty() {
            for idx in self.globs.matches(lowered) {
                found.push(self.glob_patterns[idx].as_str());
            }
        }
        found
    }

    pub fn matches(&self, lowered: &str) -> bool {
        self.needles.iter().any(|n| lowered.contains(n.as_str()))
            || (!self.glob_patterns.is_empty() && self.globs.is_match(lowered))
    }
}
