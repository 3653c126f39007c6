//! Pattern analysis of a node's textual surface.
//!
//! The analyzer is a pure function over an immutable [`Signature`]: every call
//! builds its own accumulator, so one instance is shared across scan workers
//! behind an `Arc` without locking.

pub mod signatures;

pub use signatures::{AliasTable, Signature};

use serde::Serialize;

use crate::error::Result;
use crate::resource::{Attributes, BackendKind, NodeKind, ResourceNode};

const NAME_FIRST: f32 = 0.35;
const NAME_EXTRA: f32 = 0.05;
const NAME_CAP: f32 = 0.45;
const ATTR_EACH: f32 = 0.05;
const ATTR_CAP: f32 = 0.15;
const INSTALL_PATH: f32 = 0.20;
const UNINSTALL_COMMAND: f32 = 0.50;
const EXECUTABLE: f32 = 0.10;

const INSTALL_PATH_ATTRS: &[&str] = &[
    "installlocation",
    "installpath",
    "installdir",
    "installfolder",
    "install_location",
    "inno setup: app path",
];

const UNINSTALL_ATTRS: &[&str] = &["uninstallstring", "quietuninstallstring"];

const EXECUTABLE_EXTENSIONS: &[&str] = &[
    ".exe", ".dll", ".sys", ".msi", ".bat", ".cmd", ".ps1", ".so", ".dylib", ".sh",
];

/// Evidence categories, each contributing a capped share of the confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    Name,
    AttributeText,
    InstallPath,
    UninstallCommand,
    ExecutableExtension,
}

/// What the analyzer sees of a node
#[derive(Debug, Clone, Copy)]
pub struct Surface<'a> {
    pub backend: BackendKind,
    pub path: &'a str,
    pub name: &'a str,
    pub kind: NodeKind,
    pub attributes: &'a Attributes,
}

impl<'a> Surface<'a> {
    pub fn of(backend: BackendKind, node: &'a ResourceNode) -> Self {
        Self {
            backend,
            path: &node.path,
            name: &node.name,
            kind: node.kind,
            attributes: &node.attributes,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Analysis {
    pub matched: bool,
    pub confidence: f32,
    pub categories: Vec<Evidence>,
    /// Human-readable evidence, e.g. `name:acme` or `attr:InstallLocation`
    pub hits: Vec<String>,
}

#[derive(Default)]
struct Accumulator {
    name: f32,
    attribute_text: f32,
    install_path: f32,
    uninstall: f32,
    executable: f32,
    hits: Vec<String>,
}

impl Accumulator {
    fn total(&self) -> f32 {
        (self.name + self.attribute_text + self.install_path + self.uninstall + self.executable)
            .clamp(0.0, 1.0)
    }

    fn categories(&self) -> Vec<Evidence> {
        [
            (self.name, Evidence::Name),
            (self.attribute_text, Evidence::AttributeText),
            (self.install_path, Evidence::InstallPath),
            (self.uninstall, Evidence::UninstallCommand),
            (self.executable, Evidence::ExecutableExtension),
        ]
        .into_iter()
        .filter(|(score, _)| *score > 0.0)
        .map(|(_, category)| category)
        .collect()
    }
}

pub struct PatternAnalyzer {
    signature: Signature,
}

impl PatternAnalyzer {
    pub fn new(signature: Signature) -> Self {
        Self { signature }
    }

    pub fn for_target(target: &str, aliases: &AliasTable) -> Result<Self> {
        Ok(Self::new(Signature::for_target(target, aliases)?))
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn analyze(&self, surface: &Surface<'_>) -> Analysis {
        let mut acc = Accumulator::default();
        let name_lower = surface.name.to_lowercase();

        let name_hits = self.signature.hits(&name_lower);
        if !name_hits.is_empty() {
            let extra = (name_hits.len() - 1) as f32 * NAME_EXTRA;
            acc.name = (NAME_FIRST + extra).min(NAME_CAP);
            acc.hits
                .extend(name_hits.iter().map(|needle| format!("name:{}", needle)));
        }

        let mut attr_hits = 0usize;
        let mut has_uninstall = false;
        for (attr_name, value) in surface.attributes {
            let attr_lower = attr_name.to_lowercase();
            let text_lower = value.as_text().map(|t| t.to_lowercase());

            let value_hit = text_lower
                .as_deref()
                .is_some_and(|t| self.signature.matches(t));
            if value_hit || self.signature.matches(&attr_lower) {
                attr_hits += 1;
                acc.hits.push(format!("attr:{}", attr_name));
            }

            if value_hit && INSTALL_PATH_ATTRS.contains(&attr_lower.as_str()) {
                acc.install_path = INSTALL_PATH;
            }
            if UNINSTALL_ATTRS.contains(&attr_lower.as_str())
                && text_lower.as_deref().is_some_and(|t| !t.trim().is_empty())
            {
                has_uninstall = true;
            }
        }
        acc.attribute_text = (attr_hits as f32 * ATTR_EACH).min(ATTR_CAP);

        let matched = !name_hits.is_empty() || attr_hits > 0;
        if matched && has_uninstall {
            acc.uninstall = UNINSTALL_COMMAND;
            acc.hits.push("uninstall_command".to_string());
        }
        if !name_hits.is_empty()
            && EXECUTABLE_EXTENSIONS
                .iter()
                .any(|ext| name_lower.ends_with(ext))
        {
            acc.executable = EXECUTABLE;
        }

        Analysis {
            matched,
            confidence: acc.total(),
            categories: acc.categories(),
            hits: acc.hits,
        }
    }

    /// Risk of removing the node, 0 (harmless) to 3 (system-wide impact).
    pub fn assess_risk(&self, surface: &Surface<'_>, confidence: f32) -> u8 {
        let path_lower = surface.path.to_lowercase().replace('\\', "/");
        let mut risk: u8 = match surface.backend {
            BackendKind::ConfigStore => {
                if path_lower.starts_with("hklm/system/") {
                    3
                } else if path_lower.starts_with("hklm/") || path_lower.starts_with("hkcr/") {
                    2
                } else {
                    1
                }
            }
            BackendKind::Filesystem => {
                let shared = ["program files", "programdata", "/usr/", "/opt/", "/library/"]
                    .iter()
                    .any(|marker| path_lower.contains(marker));
                let executable = EXECUTABLE_EXTENSIONS
                    .iter()
                    .any(|ext| path_lower.ends_with(ext));
                u8::from(surface.kind == NodeKind::Container) + u8::from(shared || executable)
            }
        };
        if confidence < 0.5 {
            risk += 1;
        }
        risk.min(3)
    }
}
