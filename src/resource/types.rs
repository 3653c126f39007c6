use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Whether a node can hold children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Container,
    Leaf,
}

/// A typed attribute value. Registry values map onto these directly;
/// file metadata uses `Qword`, `Dword`, `Bool` and `Timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AttrValue {
    Str(String),
    ExpandStr(String),
    MultiStr(Vec<String>),
    Dword(u32),
    Qword(u64),
    Binary(Vec<u8>),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl AttrValue {
    /// Textual form used for pattern matching; numeric and binary data has none.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            AttrValue::Str(s) | AttrValue::ExpandStr(s) => Some(Cow::Borrowed(s.as_str())),
            AttrValue::MultiStr(items) => Some(Cow::Owned(items.join(" "))),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Str(_) => "REG_SZ",
            AttrValue::ExpandStr(_) => "REG_EXPAND_SZ",
            AttrValue::MultiStr(_) => "REG_MULTI_SZ",
            AttrValue::Dword(_) => "REG_DWORD",
            AttrValue::Qword(_) => "REG_QWORD",
            AttrValue::Binary(_) => "REG_BINARY",
            AttrValue::Bool(_) => "BOOL",
            AttrValue::Timestamp(_) => "TIMESTAMP",
        }
    }

    /// Approximate storage footprint of the value data in bytes.
    pub fn data_len(&self) -> u64 {
        match self {
            AttrValue::Str(s) | AttrValue::ExpandStr(s) => s.len() as u64,
            AttrValue::MultiStr(items) => items.iter().map(|s| s.len() as u64 + 1).sum(),
            AttrValue::Dword(_) => 4,
            AttrValue::Qword(_) => 8,
            AttrValue::Binary(b) => b.len() as u64,
            AttrValue::Bool(_) => 1,
            AttrValue::Timestamp(_) => 8,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

/// Ordered name → value map.
pub type Attributes = BTreeMap<String, AttrValue>;

/// One node of a resource tree, built fresh on every visit.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub attributes: Attributes,
}

impl ResourceNode {
    pub fn is_container(&self) -> bool {
        self.kind == NodeKind::Container
    }

    pub fn format_size(&self) -> String {
        if self.is_container() {
            return "<DIR>".to_string();
        }
        humansize::format_size(self.size, humansize::BINARY)
    }
}
