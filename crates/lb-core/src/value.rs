use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Host-side rendering of an engine value. Owns all of its data; conversion
/// never keeps a reference into interpreter memory.
///
/// `Absent` stands in both for "no value" and for engine kinds the bridge
/// cannot represent (functions, threads, userdata). The two are deliberately
/// indistinguishable so that conversion stays total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostValue {
    Absent,
    Bool(bool),
    Number(f64),
    String(String),
    Sequence(Vec<HostValue>),
    Mapping(BTreeMap<String, HostValue>),
}

impl HostValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Sequence(_) => "sequence",
            Self::Mapping(_) => "mapping",
        }
    }
}
