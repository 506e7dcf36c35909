use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Where a cost version applies. Serialized as `"global"` or
/// `"classroom:<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CostScope {
    Global,
    Classroom(String),
}

impl CostScope {
    /// Higher is narrower.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::Global => 0,
            Self::Classroom(_) => 1,
        }
    }
}

impl fmt::Display for CostScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Classroom(c) => write!(f, "classroom:{c}"),
        }
    }
}

impl FromStr for CostScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "global" => Ok(Self::Global),
            Some(("classroom", name)) if !name.trim().is_empty() => {
                Ok(Self::Classroom(name.trim().to_string()))
            }
            _ => Err(format!("invalid cost scope '{s}'")),
        }
    }
}

impl TryFrom<String> for CostScope {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CostScope> for String {
    fn from(value: CostScope) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCostVersion {
    pub cost_per_kwh: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_from: OffsetDateTime,
    pub scope: CostScope,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostVersion {
    pub id: i64,
    pub cost_per_kwh: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_from: OffsetDateTime,
    pub scope: CostScope,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
