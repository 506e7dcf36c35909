use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Consumption entry with negative energy and no reset marker covering it.
    NegativeDelta,
    /// Silence between two entries longer than the threshold, with no heartbeat.
    UnexplainedGap,
    /// An entry ending after the next entry of the same switch starts.
    OverlappingEntries,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NegativeDelta => "negative_delta",
            Self::UnexplainedGap => "unexplained_gap",
            Self::OverlappingEntries => "overlapping_entries",
        }
    }
}

impl FromStr for AnomalyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "negative_delta" => Ok(Self::NegativeDelta),
            "unexplained_gap" => Ok(Self::UnexplainedGap),
            "overlapping_entries" => Ok(Self::OverlappingEntries),
            other => Err(format!("unknown anomaly kind '{other}'")),
        }
    }
}

/// A finding of the reconciliation scan. Ones that could not be fixed
/// deterministically are queued for manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Stable across scans so re-running does not queue twice.
    pub anomaly_id: String,
    pub kind: AnomalyKind,
    pub device_id: String,
    pub switch_id: String,
    pub entry_ids: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub window_end: OffsetDateTime,
    pub detail: String,
    /// Set when the scan repaired it; points at the correction entry.
    pub correction_entry_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
}

impl Anomaly {
    pub fn is_fixed(&self) -> bool {
        self.correction_entry_id.is_some()
    }
}
