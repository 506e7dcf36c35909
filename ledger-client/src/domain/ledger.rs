use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::telemetry::SwitchKey;

/// How far an entry's numbers can be trusted. Ordered so that `min` picks the
/// weaker of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown confidence '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationMethod {
    CumulativeMeter,
    PowerIntegration,
}

impl CalculationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CumulativeMeter => "cumulative_meter",
            Self::PowerIntegration => "power_integration",
        }
    }
}

impl FromStr for CalculationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cumulative_meter" => Ok(Self::CumulativeMeter),
            "power_integration" => Ok(Self::PowerIntegration),
            other => Err(format!("unknown calculation method '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Consumption,
    /// Zero-energy, zero-cost record of a counter rollback.
    ResetMarker,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consumption => "consumption",
            Self::ResetMarker => "reset_marker",
        }
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consumption" => Ok(Self::Consumption),
            "reset_marker" => Ok(Self::ResetMarker),
            other => Err(format!("unknown entry kind '{other}'")),
        }
    }
}

/// Energy consumed over one closed interval of a switch. Never mutated;
/// corrections are new entries with `supersedes` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub device_id: String,
    pub switch_id: String,
    pub start_event_id: String,
    /// `None` when the interval was force-closed by an offline signal.
    pub end_event_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_ts: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_ts: OffsetDateTime,
    pub duration_seconds: f64,
    pub delta_energy_wh: f64,
    pub power_w: f64,
    pub cost_version_id: Option<i64>,
    pub cost_per_kwh: f64,
    pub cost_amount: f64,
    pub confidence: Confidence,
    pub calculation_method: CalculationMethod,
    pub kind: EntryKind,
    pub supersedes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl LedgerEntry {
    pub fn key(&self) -> SwitchKey {
        SwitchKey::switch(self.device_id.clone(), self.switch_id.clone())
    }

    pub fn is_correction(&self) -> bool {
        self.supersedes.is_some()
    }

    pub fn is_reset_marker(&self) -> bool {
        self.kind == EntryKind::ResetMarker
    }

    pub fn overlaps(&self, from: OffsetDateTime, to: OffsetDateTime) -> bool {
        self.start_ts < to && self.end_ts > from
    }

    /// Seconds of `[start_ts, end_ts)` that fall inside `[from, to)`.
    pub fn overlap_seconds(&self, from: OffsetDateTime, to: OffsetDateTime) -> f64 {
        let start = self.start_ts.max(from);
        let end = self.end_ts.min(to);
        if end <= start {
            0.0
        } else {
            (end - start).as_seconds_f64()
        }
    }
}
