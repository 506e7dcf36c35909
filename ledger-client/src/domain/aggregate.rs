use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Daily,
    Monthly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

/// One switch, or every switch of the device. Serialized as the switch id or
/// `"*"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SwitchScope {
    All,
    Switch(String),
}

impl SwitchScope {
    pub fn switch_id(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Switch(s) => Some(s),
        }
    }
}

impl fmt::Display for SwitchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Switch(s) => f.write_str(s),
        }
    }
}

impl From<String> for SwitchScope {
    fn from(value: String) -> Self {
        if value == "*" {
            Self::All
        } else {
            Self::Switch(value)
        }
    }
}

impl From<SwitchScope> for String {
    fn from(value: SwitchScope) -> Self {
        value.to_string()
    }
}

/// Rollup of ledger entries over one local-time calendar bucket.
///
/// `bucket` is `YYYY-MM-DD` for daily and `YYYY-MM` for monthly rows; both
/// sort lexically in calendar order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub device_id: String,
    pub switch_scope: SwitchScope,
    pub granularity: Granularity,
    pub bucket: String,
    #[serde(with = "time::serde::rfc3339")]
    pub bucket_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub bucket_end: OffsetDateTime,
    pub total_energy_wh: f64,
    pub total_cost: f64,
    pub on_time_seconds: f64,
    pub entry_count: i64,
    /// Fraction of counted entries with high confidence; 1.0 for an empty bucket.
    pub quality_score: f64,
}

/// Per-bucket sum of several aggregate rows (devices of a classroom, or a
/// single device's rows passed through unchanged).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketTotal {
    pub bucket: String,
    pub total_energy_wh: f64,
    pub total_cost: f64,
    pub on_time_seconds: f64,
    pub entry_count: i64,
    /// Entry-weighted mean of the rows' quality scores; 1.0 with no entries.
    pub quality_score: f64,
    /// Rows that contributed.
    pub devices: i64,
}

/// Groups `rows` by bucket, in bucket order.
pub fn rollup_by_bucket<'a>(rows: impl IntoIterator<Item = &'a Aggregate>) -> Vec<BucketTotal> {
    let mut sums: BTreeMap<&str, (BucketTotal, f64)> = BTreeMap::new();
    for row in rows {
        let (total, weighted) = sums.entry(row.bucket.as_str()).or_insert_with(|| {
            (
                BucketTotal {
                    bucket: row.bucket.clone(),
                    total_energy_wh: 0.0,
                    total_cost: 0.0,
                    on_time_seconds: 0.0,
                    entry_count: 0,
                    quality_score: 1.0,
                    devices: 0,
                },
                0.0,
            )
        });
        total.total_energy_wh += row.total_energy_wh;
        total.total_cost += row.total_cost;
        total.on_time_seconds += row.on_time_seconds;
        total.entry_count += row.entry_count;
        total.devices += 1;
        *weighted += row.quality_score * row.entry_count as f64;
    }
    sums.into_values()
        .map(|(mut total, weighted)| {
            if total.entry_count > 0 {
                total.quality_score = weighted / total.entry_count as f64;
            }
            total
        })
        .collect()
}
