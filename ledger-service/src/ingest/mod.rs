//! Telemetry ingestion: validate, dedupe, flag and append.

pub mod decode;

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use ledger_client::{
    domain::{NewTelemetryEvent, QualityFlag, SwitchKey, TelemetryEvent},
    InsertOutcome, StoreError, TelemetryStore,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{oneshot, Notify};

pub use decode::{decode, DecodedTelemetry, RejectReason, TelemetrySubmission};

use crate::{config::IngestConfig, ids};

#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    /// Device clock may differ from arrival time by at most this much.
    pub drift_threshold: Duration,
    pub heartbeat_interval: Duration,
    /// A silence longer than `heartbeat_interval * gap_multiple` is a gap.
    pub gap_multiple: u32,
}

impl From<&IngestConfig> for QualitySettings {
    fn from(cfg: &IngestConfig) -> Self {
        Self {
            drift_threshold: Duration::from_secs(cfg.drift_threshold_secs),
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs),
            gap_multiple: cfg.gap_heartbeat_multiple,
        }
    }
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

/// Result of one submission. Item-level: one bad item never fails its batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted {
        event_id: String,
        quality_flags: BTreeSet<QualityFlag>,
    },
    Duplicate {
        event_id: String,
    },
    Rejected {
        reason: String,
    },
    /// Shed before validation because the ingest queue was full.
    Overloaded,
}

/// A submission travelling through the ingest pipeline, with an optional
/// channel to report its outcome back to the HTTP caller.
#[derive(Debug)]
pub struct Submission {
    pub telemetry: TelemetrySubmission,
    pub reply: Option<oneshot::Sender<IngestOutcome>>,
}

impl Submission {
    pub fn new(telemetry: TelemetrySubmission) -> Self {
        Self {
            telemetry,
            reply: None,
        }
    }

    /// Routing key for sharded workers. Events of one stream land on the same
    /// worker, so they are appended in arrival order.
    pub fn shard_key(&self) -> String {
        let device = self.telemetry.device_id.as_deref().unwrap_or_default();
        let switch = self.telemetry.switch_id.as_deref().unwrap_or_default();
        format!("{device}/{switch}")
    }
}

/// Compares a new event with the last stored event of its stream.
pub fn quality_flags(
    timestamp: OffsetDateTime,
    received_at: OffsetDateTime,
    previous: Option<&TelemetryEvent>,
    settings: &QualitySettings,
) -> BTreeSet<QualityFlag> {
    let mut flags = BTreeSet::new();

    if (received_at - timestamp).unsigned_abs() > settings.drift_threshold {
        flags.insert(QualityFlag::TimeDrift);
    }

    if let Some(prev) = previous {
        if timestamp < prev.timestamp {
            flags.insert(QualityFlag::OutOfOrder);
        } else {
            let max_silence = settings.heartbeat_interval * settings.gap_multiple;
            if (timestamp - prev.timestamp).unsigned_abs() > max_silence {
                flags.insert(QualityFlag::GapDetected);
            }
        }
    }

    flags
}

pub struct TelemetryIngestor {
    store: Arc<dyn TelemetryStore>,
    settings: QualitySettings,
    wake: Arc<Notify>,
}

impl TelemetryIngestor {
    pub fn new(store: Arc<dyn TelemetryStore>, settings: QualitySettings, wake: Arc<Notify>) -> Self {
        Self {
            store,
            settings,
            wake,
        }
    }

    /// Signalled after every accepted event.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub async fn ingest(
        &self,
        submission: &TelemetrySubmission,
        received_at: OffsetDateTime,
    ) -> Result<IngestOutcome, StoreError> {
        let decoded = match decode(submission) {
            Ok(d) => d,
            Err(reason) => {
                metrics::counter!("telemetry_ingest_rejected_total").increment(1);
                tracing::debug!(
                    device_id = submission.device_id.as_deref().unwrap_or("?"),
                    reason = %reason,
                    "rejected telemetry"
                );
                return Ok(IngestOutcome::Rejected {
                    reason: reason.to_string(),
                });
            }
        };

        let event_id = ids::event_id(
            &decoded.device_id,
            decoded.switch_id.as_deref(),
            decoded.timestamp,
            &decoded.payload,
        );

        if self.store.get_event(&event_id).await?.is_some() {
            metrics::counter!("telemetry_ingest_duplicate_total").increment(1);
            return Ok(IngestOutcome::Duplicate { event_id });
        }

        let key = SwitchKey::new(decoded.device_id.clone(), decoded.switch_id.clone());
        let previous = self.store.latest_event(&key).await?;
        let flags = quality_flags(decoded.timestamp, received_at, previous.as_ref(), &self.settings);

        let event = NewTelemetryEvent {
            event_id: event_id.clone(),
            device_id: decoded.device_id,
            switch_id: decoded.switch_id,
            timestamp: decoded.timestamp,
            received_at,
            payload: decoded.payload,
            quality_flags: flags.clone(),
        };

        match self.store.insert_event(event).await? {
            InsertOutcome::Inserted(stored) => {
                metrics::counter!("telemetry_ingest_accepted_total").increment(1);
                for flag in &flags {
                    metrics::counter!("telemetry_quality_flag_total", "flag" => flag.as_str()).increment(1);
                }
                tracing::debug!(
                    stream = %stored.key(),
                    event_id = %stored.event_id,
                    kind = stored.kind().as_str(),
                    "accepted telemetry"
                );
                self.wake.notify_one();
                Ok(IngestOutcome::Accepted {
                    event_id,
                    quality_flags: flags,
                })
            }
            // Lost a race with a concurrent copy of the same event.
            InsertOutcome::Duplicate => {
                metrics::counter!("telemetry_ingest_duplicate_total").increment(1);
                Ok(IngestOutcome::Duplicate { event_id })
            }
        }
    }
}
