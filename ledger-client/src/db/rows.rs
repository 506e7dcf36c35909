//! Flat row shapes for the Postgres tables and their conversion to domain
//! types. Enum columns are stored as their snake_case names.

use std::{collections::BTreeSet, str::FromStr};

use time::OffsetDateTime;

use crate::{
    domain::{
        Aggregate, Anomaly, CostScope, CostVersion, LedgerEntry, Payload, QualityFlag,
        TelemetryEvent,
    },
    store::StoreError,
};

fn parse_col<T>(column: &str, value: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e| StoreError::Decode(format!("{column}: {e}")))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub seq: i64,
    pub event_id: String,
    pub device_id: String,
    pub switch_id: Option<String>,
    pub ts: OffsetDateTime,
    pub received_at: OffsetDateTime,
    pub event_kind: String,
    pub payload: serde_json::Value,
    pub quality_flags: Vec<String>,
    pub processed: bool,
}

impl TryFrom<EventRow> for TelemetryEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let payload: Payload = serde_json::from_value(row.payload)?;
        if payload.kind().as_str() != row.event_kind {
            return Err(StoreError::Decode(format!(
                "event {} has kind '{}' but payload of '{}'",
                row.event_id,
                row.event_kind,
                payload.kind().as_str()
            )));
        }
        let quality_flags = row
            .quality_flags
            .iter()
            .map(|f| parse_col::<QualityFlag>("quality_flags", f))
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(TelemetryEvent {
            seq: row.seq,
            event_id: row.event_id,
            device_id: row.device_id,
            switch_id: row.switch_id,
            timestamp: row.ts,
            received_at: row.received_at,
            payload,
            quality_flags,
            processed: row.processed,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryRow {
    pub entry_id: String,
    pub device_id: String,
    pub switch_id: String,
    pub start_event_id: String,
    pub end_event_id: Option<String>,
    pub start_ts: OffsetDateTime,
    pub end_ts: OffsetDateTime,
    pub duration_seconds: f64,
    pub delta_energy_wh: f64,
    pub power_w: f64,
    pub cost_version_id: Option<i64>,
    pub cost_per_kwh: f64,
    pub cost_amount: f64,
    pub confidence: String,
    pub calculation_method: String,
    pub kind: String,
    pub supersedes: Option<String>,
    pub created_at: OffsetDateTime,
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            confidence: parse_col("confidence", &row.confidence)?,
            calculation_method: parse_col("calculation_method", &row.calculation_method)?,
            kind: parse_col("kind", &row.kind)?,
            entry_id: row.entry_id,
            device_id: row.device_id,
            switch_id: row.switch_id,
            start_event_id: row.start_event_id,
            end_event_id: row.end_event_id,
            start_ts: row.start_ts,
            end_ts: row.end_ts,
            duration_seconds: row.duration_seconds,
            delta_energy_wh: row.delta_energy_wh,
            power_w: row.power_w,
            cost_version_id: row.cost_version_id,
            cost_per_kwh: row.cost_per_kwh,
            cost_amount: row.cost_amount,
            supersedes: row.supersedes,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CostVersionRow {
    pub id: i64,
    pub cost_per_kwh: f64,
    pub effective_from: OffsetDateTime,
    pub scope: String,
    pub notes: Option<String>,
    pub created_at: OffsetDateTime,
}

impl TryFrom<CostVersionRow> for CostVersion {
    type Error = StoreError;

    fn try_from(row: CostVersionRow) -> Result<Self, Self::Error> {
        Ok(CostVersion {
            id: row.id,
            cost_per_kwh: row.cost_per_kwh,
            effective_from: row.effective_from,
            scope: parse_col::<CostScope>("scope", &row.scope)?,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AggregateRow {
    pub device_id: String,
    pub switch_scope: String,
    pub granularity: String,
    pub bucket: String,
    pub bucket_start: OffsetDateTime,
    pub bucket_end: OffsetDateTime,
    pub total_energy_wh: f64,
    pub total_cost: f64,
    pub on_time_seconds: f64,
    pub entry_count: i64,
    pub quality_score: f64,
}

impl TryFrom<AggregateRow> for Aggregate {
    type Error = StoreError;

    fn try_from(row: AggregateRow) -> Result<Self, Self::Error> {
        Ok(Aggregate {
            granularity: parse_col("granularity", &row.granularity)?,
            switch_scope: row.switch_scope.into(),
            device_id: row.device_id,
            bucket: row.bucket,
            bucket_start: row.bucket_start,
            bucket_end: row.bucket_end,
            total_energy_wh: row.total_energy_wh,
            total_cost: row.total_cost,
            on_time_seconds: row.on_time_seconds,
            entry_count: row.entry_count,
            quality_score: row.quality_score,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnomalyRow {
    pub anomaly_id: String,
    pub kind: String,
    pub device_id: String,
    pub switch_id: String,
    pub entry_ids: Vec<String>,
    pub window_start: OffsetDateTime,
    pub window_end: OffsetDateTime,
    pub detail: String,
    pub correction_entry_id: Option<String>,
    pub detected_at: OffsetDateTime,
}

impl TryFrom<AnomalyRow> for Anomaly {
    type Error = StoreError;

    fn try_from(row: AnomalyRow) -> Result<Self, Self::Error> {
        Ok(Anomaly {
            kind: parse_col("kind", &row.kind)?,
            anomaly_id: row.anomaly_id,
            device_id: row.device_id,
            switch_id: row.switch_id,
            entry_ids: row.entry_ids,
            window_start: row.window_start,
            window_end: row.window_end,
            detail: row.detail,
            correction_entry_id: row.correction_entry_id,
            detected_at: row.detected_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKind, SwitchScope};
    use time::macros::datetime;

    #[test]
    fn event_row_decodes_tagged_payload_and_flags() {
        let row = EventRow {
            seq: 4,
            event_id: "abc".to_string(),
            device_id: "esp-1".to_string(),
            switch_id: Some("2".to_string()),
            ts: datetime!(2024-03-01 10:00:00 UTC),
            received_at: datetime!(2024-03-01 10:00:01 UTC),
            event_kind: "switch_off".to_string(),
            payload: serde_json::json!({"event_kind": "switch_off", "meter_wh": 150.0}),
            quality_flags: vec!["out_of_order".to_string()],
            processed: false,
        };

        let event = TelemetryEvent::try_from(row).unwrap();
        assert_eq!(event.kind(), EventKind::SwitchOff);
        assert_eq!(event.payload.meter_wh(), Some(150.0));
        assert!(event.quality_flags.contains(&QualityFlag::OutOfOrder));
    }

    #[test]
    fn event_row_with_mismatched_kind_is_corrupt() {
        let row = EventRow {
            seq: 1,
            event_id: "abc".to_string(),
            device_id: "esp-1".to_string(),
            switch_id: None,
            ts: datetime!(2024-03-01 10:00:00 UTC),
            received_at: datetime!(2024-03-01 10:00:00 UTC),
            event_kind: "switch_on".to_string(),
            payload: serde_json::json!({"event_kind": "heartbeat"}),
            quality_flags: vec![],
            processed: true,
        };
        assert!(matches!(TelemetryEvent::try_from(row), Err(StoreError::Decode(_))));
    }

    #[test]
    fn aggregate_row_maps_star_scope_to_all() {
        let row = AggregateRow {
            device_id: "esp-1".to_string(),
            switch_scope: "*".to_string(),
            granularity: "monthly".to_string(),
            bucket: "2024-03".to_string(),
            bucket_start: datetime!(2024-02-29 18:30:00 UTC),
            bucket_end: datetime!(2024-03-31 18:30:00 UTC),
            total_energy_wh: 1.0,
            total_cost: 0.0075,
            on_time_seconds: 60.0,
            entry_count: 1,
            quality_score: 1.0,
        };
        let agg = Aggregate::try_from(row).unwrap();
        assert_eq!(agg.switch_scope, SwitchScope::All);
    }
}
