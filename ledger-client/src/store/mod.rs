//! The four logical stores of the pipeline plus the review queue.
//!
//! Telemetry, ledger and cost versions are append-only. Aggregates are
//! overwritten per bucket in a single write, so readers never see a partially
//! recomputed bucket.

mod memory;

pub use memory::MemoryStore;

use time::OffsetDateTime;

use crate::domain::{
    Aggregate, Anomaly, BucketTotal, CostVersion, EntryKind, EventKind, EventPosition, Granularity,
    LedgerEntry, NewCostVersion, NewTelemetryEvent, SwitchKey, SwitchScope, TelemetryEvent,
};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(TelemetryEvent),
    /// An event with the same `event_id` is already stored; nothing was written.
    Duplicate,
}

#[async_trait::async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Insert-if-absent keyed by `event_id`.
    async fn insert_event(&self, event: NewTelemetryEvent) -> Result<InsertOutcome, StoreError>;

    async fn get_event(&self, event_id: &str) -> Result<Option<TelemetryEvent>, StoreError>;

    /// Last event of the stream by `(timestamp, seq)`.
    async fn latest_event(&self, key: &SwitchKey) -> Result<Option<TelemetryEvent>, StoreError>;

    /// Last event of any stream of the device, optionally of one kind only.
    async fn latest_device_event(
        &self,
        device_id: &str,
        kind: Option<EventKind>,
    ) -> Result<Option<TelemetryEvent>, StoreError>;

    async fn unprocessed_keys(&self) -> Result<Vec<SwitchKey>, StoreError>;

    /// Unprocessed events of one stream in `(timestamp, seq)` order.
    async fn unprocessed_events(&self, key: &SwitchKey) -> Result<Vec<TelemetryEvent>, StoreError>;

    /// Every event of the stream strictly after `after` (or all when `None`),
    /// processed or not, in `(timestamp, seq)` order.
    async fn events_after(
        &self,
        key: &SwitchKey,
        after: Option<EventPosition>,
    ) -> Result<Vec<TelemetryEvent>, StoreError>;

    /// Events of any stream of the device with `from <= timestamp <= to`.
    async fn device_events_between(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<TelemetryEvent>, StoreError>;

    async fn mark_processed(&self, event_ids: &[String]) -> Result<(), StoreError>;

    /// Distinct switch-level streams, optionally of one device.
    async fn switch_keys(&self, device_id: Option<&str>) -> Result<Vec<SwitchKey>, StoreError>;
}

#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert-if-absent keyed by `entry_id`. Returns whether a row was written.
    async fn insert_entry(&self, entry: LedgerEntry) -> Result<bool, StoreError>;

    /// The non-correction entry of `kind` opened by `start_event_id`, if any.
    async fn entry_for_start(
        &self,
        start_event_id: &str,
        kind: EntryKind,
    ) -> Result<Option<LedgerEntry>, StoreError>;

    /// The non-correction entry of the switch with the greatest `end_ts`.
    async fn latest_entry(&self, key: &SwitchKey) -> Result<Option<LedgerEntry>, StoreError>;

    /// Entries (corrections included) whose `[start_ts, end_ts)` overlaps
    /// `[from, to)`, ordered by `(start_ts, entry_id)`.
    async fn entries_overlapping(
        &self,
        device_id: &str,
        switch_id: Option<&str>,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn ledger_keys(&self) -> Result<Vec<SwitchKey>, StoreError>;
}

#[async_trait::async_trait]
pub trait CostStore: Send + Sync {
    async fn insert_cost_version(&self, version: NewCostVersion) -> Result<CostVersion, StoreError>;

    /// All versions ordered by `(effective_from, id)`.
    async fn cost_versions(&self) -> Result<Vec<CostVersion>, StoreError>;
}

#[async_trait::async_trait]
pub trait AggregateStore: Send + Sync {
    /// Replaces the whole row for the aggregate's identity.
    async fn upsert_aggregate(&self, aggregate: &Aggregate) -> Result<(), StoreError>;

    /// Rows with `from_bucket <= bucket <= to_bucket`, ordered by bucket.
    async fn aggregates(
        &self,
        device_id: &str,
        scope: &SwitchScope,
        granularity: Granularity,
        from_bucket: &str,
        to_bucket: &str,
    ) -> Result<Vec<Aggregate>, StoreError>;

    /// Per-bucket totals of the whole-device (`SwitchScope::All`) rows of
    /// `device_ids`, ordered by bucket.
    async fn rollup(
        &self,
        device_ids: &[String],
        granularity: Granularity,
        from_bucket: &str,
        to_bucket: &str,
    ) -> Result<Vec<BucketTotal>, StoreError>;
}

#[async_trait::async_trait]
pub trait ReviewQueue: Send + Sync {
    /// Returns false when an anomaly with the same id is already queued.
    async fn enqueue(&self, anomaly: Anomaly) -> Result<bool, StoreError>;

    async fn pending(&self) -> Result<Vec<Anomaly>, StoreError>;
}
