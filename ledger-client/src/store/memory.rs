use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Mutex, MutexGuard},
};

use time::OffsetDateTime;

use super::{
    AggregateStore, CostStore, InsertOutcome, LedgerStore, ReviewQueue, StoreError, TelemetryStore,
};
use crate::domain::{
    rollup_by_bucket, Aggregate, Anomaly, BucketTotal, CostVersion, EntryKind, EventKind, EventPosition,
    Granularity, LedgerEntry, NewCostVersion, NewTelemetryEvent, SwitchKey, SwitchScope,
    TelemetryEvent,
};

type AggregateKey = (String, SwitchScope, Granularity, String);

#[derive(Default)]
struct Inner {
    events: Vec<TelemetryEvent>,
    event_index: HashMap<String, usize>,
    entries: Vec<LedgerEntry>,
    entry_index: HashMap<String, usize>,
    cost_versions: Vec<CostVersion>,
    aggregates: BTreeMap<AggregateKey, Aggregate>,
    review: Vec<Anomaly>,
}

/// Process-local implementation of every store. Each call holds the lock for
/// its whole read or write, which makes inserts and overwrites atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sorted_by_position(mut events: Vec<TelemetryEvent>) -> Vec<TelemetryEvent> {
    events.sort_by_key(|e| e.position());
    events
}

#[async_trait::async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_event(&self, event: NewTelemetryEvent) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner();
        if inner.event_index.contains_key(&event.event_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        let seq = inner.events.len() as i64 + 1;
        let stored = TelemetryEvent::from_new(event, seq);
        let idx = inner.events.len();
        inner.event_index.insert(stored.event_id.clone(), idx);
        inner.events.push(stored.clone());
        Ok(InsertOutcome::Inserted(stored))
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<TelemetryEvent>, StoreError> {
        let inner = self.inner();
        Ok(inner
            .event_index
            .get(event_id)
            .map(|&idx| inner.events[idx].clone()))
    }

    async fn latest_event(&self, key: &SwitchKey) -> Result<Option<TelemetryEvent>, StoreError> {
        let inner = self.inner();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.device_id == key.device_id && e.switch_id == key.switch_id)
            .max_by_key(|e| e.position())
            .cloned())
    }

    async fn latest_device_event(
        &self,
        device_id: &str,
        kind: Option<EventKind>,
    ) -> Result<Option<TelemetryEvent>, StoreError> {
        let inner = self.inner();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.device_id == device_id)
            .filter(|e| kind.map_or(true, |k| e.kind() == k))
            .max_by_key(|e| e.position())
            .cloned())
    }

    async fn unprocessed_keys(&self) -> Result<Vec<SwitchKey>, StoreError> {
        let inner = self.inner();
        let keys: BTreeSet<SwitchKey> = inner
            .events
            .iter()
            .filter(|e| !e.processed)
            .map(|e| e.key())
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn unprocessed_events(&self, key: &SwitchKey) -> Result<Vec<TelemetryEvent>, StoreError> {
        let inner = self.inner();
        let events = inner
            .events
            .iter()
            .filter(|e| !e.processed && e.device_id == key.device_id && e.switch_id == key.switch_id)
            .cloned()
            .collect();
        Ok(sorted_by_position(events))
    }

    async fn events_after(
        &self,
        key: &SwitchKey,
        after: Option<EventPosition>,
    ) -> Result<Vec<TelemetryEvent>, StoreError> {
        let inner = self.inner();
        let events = inner
            .events
            .iter()
            .filter(|e| e.device_id == key.device_id && e.switch_id == key.switch_id)
            .filter(|e| after.map_or(true, |pos| e.position() > pos))
            .cloned()
            .collect();
        Ok(sorted_by_position(events))
    }

    async fn device_events_between(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<TelemetryEvent>, StoreError> {
        let inner = self.inner();
        let events = inner
            .events
            .iter()
            .filter(|e| e.device_id == device_id && e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect();
        Ok(sorted_by_position(events))
    }

    async fn mark_processed(&self, event_ids: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner();
        for id in event_ids {
            if let Some(&idx) = inner.event_index.get(id) {
                inner.events[idx].processed = true;
            }
        }
        Ok(())
    }

    async fn switch_keys(&self, device_id: Option<&str>) -> Result<Vec<SwitchKey>, StoreError> {
        let inner = self.inner();
        let keys: BTreeSet<SwitchKey> = inner
            .events
            .iter()
            .filter(|e| e.switch_id.is_some())
            .filter(|e| device_id.map_or(true, |d| e.device_id == d))
            .map(|e| e.key())
            .collect();
        Ok(keys.into_iter().collect())
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_entry(&self, entry: LedgerEntry) -> Result<bool, StoreError> {
        let mut inner = self.inner();
        if inner.entry_index.contains_key(&entry.entry_id) {
            return Ok(false);
        }
        let idx = inner.entries.len();
        inner.entry_index.insert(entry.entry_id.clone(), idx);
        inner.entries.push(entry);
        Ok(true)
    }

    async fn entry_for_start(
        &self,
        start_event_id: &str,
        kind: EntryKind,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let inner = self.inner();
        Ok(inner
            .entries
            .iter()
            .find(|e| !e.is_correction() && e.kind == kind && e.start_event_id == start_event_id)
            .cloned())
    }

    async fn latest_entry(&self, key: &SwitchKey) -> Result<Option<LedgerEntry>, StoreError> {
        let Some(switch_id) = key.switch_id.as_deref() else {
            return Ok(None);
        };
        let inner = self.inner();
        Ok(inner
            .entries
            .iter()
            .filter(|e| !e.is_correction() && e.device_id == key.device_id && e.switch_id == switch_id)
            .max_by(|a, b| (a.end_ts, a.start_ts).cmp(&(b.end_ts, b.start_ts)))
            .cloned())
    }

    async fn entries_overlapping(
        &self,
        device_id: &str,
        switch_id: Option<&str>,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let inner = self.inner();
        let mut entries: Vec<LedgerEntry> = inner
            .entries
            .iter()
            .filter(|e| e.device_id == device_id)
            .filter(|e| switch_id.map_or(true, |s| e.switch_id == s))
            .filter(|e| e.overlaps(from, to))
            .cloned()
            .collect();
        entries.sort_by(|a, b| (a.start_ts, &a.entry_id).cmp(&(b.start_ts, &b.entry_id)));
        Ok(entries)
    }

    async fn ledger_keys(&self) -> Result<Vec<SwitchKey>, StoreError> {
        let inner = self.inner();
        let keys: BTreeSet<SwitchKey> = inner.entries.iter().map(|e| e.key()).collect();
        Ok(keys.into_iter().collect())
    }
}

#[async_trait::async_trait]
impl CostStore for MemoryStore {
    async fn insert_cost_version(&self, version: NewCostVersion) -> Result<CostVersion, StoreError> {
        let mut inner = self.inner();
        let stored = CostVersion {
            id: inner.cost_versions.len() as i64 + 1,
            cost_per_kwh: version.cost_per_kwh,
            effective_from: version.effective_from,
            scope: version.scope,
            notes: version.notes,
            created_at: OffsetDateTime::now_utc(),
        };
        inner.cost_versions.push(stored.clone());
        Ok(stored)
    }

    async fn cost_versions(&self) -> Result<Vec<CostVersion>, StoreError> {
        let inner = self.inner();
        let mut versions = inner.cost_versions.clone();
        versions.sort_by_key(|v| (v.effective_from, v.id));
        Ok(versions)
    }
}

#[async_trait::async_trait]
impl AggregateStore for MemoryStore {
    async fn upsert_aggregate(&self, aggregate: &Aggregate) -> Result<(), StoreError> {
        let key = (
            aggregate.device_id.clone(),
            aggregate.switch_scope.clone(),
            aggregate.granularity,
            aggregate.bucket.clone(),
        );
        self.inner().aggregates.insert(key, aggregate.clone());
        Ok(())
    }

    async fn aggregates(
        &self,
        device_id: &str,
        scope: &SwitchScope,
        granularity: Granularity,
        from_bucket: &str,
        to_bucket: &str,
    ) -> Result<Vec<Aggregate>, StoreError> {
        let inner = self.inner();
        Ok(inner
            .aggregates
            .values()
            .filter(|a| {
                a.device_id == device_id
                    && &a.switch_scope == scope
                    && a.granularity == granularity
                    && a.bucket.as_str() >= from_bucket
                    && a.bucket.as_str() <= to_bucket
            })
            .cloned()
            .collect())
    }

    async fn rollup(
        &self,
        device_ids: &[String],
        granularity: Granularity,
        from_bucket: &str,
        to_bucket: &str,
    ) -> Result<Vec<BucketTotal>, StoreError> {
        let inner = self.inner();
        Ok(rollup_by_bucket(inner.aggregates.values().filter(|a| {
            device_ids.contains(&a.device_id)
                && a.switch_scope == SwitchScope::All
                && a.granularity == granularity
                && a.bucket.as_str() >= from_bucket
                && a.bucket.as_str() <= to_bucket
        })))
    }
}

#[async_trait::async_trait]
impl ReviewQueue for MemoryStore {
    async fn enqueue(&self, anomaly: Anomaly) -> Result<bool, StoreError> {
        let mut inner = self.inner();
        if inner.review.iter().any(|a| a.anomaly_id == anomaly.anomaly_id) {
            return Ok(false);
        }
        inner.review.push(anomaly);
        Ok(true)
    }

    async fn pending(&self) -> Result<Vec<Anomaly>, StoreError> {
        Ok(self.inner().review.clone())
    }
}
