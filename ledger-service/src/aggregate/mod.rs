//! Daily and monthly rollups of the ledger.
//!
//! A bucket is always recomputed from the ledger entries overlapping it and
//! written in one upsert, so a rerun for the same bucket writes the same row.

pub mod bucket;

use std::{
    collections::{BTreeSet, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use ledger_client::{
    domain::{Aggregate, Confidence, Granularity, LedgerEntry, SwitchScope},
    AggregateStore, LedgerStore, StoreError,
};
use time::{OffsetDateTime, UtcOffset};
use tokio_util::sync::CancellationToken;

pub use bucket::Bucket;

use crate::locks::KeyedLocks;

/// One aggregate row's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketTarget {
    pub device_id: String,
    pub scope: SwitchScope,
    pub bucket: Bucket,
}

/// Computes one bucket from `entries`, which must include every entry of the
/// device overlapping the bucket (corrections included).
///
/// Each entry contributes the fraction of its energy and cost that falls
/// inside the bucket. Reset markers and superseded entries are skipped.
///
/// Count and quality belong to the bucket holding the entry's `start_ts`
/// only, so daily counts of a month add up to the monthly count.
pub fn compute(
    device_id: &str,
    scope: &SwitchScope,
    bucket: Bucket,
    offset: UtcOffset,
    entries: &[LedgerEntry],
) -> Aggregate {
    let (start, end) = bucket.bounds(offset);
    let superseded: HashSet<&str> = entries.iter().filter_map(|e| e.supersedes.as_deref()).collect();

    let mut counted: Vec<&LedgerEntry> = entries
        .iter()
        .filter(|e| e.device_id == device_id)
        .filter(|e| scope.switch_id().map_or(true, |s| e.switch_id == s))
        .filter(|e| !e.is_reset_marker() && !superseded.contains(e.entry_id.as_str()))
        .filter(|e| e.overlaps(start, end))
        .collect();
    // Fixed summation order keeps floating point totals reproducible.
    counted.sort_by(|a, b| (a.start_ts, &a.entry_id).cmp(&(b.start_ts, &b.entry_id)));

    let mut total_energy_wh = 0.0;
    let mut total_cost = 0.0;
    let mut on_time_seconds = 0.0;
    let mut entry_count = 0i64;
    let mut high = 0i64;

    for e in &counted {
        let overlap = e.overlap_seconds(start, end);
        let span = (e.end_ts - e.start_ts).as_seconds_f64();
        let fraction = if span > 0.0 { overlap / span } else { 0.0 };
        total_energy_wh += e.delta_energy_wh * fraction;
        total_cost += e.cost_amount * fraction;
        on_time_seconds += overlap;
        if e.start_ts >= start && e.start_ts < end {
            entry_count += 1;
            if e.confidence == Confidence::High {
                high += 1;
            }
        }
    }

    Aggregate {
        device_id: device_id.to_string(),
        switch_scope: scope.clone(),
        granularity: bucket.granularity(),
        bucket: bucket.label(),
        bucket_start: start,
        bucket_end: end,
        total_energy_wh,
        total_cost,
        on_time_seconds,
        entry_count,
        quality_score: quality_score(high, entry_count),
    }
}

/// Share of high-confidence entries; 1.0 for a bucket without entries.
fn quality_score(high: i64, entry_count: i64) -> f64 {
    if entry_count == 0 {
        1.0
    } else {
        high as f64 / entry_count as f64
    }
}

/// Buckets touched by new ledger entries and not yet recomputed.
pub struct DirtyBuckets {
    offset: UtcOffset,
    pending: Mutex<BTreeSet<BucketTarget>>,
}

impl DirtyBuckets {
    pub fn new(offset: UtcOffset) -> Self {
        Self {
            offset,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Marks the daily and monthly buckets of the entry's switch and of the
    /// whole device.
    pub fn mark_entry(&self, entry: &LedgerEntry) {
        self.mark_span(&entry.device_id, &entry.switch_id, entry.start_ts, entry.end_ts);
    }

    pub fn mark_entries(&self, entries: &[LedgerEntry]) {
        for e in entries {
            self.mark_entry(e);
        }
    }

    pub fn mark_span(&self, device_id: &str, switch_id: &str, from: OffsetDateTime, to: OffsetDateTime) {
        let targets = targets_for_span(device_id, switch_id, from, to, self.offset);
        self.extend(targets);
    }

    pub fn extend(&self, targets: impl IntoIterator<Item = BucketTarget>) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.extend(targets);
    }

    pub fn drain(&self) -> Vec<BucketTarget> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *pending).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn targets_for_span(
    device_id: &str,
    switch_id: &str,
    from: OffsetDateTime,
    to: OffsetDateTime,
    offset: UtcOffset,
) -> Vec<BucketTarget> {
    let mut out = Vec::new();
    for granularity in [Granularity::Daily, Granularity::Monthly] {
        for bucket in Bucket::covering(from, to, granularity, offset) {
            for scope in [SwitchScope::Switch(switch_id.to_string()), SwitchScope::All] {
                out.push(BucketTarget {
                    device_id: device_id.to_string(),
                    scope,
                    bucket,
                });
            }
        }
    }
    out
}

pub struct Aggregator {
    ledger: Arc<dyn LedgerStore>,
    store: Arc<dyn AggregateStore>,
    offset: UtcOffset,
    locks: KeyedLocks<BucketTarget>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Aggregator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        store: Arc<dyn AggregateStore>,
        offset: UtcOffset,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            ledger,
            store,
            offset,
            locks: KeyedLocks::new(),
            max_retries,
            retry_backoff,
        }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    /// Bucket locks, shared with writers that must not interleave with a
    /// recomputation of the same buckets.
    pub fn locks(&self) -> &KeyedLocks<BucketTarget> {
        &self.locks
    }

    /// Computes a bucket from the ledger without writing it.
    pub async fn aggregate_bucket(
        &self,
        device_id: &str,
        scope: &SwitchScope,
        bucket: Bucket,
    ) -> Result<Aggregate, StoreError> {
        let (start, end) = bucket.bounds(self.offset);
        let entries = self
            .ledger
            .entries_overlapping(device_id, scope.switch_id(), start, end)
            .await?;
        Ok(compute(device_id, scope, bucket, self.offset, &entries))
    }

    /// Recomputes and overwrites one bucket.
    pub async fn recompute(&self, target: &BucketTarget) -> Result<Aggregate, StoreError> {
        let _guard = self.locks.lock(target).await;
        self.recompute_locked(target).await
    }

    /// Same as [`Aggregator::recompute`] for a caller already holding the
    /// bucket lock.
    pub async fn recompute_locked(&self, target: &BucketTarget) -> Result<Aggregate, StoreError> {
        let aggregate = self
            .aggregate_bucket(&target.device_id, &target.scope, target.bucket)
            .await?;
        self.write_with_retry(&aggregate).await?;
        metrics::counter!("aggregate_buckets_written_total").increment(1);
        Ok(aggregate)
    }

    async fn write_with_retry(&self, aggregate: &Aggregate) -> Result<(), StoreError> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.upsert_aggregate(aggregate).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        device_id = %aggregate.device_id,
                        bucket = %aggregate.bucket,
                        "aggregate write failed, retrying"
                    );
                    metrics::counter!("aggregate_write_retry_total").increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        device_id = %aggregate.device_id,
                        bucket = %aggregate.bucket,
                        "aggregate write failed, giving up"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Recomputes a batch, stopping early on cancellation. Targets not
    /// reached (or failed) are returned so the caller can retry them later.
    pub async fn recompute_all(
        &self,
        targets: Vec<BucketTarget>,
        cancel: &CancellationToken,
    ) -> (usize, Vec<BucketTarget>) {
        let mut written = 0;
        let mut leftover = Vec::new();
        let mut iter = targets.into_iter();

        while let Some(target) = iter.next() {
            if cancel.is_cancelled() {
                leftover.push(target);
                leftover.extend(iter);
                break;
            }
            match self.recompute(&target).await {
                Ok(_) => written += 1,
                Err(e) => {
                    tracing::error!(error = %e, device_id = %target.device_id, bucket = %target.bucket.label(), "bucket recompute failed");
                    leftover.push(target);
                }
            }
        }
        (written, leftover)
    }

    /// Month total built by summing the stored daily rows of that month.
    /// Daily rows that were never written count as empty.
    pub async fn monthly_from_daily(
        &self,
        device_id: &str,
        scope: &SwitchScope,
        month: Bucket,
    ) -> Result<Aggregate, StoreError> {
        let month = month.month();
        let days = month.days();
        let (first, last) = match (days.first(), days.last()) {
            (Some(f), Some(l)) => (f.label(), l.label()),
            _ => (month.label(), month.label()),
        };
        let daily = self
            .store
            .aggregates(device_id, scope, Granularity::Daily, &first, &last)
            .await?;

        let (start, end) = month.bounds(self.offset);
        let mut total = Aggregate {
            device_id: device_id.to_string(),
            switch_scope: scope.clone(),
            granularity: Granularity::Monthly,
            bucket: month.label(),
            bucket_start: start,
            bucket_end: end,
            total_energy_wh: 0.0,
            total_cost: 0.0,
            on_time_seconds: 0.0,
            entry_count: 0,
            quality_score: 1.0,
        };
        let mut high = 0i64;
        for day in &daily {
            total.total_energy_wh += day.total_energy_wh;
            total.total_cost += day.total_cost;
            total.on_time_seconds += day.on_time_seconds;
            total.entry_count += day.entry_count;
            high += (day.quality_score * day.entry_count as f64).round() as i64;
        }
        total.quality_score = quality_score(high, total.entry_count);
        Ok(total)
    }

    /// Drains `dirty` every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, dirty: Arc<DirtyBuckets>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let targets = dirty.drain();
            if targets.is_empty() {
                continue;
            }
            let count = targets.len();
            let (written, leftover) = self.recompute_all(targets, &cancel).await;
            tracing::info!(written, pending = leftover.len(), total = count, "aggregation pass finished");
            dirty.extend(leftover);
        }
        tracing::info!("aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_client::{
        domain::{CalculationMethod, EntryKind},
        MemoryStore,
    };
    use time::macros::{date, datetime, offset};

    const IST: UtcOffset = offset!(+05:30);

    fn entry(id: &str, switch: &str, start: OffsetDateTime, end: OffsetDateTime, wh: f64) -> LedgerEntry {
        LedgerEntry {
            entry_id: id.to_string(),
            device_id: "esp-1".to_string(),
            switch_id: switch.to_string(),
            start_event_id: format!("{id}-start"),
            end_event_id: Some(format!("{id}-end")),
            start_ts: start,
            end_ts: end,
            duration_seconds: (end - start).as_seconds_f64(),
            delta_energy_wh: wh,
            power_w: 60.0,
            cost_version_id: Some(1),
            cost_per_kwh: 7.5,
            cost_amount: wh / 1000.0 * 7.5,
            confidence: Confidence::High,
            calculation_method: CalculationMethod::PowerIntegration,
            kind: EntryKind::Consumption,
            supersedes: None,
            created_at: end,
        }
    }

    #[test]
    fn prorates_across_local_midnight() {
        // 23:00 to 01:00 local, 120 Wh.
        let e = entry(
            "a",
            "1",
            datetime!(2024-03-01 17:30 UTC),
            datetime!(2024-03-01 19:30 UTC),
            120.0,
        );

        let day1 = compute("esp-1", &SwitchScope::All, Bucket::day(date!(2024-03-01)), IST, &[e.clone()]);
        let day2 = compute("esp-1", &SwitchScope::All, Bucket::day(date!(2024-03-02)), IST, &[e]);

        assert!((day1.total_energy_wh - 60.0).abs() < 1e-9);
        assert!((day2.total_energy_wh - 60.0).abs() < 1e-9);
        assert_eq!(day1.on_time_seconds, 3600.0);
        assert_eq!(day1.entry_count, 1);
        // Counted once, on the day it started.
        assert_eq!(day2.entry_count, 0);
        assert_eq!(day2.quality_score, 1.0);
    }

    #[test]
    fn markers_and_superseded_entries_are_excluded() {
        let start = datetime!(2024-03-01 05:00 UTC);
        let negative = entry("neg", "1", start, start + time::Duration::HOUR, -40.0);
        let mut correction = entry("fix", "1", start, start + time::Duration::HOUR, 0.0);
        correction.kind = EntryKind::ResetMarker;
        correction.supersedes = Some("neg".to_string());
        let mut low = entry("ok", "2", start, start + time::Duration::HOUR, 10.0);
        low.confidence = Confidence::Low;

        let agg = compute(
            "esp-1",
            &SwitchScope::All,
            Bucket::day(date!(2024-03-01)),
            IST,
            &[negative, correction, low],
        );
        assert_eq!(agg.entry_count, 1);
        assert_eq!(agg.total_energy_wh, 10.0);
        assert_eq!(agg.quality_score, 0.0);

        let switch_one = compute(
            "esp-1",
            &SwitchScope::Switch("1".to_string()),
            Bucket::day(date!(2024-03-01)),
            IST,
            &[],
        );
        assert_eq!(switch_one.entry_count, 0);
        assert_eq!(switch_one.quality_score, 1.0);
    }

    #[test]
    fn dirty_targets_cover_switch_and_device() {
        let dirty = DirtyBuckets::new(IST);
        dirty.mark_entry(&entry(
            "a",
            "1",
            datetime!(2024-03-01 17:30 UTC),
            datetime!(2024-03-01 19:30 UTC),
            1.0,
        ));
        // two days and one month, each for the switch and for the device
        assert_eq!(dirty.len(), 6);
        assert_eq!(dirty.drain().len(), 6);
        assert!(dirty.is_empty());
    }

    #[tokio::test]
    async fn recompute_is_idempotent_and_monthly_matches_daily() {
        let store = Arc::new(MemoryStore::new());
        let mut low = entry("b", "1", datetime!(2024-03-10 04:00 UTC), datetime!(2024-03-10 06:00 UTC), 45.5);
        low.confidence = Confidence::Low;
        let entries = [
            entry("a", "1", datetime!(2024-03-01 17:30 UTC), datetime!(2024-03-01 19:30 UTC), 120.0),
            low,
            entry("c", "2", datetime!(2024-03-31 18:00 UTC), datetime!(2024-03-31 19:00 UTC), 30.0),
        ];
        for e in &entries {
            store.insert_entry(e.clone()).await.unwrap();
        }
        let agg = Aggregator::new(store.clone(), store.clone(), IST, 0, Duration::from_millis(1));
        let dirty = DirtyBuckets::new(IST);
        dirty.mark_entries(&entries);

        let targets = dirty.drain();
        let (written, leftover) = agg.recompute_all(targets.clone(), &CancellationToken::new()).await;
        assert_eq!(written, targets.len());
        assert!(leftover.is_empty());

        let march = Bucket::month_of(date!(2024-03-01));
        let first = agg
            .recompute(&BucketTarget {
                device_id: "esp-1".to_string(),
                scope: SwitchScope::All,
                bucket: march,
            })
            .await
            .unwrap();
        let again = agg
            .recompute(&BucketTarget {
                device_id: "esp-1".to_string(),
                scope: SwitchScope::All,
                bucket: march,
            })
            .await
            .unwrap();
        assert_eq!(first, again);

        let summed = agg.monthly_from_daily("esp-1", &SwitchScope::All, march).await.unwrap();
        assert!((summed.total_energy_wh - first.total_energy_wh).abs() < 1e-9);
        assert!((summed.total_cost - first.total_cost).abs() < 1e-9);
        assert!((summed.on_time_seconds - first.on_time_seconds).abs() < 1e-9);
        // "a" crosses local midnight but is counted once.
        assert_eq!(summed.entry_count, 3);
        assert_eq!(summed.entry_count, first.entry_count);
        assert_eq!(summed.quality_score, first.quality_score);
        assert!((first.quality_score - 2.0 / 3.0).abs() < 1e-12);
        // "c" runs 23:30 to 00:30 local on 31 March, so half lands in April.
        assert!((first.total_energy_wh - (120.0 + 45.5 + 15.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cancelled_batch_returns_leftovers() {
        let store = Arc::new(MemoryStore::new());
        let agg = Aggregator::new(store.clone(), store.clone(), IST, 0, Duration::from_millis(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let targets = targets_for_span(
            "esp-1",
            "1",
            datetime!(2024-03-01 05:00 UTC),
            datetime!(2024-03-01 06:00 UTC),
            IST,
        );
        let (written, leftover) = agg.recompute_all(targets.clone(), &cancel).await;
        assert_eq!(written, 0);
        assert_eq!(leftover, targets);
    }
}
