//! Periodic audit of the ledger against telemetry.
//!
//! Detected anomalies are either fixed by appending a correction entry (the
//! original stays in place and is superseded) or queued for review. Affected
//! aggregate buckets are recomputed afterwards.

use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};

use ledger_client::{
    domain::{
        Anomaly, AnomalyKind, CalculationMethod, Confidence, EntryKind, EventKind, LedgerEntry,
        SwitchKey,
    },
    LedgerStore, ReviewQueue, StoreError, TelemetryStore,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{targets_for_span, Aggregator, BucketTarget},
    ids,
};

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    /// Silence between consecutive entries above which a gap is suspicious.
    pub gap_threshold: Duration,
    /// How far back each periodic run looks.
    pub lookback: Duration,
}

#[derive(Debug, Default, Serialize)]
pub struct ReconciliationReport {
    pub streams_scanned: usize,
    pub entries_scanned: usize,
    pub anomalies: Vec<Anomaly>,
    pub fixes_applied: usize,
    pub queued_for_review: usize,
    pub buckets_recomputed: usize,
    /// The run stopped early; streams after the interruption were not scanned.
    pub cancelled: bool,
}

pub struct ReconciliationJob {
    telemetry: Arc<dyn TelemetryStore>,
    ledger: Arc<dyn LedgerStore>,
    review: Arc<dyn ReviewQueue>,
    aggregator: Arc<Aggregator>,
    settings: ReconcileSettings,
}

impl ReconciliationJob {
    pub fn new(
        telemetry: Arc<dyn TelemetryStore>,
        ledger: Arc<dyn LedgerStore>,
        review: Arc<dyn ReviewQueue>,
        aggregator: Arc<Aggregator>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            telemetry,
            ledger,
            review,
            aggregator,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Audits every stream's entries overlapping `[from, to)`.
    ///
    /// Reruns are safe: anomaly ids are derived from the entries involved,
    /// and a fixed entry is superseded so it is not detected again.
    pub async fn run(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationReport, StoreError> {
        let mut report = ReconciliationReport::default();
        let mut dirty: BTreeSet<BucketTarget> = BTreeSet::new();

        for key in self.ledger.ledger_keys().await? {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.audit_stream(&key, from, to, &mut report, &mut dirty).await?;
            report.streams_scanned += 1;
        }

        for target in dirty {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.aggregator.recompute(&target).await?;
            report.buckets_recomputed += 1;
        }

        tracing::info!(
            streams = report.streams_scanned,
            entries = report.entries_scanned,
            anomalies = report.anomalies.len(),
            fixes = report.fixes_applied,
            queued = report.queued_for_review,
            cancelled = report.cancelled,
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn audit_stream(
        &self,
        key: &SwitchKey,
        from: OffsetDateTime,
        to: OffsetDateTime,
        report: &mut ReconciliationReport,
        dirty: &mut BTreeSet<BucketTarget>,
    ) -> Result<(), StoreError> {
        let entries = self
            .ledger
            .entries_overlapping(&key.device_id, key.switch_id.as_deref(), from, to)
            .await?;
        report.entries_scanned += entries.len();

        let superseded: HashSet<&str> = entries.iter().filter_map(|e| e.supersedes.as_deref()).collect();
        let live: Vec<&LedgerEntry> = entries
            .iter()
            .filter(|e| !superseded.contains(e.entry_id.as_str()))
            .collect();

        for entry in live.iter().filter(|e| e.kind == EntryKind::Consumption && e.delta_energy_wh < 0.0) {
            self.handle_negative(entry, report, dirty).await?;
        }

        for pair in live.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.end_ts > b.start_ts {
                let detail = format!(
                    "entry {} ends at {} after entry {} starts at {}",
                    a.entry_id, a.end_ts, b.entry_id, b.start_ts
                );
                let anomaly = anomaly(AnomalyKind::OverlappingEntries, &[a, b], b.start_ts, a.end_ts, detail);
                self.queue(anomaly, report).await?;
            } else if (b.start_ts - a.end_ts).unsigned_abs() > self.settings.gap_threshold {
                let seen = self
                    .telemetry
                    .device_events_between(&a.device_id, a.end_ts, b.start_ts)
                    .await?;
                let alive = seen.iter().any(|e| {
                    e.timestamp > a.end_ts
                        && e.timestamp < b.start_ts
                        && matches!(e.kind(), EventKind::Heartbeat | EventKind::PowerReading)
                });
                if !alive {
                    let detail = format!(
                        "no telemetry from {} between {} and {}",
                        a.device_id, a.end_ts, b.start_ts
                    );
                    let anomaly = anomaly(AnomalyKind::UnexplainedGap, &[a, b], a.end_ts, b.start_ts, detail);
                    self.queue(anomaly, report).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_negative(
        &self,
        entry: &LedgerEntry,
        report: &mut ReconciliationReport,
        dirty: &mut BTreeSet<BucketTarget>,
    ) -> Result<(), StoreError> {
        let mut anomaly = anomaly(
            AnomalyKind::NegativeDelta,
            &[entry],
            entry.start_ts,
            entry.end_ts,
            format!("entry {} has delta {} Wh", entry.entry_id, entry.delta_energy_wh),
        );

        if !self.is_meter_rollback(entry).await? {
            return self.queue(anomaly, report).await;
        }

        let correction = reset_correction(entry);
        let targets = targets_for_span(
            &entry.device_id,
            &entry.switch_id,
            entry.start_ts,
            entry.end_ts,
            self.aggregator.offset(),
        );
        let inserted = {
            // Bucket recomputations must see either both entries or neither.
            let _guards = self.aggregator.locks().lock_many(&targets).await;
            self.ledger.insert_entry(correction.clone()).await?
        };

        anomaly.correction_entry_id = Some(correction.entry_id.clone());
        anomaly.detail = format!("{}; counter rollback, superseded by reset marker", anomaly.detail);
        if inserted {
            report.fixes_applied += 1;
            metrics::counter!("reconcile_fixes_total").increment(1);
            tracing::info!(
                entry_id = %entry.entry_id,
                correction_id = %correction.entry_id,
                "negative delta replaced by reset marker"
            );
        }
        dirty.extend(targets);
        metrics::counter!("reconcile_anomalies_total", "kind" => anomaly.kind.as_str()).increment(1);
        report.anomalies.push(anomaly);
        Ok(())
    }

    /// A negative metered delta is a counter rollback when both endpoint
    /// events carry counter values and the later one is smaller.
    async fn is_meter_rollback(&self, entry: &LedgerEntry) -> Result<bool, StoreError> {
        if entry.calculation_method != CalculationMethod::CumulativeMeter {
            return Ok(false);
        }
        let Some(end_id) = entry.end_event_id.as_deref() else {
            return Ok(false);
        };
        let start = self.telemetry.get_event(&entry.start_event_id).await?;
        let end = self.telemetry.get_event(end_id).await?;
        let values = (
            start.and_then(|e| e.payload.meter_wh()),
            end.and_then(|e| e.payload.meter_wh()),
        );
        Ok(matches!(values, (Some(s), Some(e)) if e < s))
    }

    async fn queue(&self, anomaly: Anomaly, report: &mut ReconciliationReport) -> Result<(), StoreError> {
        if self.review.enqueue(anomaly.clone()).await? {
            report.queued_for_review += 1;
            tracing::warn!(
                kind = anomaly.kind.as_str(),
                anomaly_id = %anomaly.anomaly_id,
                device_id = %anomaly.device_id,
                switch_id = %anomaly.switch_id,
                detail = %anomaly.detail,
                "anomaly queued for review"
            );
        }
        metrics::counter!("reconcile_anomalies_total", "kind" => anomaly.kind.as_str()).increment(1);
        report.anomalies.push(anomaly);
        Ok(())
    }

    /// Runs over the lookback window every `interval` until cancelled.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it so startup is not
        // dominated by an audit.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let to = OffsetDateTime::now_utc();
            let from = to - self.settings.lookback;
            if let Err(e) = self.run(from, to, &cancel).await {
                tracing::error!(error = %e, "reconciliation run failed");
            }
        }
        tracing::info!("reconciliation stopped");
    }
}

fn anomaly(
    kind: AnomalyKind,
    entries: &[&LedgerEntry],
    window_start: OffsetDateTime,
    window_end: OffsetDateTime,
    detail: String,
) -> Anomaly {
    let entry_ids: Vec<String> = entries.iter().map(|e| e.entry_id.clone()).collect();
    let first = entries.first();
    Anomaly {
        anomaly_id: ids::anomaly_id(kind, &entry_ids),
        kind,
        device_id: first.map(|e| e.device_id.clone()).unwrap_or_default(),
        switch_id: first.map(|e| e.switch_id.clone()).unwrap_or_default(),
        entry_ids,
        window_start,
        window_end,
        detail,
        correction_entry_id: None,
        detected_at: OffsetDateTime::now_utc(),
    }
}

/// Zero-energy, zero-cost replacement for a rolled-back meter interval.
fn reset_correction(entry: &LedgerEntry) -> LedgerEntry {
    LedgerEntry {
        entry_id: ids::entry_id(&entry.start_event_id, EntryKind::ResetMarker, Some(&entry.entry_id)),
        device_id: entry.device_id.clone(),
        switch_id: entry.switch_id.clone(),
        start_event_id: entry.start_event_id.clone(),
        end_event_id: entry.end_event_id.clone(),
        start_ts: entry.start_ts,
        end_ts: entry.end_ts,
        duration_seconds: entry.duration_seconds,
        delta_energy_wh: 0.0,
        power_w: entry.power_w,
        cost_version_id: None,
        cost_per_kwh: 0.0,
        cost_amount: 0.0,
        confidence: Confidence::Medium,
        calculation_method: CalculationMethod::CumulativeMeter,
        kind: EntryKind::ResetMarker,
        supersedes: Some(entry.entry_id.clone()),
        created_at: OffsetDateTime::now_utc(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Bucket;
    use ledger_client::{
        domain::{NewTelemetryEvent, Payload, SwitchScope},
        AggregateStore, MemoryStore,
    };
    use std::collections::BTreeSet as Set;
    use time::macros::{date, datetime, offset};

    fn job(store: Arc<MemoryStore>) -> ReconciliationJob {
        let aggregator = Arc::new(Aggregator::new(
            store.clone(),
            store.clone(),
            offset!(+05:30),
            0,
            Duration::from_millis(1),
        ));
        ReconciliationJob::new(
            store.clone(),
            store.clone(),
            store,
            aggregator,
            ReconcileSettings {
                gap_threshold: Duration::from_secs(6 * 3600),
                lookback: Duration::from_secs(7 * 86_400),
            },
        )
    }

    async fn put(store: &MemoryStore, id: &str, ts: OffsetDateTime, payload: Payload) {
        store
            .insert_event(NewTelemetryEvent {
                event_id: id.to_string(),
                device_id: "esp-1".to_string(),
                switch_id: Some("1".to_string()),
                timestamp: ts,
                received_at: ts,
                payload,
                quality_flags: Set::new(),
            })
            .await
            .unwrap();
    }

    fn entry(id: &str, start: OffsetDateTime, end: OffsetDateTime, wh: f64) -> LedgerEntry {
        LedgerEntry {
            entry_id: id.to_string(),
            device_id: "esp-1".to_string(),
            switch_id: "1".to_string(),
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
            calculation_method: CalculationMethod::CumulativeMeter,
            kind: EntryKind::Consumption,
            supersedes: None,
            created_at: end,
        }
    }

    fn window() -> (OffsetDateTime, OffsetDateTime) {
        (datetime!(2024-03-01 00:00 UTC), datetime!(2024-03-02 00:00 UTC))
    }

    #[tokio::test]
    async fn rollback_is_corrected_and_buckets_recomputed() {
        let store = Arc::new(MemoryStore::new());
        let (start, end) = (datetime!(2024-03-01 05:00 UTC), datetime!(2024-03-01 06:00 UTC));
        put(&store, "neg-start", start, Payload::SwitchOn { meter_wh: Some(500.0) }).await;
        put(&store, "neg-end", end, Payload::SwitchOff { meter_wh: Some(460.0) }).await;
        store.insert_entry(entry("neg", start, end, -40.0)).await.unwrap();

        let job = job(store.clone());
        let (from, to) = window();
        let report = job.run(from, to, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.fixes_applied, 1);
        assert_eq!(report.queued_for_review, 0);
        assert!(report.anomalies[0].is_fixed());
        assert!(report.buckets_recomputed > 0);

        let day = store
            .aggregates("esp-1", &SwitchScope::All, ledger_client::domain::Granularity::Daily, "2024-03-01", "2024-03-01")
            .await
            .unwrap();
        assert_eq!(day[0].total_energy_wh, 0.0);
        assert_eq!(day[0].entry_count, 0);

        // Second run finds nothing left to fix.
        let again = job.run(from, to, &CancellationToken::new()).await.unwrap();
        assert_eq!(again.fixes_applied, 0);
        assert!(again.anomalies.is_empty());
        assert_eq!(Bucket::day(date!(2024-03-01)).label(), day[0].bucket);
    }

    #[tokio::test]
    async fn unexplained_negative_goes_to_review_once() {
        let store = Arc::new(MemoryStore::new());
        let mut e = entry("neg", datetime!(2024-03-01 05:00 UTC), datetime!(2024-03-01 06:00 UTC), -5.0);
        e.calculation_method = CalculationMethod::PowerIntegration;
        store.insert_entry(e).await.unwrap();

        let job = job(store.clone());
        let (from, to) = window();
        let first = job.run(from, to, &CancellationToken::new()).await.unwrap();
        let second = job.run(from, to, &CancellationToken::new()).await.unwrap();

        assert_eq!(first.queued_for_review, 1);
        assert_eq!(second.queued_for_review, 0);
        assert_eq!(second.anomalies.len(), 1);
        assert_eq!(store.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overlaps_and_silent_gaps_are_reported() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_entry(entry("a", datetime!(2024-03-01 01:00 UTC), datetime!(2024-03-01 02:00 UTC), 5.0))
            .await
            .unwrap();
        store
            .insert_entry(entry("b", datetime!(2024-03-01 01:30 UTC), datetime!(2024-03-01 03:00 UTC), 5.0))
            .await
            .unwrap();
        store
            .insert_entry(entry("c", datetime!(2024-03-01 12:00 UTC), datetime!(2024-03-01 13:00 UTC), 5.0))
            .await
            .unwrap();

        let job = job(store.clone());
        let (from, to) = window();
        let report = job.run(from, to, &CancellationToken::new()).await.unwrap();
        let kinds: Vec<AnomalyKind> = report.anomalies.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AnomalyKind::OverlappingEntries, AnomalyKind::UnexplainedGap]);

        // A heartbeat in the gap explains it.
        put(&store, "hb", datetime!(2024-03-01 08:00 UTC), Payload::Heartbeat).await;
        let report = job.run(from, to, &CancellationToken::new()).await.unwrap();
        let kinds: Vec<AnomalyKind> = report.anomalies.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AnomalyKind::OverlappingEntries]);
    }

    #[tokio::test]
    async fn cancelled_run_stops_early() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_entry(entry("a", datetime!(2024-03-01 01:00 UTC), datetime!(2024-03-01 02:00 UTC), 5.0))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (from, to) = window();
        let report = job(store).run(from, to, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.streams_scanned, 0);
    }
}
