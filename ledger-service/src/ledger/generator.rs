use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{stream, StreamExt};
use ledger_client::{
    domain::{Confidence, EntryKind, EventKind, EventPosition, LedgerEntry, SwitchKey, TelemetryEvent},
    LedgerStore, StoreError, TelemetryStore,
};
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::state::{ClosedInterval, SwitchState};
use crate::{
    aggregate::DirtyBuckets,
    catalog::{DeviceCatalog, SwitchProfile},
    cost::{CostError, CostResolver},
    ids,
    locks::KeyedLocks,
};

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    /// Rate used when no cost version is in effect.
    pub default_cost_per_kwh: f64,
    pub workers: usize,
    /// Heartbeating devices silent for longer than this are treated as offline.
    pub offline_timeout: Option<Duration>,
}

/// What one pass produced.
#[derive(Debug, Default)]
pub struct PassReport {
    pub processed_events: usize,
    pub late_events: usize,
    pub entries: Vec<LedgerEntry>,
}

impl PassReport {
    fn merge(&mut self, other: PassReport) {
        self.processed_events += other.processed_events;
        self.late_events += other.late_events;
        self.entries.extend(other.entries);
    }
}

#[derive(Debug, Clone)]
struct Cursor {
    state: SwitchState,
    /// Position of the last event folded into `state`.
    position: Option<EventPosition>,
}

impl Cursor {
    fn is_before_all(&self, events: &[TelemetryEvent]) -> bool {
        match self.position {
            Some(p) => events.iter().all(|e| e.position() > p),
            None => true,
        }
    }
}

struct AppliedRate {
    cost_version_id: Option<i64>,
    cost_per_kwh: f64,
    fallback: bool,
}

/// Turns each switch's telemetry into ledger entries.
///
/// The ledger is the durable record of progress: after a restart, the state
/// of a switch is rebuilt from its latest entry and the events after it.
/// Appends are idempotent, so replaying events that were already applied
/// cannot produce a second entry.
pub struct LedgerGenerator {
    telemetry: Arc<dyn TelemetryStore>,
    ledger: Arc<dyn LedgerStore>,
    costs: CostResolver,
    catalog: Arc<dyn DeviceCatalog>,
    settings: GeneratorSettings,
    locks: KeyedLocks<SwitchKey>,
    cursors: std::sync::Mutex<HashMap<SwitchKey, Cursor>>,
}

impl LedgerGenerator {
    pub fn new(
        telemetry: Arc<dyn TelemetryStore>,
        ledger: Arc<dyn LedgerStore>,
        costs: CostResolver,
        catalog: Arc<dyn DeviceCatalog>,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            telemetry,
            ledger,
            costs,
            catalog,
            settings,
            locks: KeyedLocks::new(),
            cursors: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &SwitchKey) -> Option<Cursor> {
        let cursors = self.cursors.lock().unwrap_or_else(|p| p.into_inner());
        cursors.get(key).cloned()
    }

    fn remember(&self, key: &SwitchKey, cursor: Cursor) {
        let mut cursors = self.cursors.lock().unwrap_or_else(|p| p.into_inner());
        cursors.insert(key.clone(), cursor);
    }

    fn profile(&self, key: &SwitchKey) -> Option<SwitchProfile> {
        key.switch_id
            .as_deref()
            .map(|s| self.catalog.switch_profile(&key.device_id, s))
    }

    /// Processes every stream with pending events.
    pub async fn run_pass(&self) -> Result<PassReport, StoreError> {
        let keys = self.telemetry.unprocessed_keys().await?;
        let workers = self.settings.workers.max(1);

        let results: Vec<(SwitchKey, Result<PassReport, StoreError>)> = stream::iter(keys)
            .map(|key| async move {
                let r = self.process_key(&key).await;
                (key, r)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut report = PassReport::default();
        for (key, result) in results {
            match result {
                Ok(r) => report.merge(r),
                Err(e) => {
                    tracing::error!(stream = %key, error = %e, "ledger generation failed for stream");
                }
            }
        }
        Ok(report)
    }

    /// Folds the pending events of one stream into the ledger.
    pub async fn process_key(&self, key: &SwitchKey) -> Result<PassReport, StoreError> {
        let _guard = self.locks.lock(key).await;

        let pending = self.telemetry.unprocessed_events(key).await?;
        if pending.is_empty() {
            return Ok(PassReport::default());
        }
        let pending_ids: Vec<String> = pending.iter().map(|e| e.event_id.clone()).collect();
        let mut report = PassReport {
            processed_events: pending.len(),
            ..PassReport::default()
        };

        let Some(profile) = self.profile(key) else {
            // Device-level readings and heartbeats only serve liveness and
            // reconciliation.
            self.telemetry.mark_processed(&pending_ids).await?;
            return Ok(report);
        };

        let cursor = match self.cached(key) {
            Some(c) if c.is_before_all(&pending) => {
                let mut c = c;
                report.entries = self.replay(key, &profile, &mut c, &pending).await?;
                c
            }
            _ => {
                let (mut c, anchor) = self.anchor(key, &profile).await?;
                let events = self.telemetry.events_after(key, anchor).await?;
                report.entries = self.replay(key, &profile, &mut c, &events).await?;

                if let Some(anchor) = anchor {
                    for late in pending.iter().filter(|e| e.position() <= anchor) {
                        report.late_events += 1;
                        metrics::counter!("ledger_late_events_total").increment(1);
                        tracing::warn!(
                            stream = %key,
                            event_id = %late.event_id,
                            timestamp = %late.timestamp,
                            "event arrived after its interval was closed; not applied"
                        );
                    }
                }
                c
            }
        };

        self.telemetry.mark_processed(&pending_ids).await?;
        self.remember(key, cursor);
        Ok(report)
    }

    /// State after the latest entry of the stream, and the position events
    /// must follow to be replayed on top of it.
    async fn anchor(
        &self,
        key: &SwitchKey,
        profile: &SwitchProfile,
    ) -> Result<(Cursor, Option<EventPosition>), StoreError> {
        let Some(entry) = self.ledger.latest_entry(key).await? else {
            return Ok((
                Cursor {
                    state: SwitchState::Idle,
                    position: None,
                },
                None,
            ));
        };

        let end_event = match &entry.end_event_id {
            Some(id) => self.telemetry.get_event(id).await?,
            None => None,
        };
        let position = match &end_event {
            Some(e) => e.position(),
            None => EventPosition::end_of(entry.end_ts),
        };
        let state = SwitchState::after_entry(&entry, end_event.as_ref(), profile);

        Ok((
            Cursor {
                state,
                position: Some(position),
            },
            Some(position),
        ))
    }

    async fn replay(
        &self,
        key: &SwitchKey,
        profile: &SwitchProfile,
        cursor: &mut Cursor,
        events: &[TelemetryEvent],
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut written = Vec::new();
        for event in events {
            for closed in cursor.state.apply(event, profile) {
                if let Some(entry) = self.record(key, closed).await? {
                    written.push(entry);
                }
            }
            cursor.position = Some(event.position());
        }
        Ok(written)
    }

    /// Cached cursor, or one rebuilt from the ledger and the stored events.
    async fn current_cursor(
        &self,
        key: &SwitchKey,
        profile: &SwitchProfile,
    ) -> Result<(Cursor, Vec<LedgerEntry>), StoreError> {
        if let Some(c) = self.cached(key) {
            return Ok((c, Vec::new()));
        }
        let (mut c, anchor) = self.anchor(key, profile).await?;
        let events = self.telemetry.events_after(key, anchor).await?;
        let written = self.replay(key, profile, &mut c, &events).await?;
        Ok((c, written))
    }

    async fn rate_for(&self, device_id: &str, at: OffsetDateTime) -> Result<AppliedRate, StoreError> {
        let scope = self.catalog.cost_scope(device_id);
        match self.costs.resolve(&scope, at).await {
            Ok(v) => Ok(AppliedRate {
                cost_version_id: Some(v.id),
                cost_per_kwh: v.cost_per_kwh,
                fallback: false,
            }),
            Err(CostError::NoCostVersion { scope, at }) => {
                tracing::warn!(
                    device_id,
                    %scope,
                    %at,
                    default_cost_per_kwh = self.settings.default_cost_per_kwh,
                    "no cost version in effect; using default rate"
                );
                Ok(AppliedRate {
                    cost_version_id: None,
                    cost_per_kwh: self.settings.default_cost_per_kwh,
                    fallback: true,
                })
            }
            Err(CostError::Store(e)) => Err(e),
        }
    }

    /// Prices a closed interval and appends it. Returns `None` when the
    /// entry already exists.
    async fn record(&self, key: &SwitchKey, closed: ClosedInterval) -> Result<Option<LedgerEntry>, StoreError> {
        let Some(switch_id) = key.switch_id.clone() else {
            return Ok(None);
        };
        if self
            .ledger
            .entry_for_start(&closed.start.event_id, closed.kind)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let (cost_version_id, cost_per_kwh, cost_amount, confidence) = match closed.kind {
            EntryKind::ResetMarker => (None, 0.0, 0.0, closed.confidence),
            EntryKind::Consumption => {
                let rate = self.rate_for(&key.device_id, closed.start.timestamp).await?;
                let confidence = if rate.fallback {
                    closed.confidence.min(Confidence::Low)
                } else {
                    closed.confidence
                };
                (
                    rate.cost_version_id,
                    rate.cost_per_kwh,
                    closed.delta_energy_wh / 1000.0 * rate.cost_per_kwh,
                    confidence,
                )
            }
        };

        let entry = LedgerEntry {
            entry_id: ids::entry_id(&closed.start.event_id, closed.kind, None),
            device_id: key.device_id.clone(),
            switch_id,
            start_event_id: closed.start.event_id.clone(),
            end_event_id: closed.end_event_id.clone(),
            start_ts: closed.start.timestamp,
            end_ts: closed.end_ts,
            duration_seconds: closed.duration_seconds(),
            delta_energy_wh: closed.delta_energy_wh,
            power_w: closed.power_w,
            cost_version_id,
            cost_per_kwh,
            cost_amount,
            confidence,
            calculation_method: closed.method,
            kind: closed.kind,
            supersedes: None,
            created_at: OffsetDateTime::now_utc(),
        };

        if !self.ledger.insert_entry(entry.clone()).await? {
            return Ok(None);
        }
        metrics::counter!("ledger_entries_emitted_total", "kind" => entry.kind.as_str()).increment(1);
        if entry.end_event_id.is_none() {
            metrics::counter!("ledger_forced_close_total").increment(1);
        }
        tracing::info!(
            stream = %key,
            entry_id = %entry.entry_id,
            kind = entry.kind.as_str(),
            start = %entry.start_ts,
            end = %entry.end_ts,
            energy_wh = entry.delta_energy_wh,
            cost = entry.cost_amount,
            confidence = entry.confidence.as_str(),
            "ledger entry appended"
        );
        Ok(Some(entry))
    }

    /// The device stopped reporting at `offline_at`. Pending events are
    /// applied first, then every interval still open is closed at
    /// `offline_at` with reduced confidence.
    pub async fn device_offline(
        &self,
        device_id: &str,
        offline_at: OffsetDateTime,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut written = Vec::new();
        for key in self.telemetry.switch_keys(Some(device_id)).await? {
            written.extend(self.process_key(&key).await?.entries);
            written.extend(self.close_stream(&key, offline_at).await?);
        }
        Ok(written)
    }

    async fn close_stream(&self, key: &SwitchKey, offline_at: OffsetDateTime) -> Result<Vec<LedgerEntry>, StoreError> {
        let Some(profile) = self.profile(key) else {
            return Ok(Vec::new());
        };
        let _guard = self.locks.lock(key).await;

        let (mut cursor, mut written) = self.current_cursor(key, &profile).await?;
        if let Some(closed) = cursor.state.force_close(offline_at) {
            tracing::info!(stream = %key, %offline_at, "closing open interval of offline device");
            if let Some(entry) = self.record(key, closed).await? {
                written.push(entry);
            }
            let closed_at = EventPosition::end_of(offline_at);
            cursor.position = Some(cursor.position.map_or(closed_at, |p| p.max(closed_at)));
        }
        self.remember(key, cursor);
        Ok(written)
    }

    /// Force-closes open streams of devices that stopped reporting. Liveness
    /// is the latest event of any stream of the device, and the watchdog only
    /// applies to devices that sent a heartbeat since the interval opened:
    /// a switch with no traffic between on and off is still on. The close
    /// time is the last device event plus the timeout.
    pub async fn sweep_stale(&self, now: OffsetDateTime) -> Result<Vec<LedgerEntry>, StoreError> {
        let Some(timeout) = self.settings.offline_timeout else {
            return Ok(Vec::new());
        };
        let mut written = Vec::new();
        for key in self.telemetry.switch_keys(None).await? {
            let Some(profile) = self.profile(&key) else {
                continue;
            };
            let opened_at = {
                let _guard = self.locks.lock(&key).await;
                let (cursor, replayed) = self.current_cursor(&key, &profile).await?;
                written.extend(replayed);
                let opened_at = cursor.state.open_interval().map(|open| open.start.timestamp);
                self.remember(&key, cursor);
                opened_at
            };
            let Some(opened_at) = opened_at else {
                continue;
            };

            let heartbeat = self
                .telemetry
                .latest_device_event(&key.device_id, Some(EventKind::Heartbeat))
                .await?;
            if !heartbeat.is_some_and(|h| h.timestamp >= opened_at) {
                continue;
            }
            let Some(last) = self.telemetry.latest_device_event(&key.device_id, None).await? else {
                continue;
            };
            let offline_at = last.timestamp + timeout;
            if offline_at < now {
                tracing::warn!(
                    stream = %key,
                    last_seen = %last.timestamp,
                    "device silent past the offline timeout"
                );
                written.extend(self.close_stream(&key, offline_at).await?);
            }
        }
        Ok(written)
    }

    /// Runs passes until cancelled, waking on new telemetry or every
    /// `poll_interval`.
    pub async fn run(
        self: Arc<Self>,
        poll_interval: Duration,
        wake: Arc<Notify>,
        dirty: Arc<DirtyBuckets>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = wake.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }

            match self.run_pass().await {
                Ok(report) => {
                    if report.processed_events > 0 {
                        tracing::debug!(
                            events = report.processed_events,
                            entries = report.entries.len(),
                            late = report.late_events,
                            "ledger pass finished"
                        );
                    }
                    dirty.mark_entries(&report.entries);
                }
                Err(e) => tracing::error!(error = %e, "ledger pass failed"),
            }

            match self.sweep_stale(OffsetDateTime::now_utc()).await {
                Ok(entries) => dirty.mark_entries(&entries),
                Err(e) => tracing::error!(error = %e, "offline sweep failed"),
            }
        }
        tracing::info!("ledger generator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::config::AppConfig;
    use ledger_client::{
        domain::{CostScope, NewCostVersion, NewTelemetryEvent, Payload},
        CostStore, MemoryStore,
    };
    use std::collections::BTreeSet;
    use time::macros::datetime;

    fn catalog() -> Arc<StaticCatalog> {
        let cfg = AppConfig::from_toml_str(
            r#"
            [[devices]]
            device_id = "esp-1"
            [[devices.switches]]
            switch_id = "1"
            power_w = 60.0
            "#,
        )
        .unwrap();
        Arc::new(StaticCatalog::from_config(&cfg.devices))
    }

    fn generator(store: Arc<MemoryStore>, offline_timeout: Option<Duration>) -> LedgerGenerator {
        LedgerGenerator::new(
            store.clone(),
            store.clone(),
            CostResolver::new(store),
            catalog(),
            GeneratorSettings {
                default_cost_per_kwh: 7.5,
                workers: 2,
                offline_timeout,
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
                quality_flags: BTreeSet::new(),
            })
            .await
            .unwrap();
    }

    async fn put_device_heartbeat(store: &MemoryStore, ts: OffsetDateTime) {
        store
            .insert_event(NewTelemetryEvent {
                event_id: format!("hb-{}", ts.unix_timestamp()),
                device_id: "esp-1".to_string(),
                switch_id: None,
                timestamp: ts,
                received_at: ts,
                payload: Payload::Heartbeat,
                quality_flags: BTreeSet::new(),
            })
            .await
            .unwrap();
    }

    async fn global_rate(store: &MemoryStore, rate: f64) {
        store
            .insert_cost_version(NewCostVersion {
                cost_per_kwh: rate,
                effective_from: datetime!(2024-01-01 00:00 UTC),
                scope: CostScope::Global,
                notes: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn prices_an_interval_with_the_effective_version() {
        let store = Arc::new(MemoryStore::new());
        global_rate(&store, 7.5).await;
        put(&store, "on", datetime!(2024-03-01 10:00 UTC), Payload::SwitchOn { meter_wh: None }).await;
        put(&store, "off", datetime!(2024-03-01 10:30 UTC), Payload::SwitchOff { meter_wh: None }).await;

        let report = generator(store.clone(), None).run_pass().await.unwrap();
        assert_eq!(report.processed_events, 2);
        assert_eq!(report.entries.len(), 1);
        let e = &report.entries[0];
        assert!((e.delta_energy_wh - 30.0).abs() < 1e-9);
        assert!((e.cost_amount - 0.225).abs() < 1e-9);
        assert_eq!(e.cost_version_id, Some(1));
        assert_eq!(e.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn missing_cost_version_uses_default_with_low_confidence() {
        let store = Arc::new(MemoryStore::new());
        put(&store, "on", datetime!(2024-03-01 10:00 UTC), Payload::SwitchOn { meter_wh: None }).await;
        put(&store, "off", datetime!(2024-03-01 11:00 UTC), Payload::SwitchOff { meter_wh: None }).await;

        let report = generator(store, None).run_pass().await.unwrap();
        let e = &report.entries[0];
        assert_eq!(e.cost_version_id, None);
        assert_eq!(e.cost_per_kwh, 7.5);
        assert_eq!(e.confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn restart_resumes_from_the_ledger() {
        let store = Arc::new(MemoryStore::new());
        global_rate(&store, 7.5).await;
        put(&store, "on", datetime!(2024-03-01 10:00 UTC), Payload::SwitchOn { meter_wh: None }).await;
        generator(store.clone(), None).run_pass().await.unwrap();

        // A fresh generator has no cached state for the open interval.
        put(&store, "off", datetime!(2024-03-01 10:30 UTC), Payload::SwitchOff { meter_wh: None }).await;
        let report = generator(store.clone(), None).run_pass().await.unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].start_event_id, "on");

        // Replaying everything again writes nothing new.
        let third = generator(store.clone(), None);
        let key = SwitchKey::switch("esp-1", "1");
        let (_, replayed) = third.current_cursor(&key, &SwitchProfile::default()).await.unwrap();
        assert!(replayed.is_empty());
    }

    #[tokio::test]
    async fn late_events_after_a_close_are_counted_not_applied() {
        let store = Arc::new(MemoryStore::new());
        global_rate(&store, 7.5).await;
        let gen = generator(store.clone(), None);
        put(&store, "on", datetime!(2024-03-01 10:00 UTC), Payload::SwitchOn { meter_wh: None }).await;
        put(&store, "off", datetime!(2024-03-01 10:30 UTC), Payload::SwitchOff { meter_wh: None }).await;
        gen.run_pass().await.unwrap();

        put(&store, "late-on", datetime!(2024-03-01 10:10 UTC), Payload::SwitchOn { meter_wh: None }).await;
        let report = gen.run_pass().await.unwrap();
        assert_eq!(report.late_events, 1);
        assert!(report.entries.is_empty());
        let key = SwitchKey::switch("esp-1", "1");
        assert!(store.unprocessed_events(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_closes_open_interval_once() {
        let store = Arc::new(MemoryStore::new());
        global_rate(&store, 7.5).await;
        let gen = generator(store.clone(), None);
        put(&store, "on", datetime!(2024-03-01 10:00 UTC), Payload::SwitchOn { meter_wh: None }).await;

        let closed = gen
            .device_offline("esp-1", datetime!(2024-03-01 10:20 UTC))
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].end_event_id, None);
        assert_eq!(closed[0].confidence, Confidence::Medium);
        assert!((closed[0].delta_energy_wh - 20.0).abs() < 1e-9);

        let again = gen
            .device_offline("esp-1", datetime!(2024-03-01 10:25 UTC))
            .await
            .unwrap();
        assert!(again.is_empty());

        // The off that eventually arrives for the same interval adds nothing.
        put(&store, "off", datetime!(2024-03-01 10:15 UTC), Payload::SwitchOff { meter_wh: None }).await;
        let report = gen.run_pass().await.unwrap();
        assert!(report.entries.is_empty());
    }

    #[tokio::test]
    async fn stale_streams_are_swept() {
        let store = Arc::new(MemoryStore::new());
        global_rate(&store, 7.5).await;
        let gen = generator(store.clone(), Some(Duration::from_secs(60)));
        put(&store, "on", datetime!(2024-03-01 10:00 UTC), Payload::SwitchOn { meter_wh: None }).await;
        put(&store, "hb", datetime!(2024-03-01 10:05 UTC), Payload::Heartbeat).await;
        gen.run_pass().await.unwrap();

        let not_yet = gen.sweep_stale(datetime!(2024-03-01 10:05:30 UTC)).await.unwrap();
        assert!(not_yet.is_empty());

        let swept = gen.sweep_stale(datetime!(2024-03-01 12:00 UTC)).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].end_ts, datetime!(2024-03-01 10:06 UTC));
    }

    #[tokio::test]
    async fn device_heartbeats_keep_an_interval_open() {
        let store = Arc::new(MemoryStore::new());
        global_rate(&store, 7.5).await;
        let gen = generator(store.clone(), Some(Duration::from_secs(60)));
        let on_at = datetime!(2024-03-01 10:00 UTC);
        put(&store, "on", on_at, Payload::SwitchOn { meter_wh: None }).await;
        for i in 1..=58 {
            put_device_heartbeat(&store, on_at + time::Duration::seconds(30 * i)).await;
        }
        gen.run_pass().await.unwrap();

        let swept = gen.sweep_stale(datetime!(2024-03-01 10:29:30 UTC)).await.unwrap();
        assert!(swept.is_empty());

        put(&store, "off", datetime!(2024-03-01 10:30 UTC), Payload::SwitchOff { meter_wh: None }).await;
        let report = gen.run_pass().await.unwrap();
        assert_eq!(report.entries.len(), 1);
        let e = &report.entries[0];
        assert!((e.delta_energy_wh - 30.0).abs() < 1e-9);
        assert!((e.cost_amount - 0.225).abs() < 1e-9);
        assert_eq!(e.confidence, Confidence::High);
        assert_eq!(e.end_event_id.as_deref(), Some("off"));
    }

    #[tokio::test]
    async fn silent_switch_without_heartbeats_is_not_swept() {
        let store = Arc::new(MemoryStore::new());
        global_rate(&store, 7.5).await;
        let gen = generator(store.clone(), Some(Duration::from_secs(60)));
        put(&store, "on", datetime!(2024-03-01 10:00 UTC), Payload::SwitchOn { meter_wh: None }).await;
        gen.run_pass().await.unwrap();

        let swept = gen.sweep_stale(datetime!(2024-03-01 10:15 UTC)).await.unwrap();
        assert!(swept.is_empty());

        put(&store, "off", datetime!(2024-03-01 10:30 UTC), Payload::SwitchOff { meter_wh: None }).await;
        let report = gen.run_pass().await.unwrap();
        assert_eq!(report.entries.len(), 1);
        assert!((report.entries[0].delta_energy_wh - 30.0).abs() < 1e-9);
        assert!((report.entries[0].cost_amount - 0.225).abs() < 1e-9);
    }

    #[tokio::test]
    async fn device_that_stops_heartbeating_is_closed_after_its_last_event() {
        let store = Arc::new(MemoryStore::new());
        global_rate(&store, 7.5).await;
        let gen = generator(store.clone(), Some(Duration::from_secs(60)));
        put(&store, "on", datetime!(2024-03-01 10:00 UTC), Payload::SwitchOn { meter_wh: None }).await;
        put_device_heartbeat(&store, datetime!(2024-03-01 10:05 UTC)).await;
        put_device_heartbeat(&store, datetime!(2024-03-01 10:10 UTC)).await;
        gen.run_pass().await.unwrap();

        let swept = gen.sweep_stale(datetime!(2024-03-01 10:20 UTC)).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].end_ts, datetime!(2024-03-01 10:11 UTC));
        assert_eq!(swept[0].confidence, Confidence::Medium);
        assert!((swept[0].delta_energy_wh - 11.0).abs() < 1e-9);
    }
}
