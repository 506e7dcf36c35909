use sqlx::{postgres::PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use super::{
    aggregate_queries,
    rows::{AggregateRow, AnomalyRow, CostVersionRow, EntryRow, EventRow},
};
use crate::{
    domain::{
        Aggregate, Anomaly, BucketTotal, CostVersion, EntryKind, EventKind, EventPosition,
        Granularity, LedgerEntry, NewCostVersion, NewTelemetryEvent, SwitchKey, SwitchScope, TelemetryEvent,
    },
    store::{
        AggregateStore, CostStore, InsertOutcome, LedgerStore, ReviewQueue, StoreError,
        TelemetryStore,
    },
};

const EVENT_COLUMNS: &str =
    "seq, event_id, device_id, switch_id, ts, received_at, event_kind, payload, quality_flags, processed";

const ENTRY_COLUMNS: &str = "entry_id, device_id, switch_id, start_event_id, end_event_id, start_ts, end_ts, \
     duration_seconds, delta_energy_wh, power_w, cost_version_id, cost_per_kwh, cost_amount, \
     confidence, calculation_method, kind, supersedes, created_at";

/// Postgres-backed implementation of every store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies `sql/schema/01_energy_ledger.sql`. Every statement is
    /// `IF NOT EXISTS`, so this is safe on every start.
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(include_str!("../../sql/schema/01_energy_ledger.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn events_from_rows(rows: Vec<EventRow>) -> Result<Vec<TelemetryEvent>, StoreError> {
    rows.into_iter().map(TelemetryEvent::try_from).collect()
}

fn entries_from_rows(rows: Vec<EntryRow>) -> Result<Vec<LedgerEntry>, StoreError> {
    rows.into_iter().map(LedgerEntry::try_from).collect()
}

fn keys_from_rows(rows: Vec<(String, Option<String>)>) -> Vec<SwitchKey> {
    rows.into_iter()
        .map(|(device_id, switch_id)| SwitchKey::new(device_id, switch_id))
        .collect()
}

#[async_trait::async_trait]
impl TelemetryStore for PgStore {
    async fn insert_event(&self, event: NewTelemetryEvent) -> Result<InsertOutcome, StoreError> {
        let payload = serde_json::to_value(&event.payload)?;
        let flags: Vec<String> = event
            .quality_flags
            .iter()
            .map(|f| f.as_str().to_string())
            .collect();

        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            INSERT INTO telemetry_events
                (event_id, device_id, switch_id, ts, received_at, event_kind, payload, quality_flags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(&event.event_id)
        .bind(&event.device_id)
        .bind(&event.switch_id)
        .bind(event.timestamp)
        .bind(event.received_at)
        .bind(event.payload.kind().as_str())
        .bind(payload)
        .bind(flags)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(InsertOutcome::Inserted(row.try_into()?)),
            None => Ok(InsertOutcome::Duplicate),
        }
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<TelemetryEvent>, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM telemetry_events WHERE event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TelemetryEvent::try_from).transpose()
    }

    async fn latest_event(&self, key: &SwitchKey) -> Result<Option<TelemetryEvent>, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM telemetry_events
            WHERE device_id = $1 AND switch_id IS NOT DISTINCT FROM $2
            ORDER BY ts DESC, seq DESC
            LIMIT 1
            "#
        ))
        .bind(&key.device_id)
        .bind(&key.switch_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TelemetryEvent::try_from).transpose()
    }

    async fn latest_device_event(
        &self,
        device_id: &str,
        kind: Option<EventKind>,
    ) -> Result<Option<TelemetryEvent>, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM telemetry_events
            WHERE device_id = $1 AND ($2::TEXT IS NULL OR event_kind = $2)
            ORDER BY ts DESC, seq DESC
            LIMIT 1
            "#
        ))
        .bind(device_id)
        .bind(kind.map(|k| k.as_str()))
        .fetch_optional(&self.pool)
        .await?;
        row.map(TelemetryEvent::try_from).transpose()
    }

    async fn unprocessed_keys(&self) -> Result<Vec<SwitchKey>, StoreError> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT DISTINCT device_id, switch_id
            FROM telemetry_events
            WHERE NOT processed
            ORDER BY device_id, switch_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(keys_from_rows(rows))
    }

    async fn unprocessed_events(&self, key: &SwitchKey) -> Result<Vec<TelemetryEvent>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM telemetry_events
            WHERE device_id = $1 AND switch_id IS NOT DISTINCT FROM $2 AND NOT processed
            ORDER BY ts, seq
            "#
        ))
        .bind(&key.device_id)
        .bind(&key.switch_id)
        .fetch_all(&self.pool)
        .await?;
        events_from_rows(rows)
    }

    async fn events_after(
        &self,
        key: &SwitchKey,
        after: Option<EventPosition>,
    ) -> Result<Vec<TelemetryEvent>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {EVENT_COLUMNS} FROM telemetry_events WHERE device_id = "
        ));
        builder.push_bind(&key.device_id);
        builder.push(" AND switch_id IS NOT DISTINCT FROM ");
        builder.push_bind(&key.switch_id);
        if let Some(pos) = after {
            builder.push(" AND (ts, seq) > (");
            builder.push_bind(pos.timestamp);
            builder.push(", ");
            builder.push_bind(pos.seq);
            builder.push(")");
        }
        builder.push(" ORDER BY ts, seq");

        let rows = builder
            .build_query_as::<EventRow>()
            .fetch_all(&self.pool)
            .await?;
        events_from_rows(rows)
    }

    async fn device_events_between(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<TelemetryEvent>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM telemetry_events
            WHERE device_id = $1 AND ts >= $2 AND ts <= $3
            ORDER BY ts, seq
            "#
        ))
        .bind(device_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        events_from_rows(rows)
    }

    async fn mark_processed(&self, event_ids: &[String]) -> Result<(), StoreError> {
        if event_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE telemetry_events SET processed = TRUE WHERE event_id = ANY($1)")
            .bind(event_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn switch_keys(&self, device_id: Option<&str>) -> Result<Vec<SwitchKey>, StoreError> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT DISTINCT device_id, switch_id
            FROM telemetry_events
            WHERE switch_id IS NOT NULL AND ($1::TEXT IS NULL OR device_id = $1)
            ORDER BY device_id, switch_id
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys_from_rows(rows))
    }
}

#[async_trait::async_trait]
impl LedgerStore for PgStore {
    async fn insert_entry(&self, entry: LedgerEntry) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO ledger_entries ({ENTRY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT DO NOTHING
            "#
        ))
        .bind(&entry.entry_id)
        .bind(&entry.device_id)
        .bind(&entry.switch_id)
        .bind(&entry.start_event_id)
        .bind(&entry.end_event_id)
        .bind(entry.start_ts)
        .bind(entry.end_ts)
        .bind(entry.duration_seconds)
        .bind(entry.delta_energy_wh)
        .bind(entry.power_w)
        .bind(entry.cost_version_id)
        .bind(entry.cost_per_kwh)
        .bind(entry.cost_amount)
        .bind(entry.confidence.as_str())
        .bind(entry.calculation_method.as_str())
        .bind(entry.kind.as_str())
        .bind(&entry.supersedes)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn entry_for_start(
        &self,
        start_event_id: &str,
        kind: EntryKind,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM ledger_entries
            WHERE start_event_id = $1 AND kind = $2 AND supersedes IS NULL
            "#
        ))
        .bind(start_event_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    async fn latest_entry(&self, key: &SwitchKey) -> Result<Option<LedgerEntry>, StoreError> {
        let Some(switch_id) = key.switch_id.as_deref() else {
            return Ok(None);
        };
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM ledger_entries
            WHERE device_id = $1 AND switch_id = $2 AND supersedes IS NULL
            ORDER BY end_ts DESC, start_ts DESC
            LIMIT 1
            "#
        ))
        .bind(&key.device_id)
        .bind(switch_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    async fn entries_overlapping(
        &self,
        device_id: &str,
        switch_id: Option<&str>,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM ledger_entries
            WHERE device_id = $1
              AND ($2::TEXT IS NULL OR switch_id = $2)
              AND start_ts < $4
              AND end_ts   > $3
            ORDER BY start_ts, entry_id
            "#
        ))
        .bind(device_id)
        .bind(switch_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        entries_from_rows(rows)
    }

    async fn ledger_keys(&self) -> Result<Vec<SwitchKey>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT device_id, switch_id FROM ledger_entries ORDER BY device_id, switch_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(device_id, switch_id)| SwitchKey::switch(device_id, switch_id))
            .collect())
    }
}

#[async_trait::async_trait]
impl CostStore for PgStore {
    async fn insert_cost_version(&self, version: NewCostVersion) -> Result<CostVersion, StoreError> {
        let row = sqlx::query_as::<_, CostVersionRow>(
            r#"
            INSERT INTO cost_versions (cost_per_kwh, effective_from, scope, notes)
            VALUES ($1, $2, $3, $4)
            RETURNING id, cost_per_kwh, effective_from, scope, notes, created_at
            "#,
        )
        .bind(version.cost_per_kwh)
        .bind(version.effective_from)
        .bind(version.scope.to_string())
        .bind(&version.notes)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn cost_versions(&self) -> Result<Vec<CostVersion>, StoreError> {
        let rows = sqlx::query_as::<_, CostVersionRow>(
            r#"
            SELECT id, cost_per_kwh, effective_from, scope, notes, created_at
            FROM cost_versions
            ORDER BY effective_from, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CostVersion::try_from).collect()
    }
}

#[async_trait::async_trait]
impl AggregateStore for PgStore {
    async fn upsert_aggregate(&self, aggregate: &Aggregate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO energy_aggregates (
                device_id, switch_scope, granularity, bucket, bucket_start, bucket_end,
                total_energy_wh, total_cost, on_time_seconds, entry_count, quality_score
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (device_id, switch_scope, granularity, bucket) DO UPDATE SET
                bucket_start    = EXCLUDED.bucket_start,
                bucket_end      = EXCLUDED.bucket_end,
                total_energy_wh = EXCLUDED.total_energy_wh,
                total_cost      = EXCLUDED.total_cost,
                on_time_seconds = EXCLUDED.on_time_seconds,
                entry_count     = EXCLUDED.entry_count,
                quality_score   = EXCLUDED.quality_score
            "#,
        )
        .bind(&aggregate.device_id)
        .bind(aggregate.switch_scope.to_string())
        .bind(aggregate.granularity.as_str())
        .bind(&aggregate.bucket)
        .bind(aggregate.bucket_start)
        .bind(aggregate.bucket_end)
        .bind(aggregate.total_energy_wh)
        .bind(aggregate.total_cost)
        .bind(aggregate.on_time_seconds)
        .bind(aggregate.entry_count)
        .bind(aggregate.quality_score)
        .execute(&self.pool)
        .await?;
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
        let rows = sqlx::query_as::<_, AggregateRow>(
            r#"
            SELECT
                device_id, switch_scope, granularity, bucket, bucket_start, bucket_end,
                total_energy_wh, total_cost, on_time_seconds, entry_count, quality_score
            FROM energy_aggregates
            WHERE device_id = $1
              AND switch_scope = $2
              AND granularity = $3
              AND bucket >= $4
              AND bucket <= $5
            ORDER BY bucket
            "#,
        )
        .bind(device_id)
        .bind(scope.to_string())
        .bind(granularity.as_str())
        .bind(from_bucket)
        .bind(to_bucket)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Aggregate::try_from).collect()
    }

    async fn rollup(
        &self,
        device_ids: &[String],
        granularity: Granularity,
        from_bucket: &str,
        to_bucket: &str,
    ) -> Result<Vec<BucketTotal>, StoreError> {
        aggregate_queries::rollup(&self.pool, device_ids, granularity, from_bucket, to_bucket).await
    }
}

#[async_trait::async_trait]
impl ReviewQueue for PgStore {
    async fn enqueue(&self, anomaly: Anomaly) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO review_queue (
                anomaly_id, kind, device_id, switch_id, entry_ids,
                window_start, window_end, detail, correction_entry_id, detected_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (anomaly_id) DO NOTHING
            "#,
        )
        .bind(&anomaly.anomaly_id)
        .bind(anomaly.kind.as_str())
        .bind(&anomaly.device_id)
        .bind(&anomaly.switch_id)
        .bind(&anomaly.entry_ids)
        .bind(anomaly.window_start)
        .bind(anomaly.window_end)
        .bind(&anomaly.detail)
        .bind(&anomaly.correction_entry_id)
        .bind(anomaly.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn pending(&self) -> Result<Vec<Anomaly>, StoreError> {
        let rows = sqlx::query_as::<_, AnomalyRow>(
            r#"
            SELECT
                anomaly_id, kind, device_id, switch_id, entry_ids,
                window_start, window_end, detail, correction_entry_id, detected_at
            FROM review_queue
            ORDER BY detected_at, anomaly_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Anomaly::try_from).collect()
    }
}
