//! Read-side SQL for the aggregate API.

use sqlx::PgPool;

use crate::{
    domain::{BucketTotal, Granularity, SwitchScope},
    store::StoreError,
};

#[derive(Debug, Clone, sqlx::FromRow)]
struct BucketTotalRow {
    bucket: String,
    total_energy_wh: f64,
    total_cost: f64,
    on_time_seconds: f64,
    entry_count: i64,
    weighted_quality: f64,
    devices: i64,
}

impl From<BucketTotalRow> for BucketTotal {
    fn from(row: BucketTotalRow) -> Self {
        let quality_score = if row.entry_count > 0 {
            row.weighted_quality / row.entry_count as f64
        } else {
            1.0
        };
        BucketTotal {
            bucket: row.bucket,
            total_energy_wh: row.total_energy_wh,
            total_cost: row.total_cost,
            on_time_seconds: row.on_time_seconds,
            entry_count: row.entry_count,
            quality_score,
            devices: row.devices,
        }
    }
}

/// Sums the whole-device rows of `device_ids` per bucket.
pub async fn rollup(
    pool: &PgPool,
    device_ids: &[String],
    granularity: Granularity,
    from_bucket: &str,
    to_bucket: &str,
) -> Result<Vec<BucketTotal>, StoreError> {
    let rows = sqlx::query_as::<_, BucketTotalRow>(
        r#"
        SELECT
            bucket,
            SUM(total_energy_wh)                  AS total_energy_wh,
            SUM(total_cost)                       AS total_cost,
            SUM(on_time_seconds)                  AS on_time_seconds,
            SUM(entry_count)::BIGINT              AS entry_count,
            SUM(quality_score * entry_count)      AS weighted_quality,
            COUNT(*)                              AS devices
        FROM energy_aggregates
        WHERE device_id = ANY($1)
          AND switch_scope = $2
          AND granularity = $3
          AND bucket >= $4
          AND bucket <= $5
        GROUP BY bucket
        ORDER BY bucket
        "#,
    )
    .bind(device_ids)
    .bind(SwitchScope::All.to_string())
    .bind(granularity.as_str())
    .bind(from_bucket)
    .bind(to_bucket)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(BucketTotal::from).collect())
}
