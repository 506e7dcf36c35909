//! Admin and read routes: offline signals, cost versions, aggregates and the
//! review queue.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use ledger_client::{
    domain::{
        Anomaly, BucketTotal, CostVersion, Granularity, LedgerEntry, NewCostVersion, SwitchScope,
    },
    CostStore, ReviewQueue,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{macros::format_description, Date, OffsetDateTime};

use crate::{
    aggregate::DirtyBuckets,
    error::{Result, ServiceError},
    ledger::LedgerGenerator,
    query::{AggregateQuery, AggregateReader, QueryTarget},
};

#[derive(Clone)]
pub struct ApiState {
    pub generator: Arc<LedgerGenerator>,
    pub dirty: Arc<DirtyBuckets>,
    pub costs: Arc<dyn CostStore>,
    pub review: Arc<dyn ReviewQueue>,
    pub reader: Arc<AggregateReader>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/devices/offline", post(device_offline))
        .route("/cost-versions", get(list_cost_versions).post(create_cost_version))
        .route("/aggregates", get(aggregates))
        .route("/reconciliation/review", get(review_queue))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "dirty_buckets": state.dirty.len(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct OfflineSignal {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub offline_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct OfflineResponse {
    pub closed: Vec<LedgerEntry>,
}

/// POST /devices/offline
async fn device_offline(
    State(state): State<ApiState>,
    Json(signal): Json<OfflineSignal>,
) -> Result<Json<OfflineResponse>> {
    let device_id = signal.device_id.trim();
    if device_id.is_empty() {
        return Err(ServiceError::InvalidInput("device_id must not be empty".to_string()));
    }

    let closed = state.generator.device_offline(device_id, signal.offline_at).await?;
    state.dirty.mark_entries(&closed);
    tracing::info!(
        device_id = %device_id,
        offline_at = %signal.offline_at,
        entries = closed.len(),
        "device offline signal applied"
    );
    Ok(Json(OfflineResponse { closed }))
}

/// POST /cost-versions
async fn create_cost_version(
    State(state): State<ApiState>,
    Json(version): Json<NewCostVersion>,
) -> Result<(StatusCode, Json<CostVersion>)> {
    if !version.cost_per_kwh.is_finite() || version.cost_per_kwh < 0.0 {
        return Err(ServiceError::InvalidInput(
            "cost_per_kwh must be a non-negative number".to_string(),
        ));
    }

    let stored = state.costs.insert_cost_version(version).await?;
    tracing::info!(
        id = stored.id,
        scope = %stored.scope,
        cost_per_kwh = stored.cost_per_kwh,
        effective_from = %stored.effective_from,
        "cost version added"
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

/// GET /cost-versions
async fn list_cost_versions(State(state): State<ApiState>) -> Result<Json<Vec<CostVersion>>> {
    Ok(Json(state.costs.cost_versions().await?))
}

#[derive(Debug, Deserialize)]
pub struct AggregateParams {
    pub device_id: Option<String>,
    pub classroom: Option<String>,
    pub switch_id: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default = "default_granularity")]
    pub granularity: String,
}

fn default_granularity() -> String {
    Granularity::Daily.as_str().to_string()
}

fn parse_date(field: &str, value: &str) -> Result<Date> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|e| ServiceError::InvalidInput(format!("{field}: expected YYYY-MM-DD ({e})")))
}

impl AggregateParams {
    fn into_query(self) -> Result<AggregateQuery> {
        let target = match (self.device_id, self.classroom) {
            (Some(device_id), None) => QueryTarget::Device {
                device_id,
                scope: self.switch_id.map_or(SwitchScope::All, SwitchScope::Switch),
            },
            (None, Some(room)) if self.switch_id.is_none() => QueryTarget::Classroom(room),
            (None, Some(_)) => {
                return Err(ServiceError::InvalidInput(
                    "switch_id cannot be combined with classroom".to_string(),
                ))
            }
            _ => {
                return Err(ServiceError::InvalidInput(
                    "exactly one of device_id or classroom is required".to_string(),
                ))
            }
        };

        Ok(AggregateQuery {
            target,
            from: parse_date("from", &self.from)?,
            to: parse_date("to", &self.to)?,
            granularity: self
                .granularity
                .parse::<Granularity>()
                .map_err(ServiceError::InvalidInput)?,
        })
    }
}

/// GET /aggregates
async fn aggregates(
    State(state): State<ApiState>,
    Query(params): Query<AggregateParams>,
) -> Result<Json<Vec<BucketTotal>>> {
    let query = params.into_query()?;
    Ok(Json(state.reader.query(&query).await?))
}

/// GET /reconciliation/review
async fn review_queue(State(state): State<ApiState>) -> Result<Json<Vec<Anomaly>>> {
    Ok(Json(state.review.pending().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::StaticCatalog,
        config::AppConfig,
        cost::CostResolver,
        ledger::GeneratorSettings,
    };
    use axum::{body::Body, http::Request};
    use ledger_client::{
        domain::{Aggregate, CostScope, NewTelemetryEvent, Payload},
        AggregateStore, MemoryStore, TelemetryStore,
    };
    use std::collections::BTreeSet;
    use time::macros::{datetime, offset};
    use tower::ServiceExt;

    fn app(store: Arc<MemoryStore>) -> (Router, Arc<DirtyBuckets>) {
        let cfg = AppConfig::from_toml_str(
            r#"
            [[devices]]
            device_id = "esp-1"
            classroom = "room-101"
            [[devices.switches]]
            switch_id = "1"
            power_w = 60.0
            "#,
        )
        .unwrap();
        let catalog = Arc::new(StaticCatalog::from_config(&cfg.devices));
        let generator = Arc::new(LedgerGenerator::new(
            store.clone(),
            store.clone(),
            CostResolver::new(store.clone()),
            catalog.clone(),
            GeneratorSettings {
                default_cost_per_kwh: 7.5,
                workers: 1,
                offline_timeout: None,
            },
        ));
        let dirty = Arc::new(DirtyBuckets::new(offset!(+05:30)));
        let state = ApiState {
            generator,
            dirty: dirty.clone(),
            costs: store.clone(),
            review: store.clone(),
            reader: Arc::new(AggregateReader::new(store, catalog)),
        };
        (router(state), dirty)
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn cost_versions_are_validated_and_listed() {
        let store = Arc::new(MemoryStore::new());
        let (app, _) = app(store);

        let (status, body) = send(
            app.clone(),
            post(
                "/cost-versions",
                json!({"cost_per_kwh": 8.0, "effective_from": "2024-03-01T00:00:00Z", "scope": "classroom:room-101"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["scope"], "classroom:room-101");

        let (status, _) = send(
            app.clone(),
            post(
                "/cost-versions",
                json!({"cost_per_kwh": -1.0, "effective_from": "2024-03-01T00:00:00Z", "scope": "global"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(app, get("/cost-versions")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn offline_signal_closes_open_interval() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_event(NewTelemetryEvent {
                event_id: "on".to_string(),
                device_id: "esp-1".to_string(),
                switch_id: Some("1".to_string()),
                timestamp: datetime!(2024-03-01 10:00 UTC),
                received_at: datetime!(2024-03-01 10:00 UTC),
                payload: Payload::SwitchOn { meter_wh: None },
                quality_flags: BTreeSet::new(),
            })
            .await
            .unwrap();
        store
            .insert_cost_version(NewCostVersion {
                cost_per_kwh: 7.5,
                effective_from: datetime!(2024-01-01 00:00 UTC),
                scope: CostScope::Global,
                notes: None,
            })
            .await
            .unwrap();
        let (app, dirty) = app(store);

        let (status, body) = send(
            app,
            post(
                "/devices/offline",
                json!({"device_id": "esp-1", "offline_at": "2024-03-01T10:30:00Z"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let closed = body["closed"].as_array().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0]["confidence"], "medium");
        assert_eq!(closed[0]["delta_energy_wh"], 30.0);
        assert_eq!(closed[0]["end_event_id"], Value::Null);
        assert!(!dirty.is_empty());
    }

    #[tokio::test]
    async fn aggregate_queries_need_one_target() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_aggregate(&Aggregate {
                device_id: "esp-1".to_string(),
                switch_scope: SwitchScope::All,
                granularity: Granularity::Daily,
                bucket: "2024-03-01".to_string(),
                bucket_start: datetime!(2024-02-29 18:30 UTC),
                bucket_end: datetime!(2024-03-01 18:30 UTC),
                total_energy_wh: 30.0,
                total_cost: 0.225,
                on_time_seconds: 1800.0,
                entry_count: 1,
                quality_score: 1.0,
            })
            .await
            .unwrap();
        let (app, _) = app(store);

        let (status, body) = send(
            app.clone(),
            get("/aggregates?classroom=room-101&from=2024-03-01&to=2024-03-31"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["bucket"], "2024-03-01");
        assert_eq!(body[0]["total_cost"], 0.225);

        let (status, _) = send(app.clone(), get("/aggregates?from=2024-03-01&to=2024-03-31")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            app.clone(),
            get("/aggregates?device_id=esp-1&from=2024-03-01&to=2024-03-31&granularity=hourly"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(app, get("/reconciliation/review")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }
}
