//! Wiring shared by the binaries: store selection and the long-running loops.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use ledger_client::{
    db::PgStore, AggregateStore, CostStore, LedgerStore, MemoryStore, ReviewQueue, StoreError,
    TelemetryStore,
};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{Aggregator, DirtyBuckets},
    api::ApiState,
    catalog::{DeviceCatalog, StaticCatalog},
    config::{AppConfig, StoreConfig, StoreKind},
    cost::CostResolver,
    ingest::{QualitySettings, TelemetryIngestor},
    ledger::{GeneratorSettings, LedgerGenerator},
    query::AggregateReader,
    reconcile::{ReconcileSettings, ReconciliationJob},
};

const SECS_PER_DAY: u64 = 86_400;

/// One handle per logical store. With a single backend every field points at
/// the same object.
#[derive(Clone)]
pub struct Stores {
    pub telemetry: Arc<dyn TelemetryStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub costs: Arc<dyn CostStore>,
    pub aggregates: Arc<dyn AggregateStore>,
    pub review: Arc<dyn ReviewQueue>,
}

impl Stores {
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: TelemetryStore + LedgerStore + CostStore + AggregateStore + ReviewQueue + 'static,
    {
        Self {
            telemetry: store.clone(),
            ledger: store.clone(),
            costs: store.clone(),
            aggregates: store.clone(),
            review: store,
        }
    }

    pub async fn open(cfg: &StoreConfig) -> anyhow::Result<Self> {
        match cfg.kind {
            StoreKind::Memory => {
                tracing::warn!("using in-memory store; nothing survives a restart");
                Ok(Self::from_shared(Arc::new(MemoryStore::new())))
            }
            StoreKind::Postgres => {
                if cfg.uri.is_empty() {
                    anyhow::bail!("store.uri (or DATABASE_URL) is required for the postgres store");
                }
                let pool = PgPoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .connect(&cfg.uri)
                    .await
                    .context("failed to connect to postgres")?;
                let store = PgStore::new(pool);
                store.apply_schema().await.context("failed to apply schema")?;
                tracing::info!(max_connections = cfg.max_connections, "postgres store ready");
                Ok(Self::from_shared(Arc::new(store)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Intervals {
    ledger_poll: Duration,
    aggregation: Duration,
    reconciliation: Duration,
    catchup: Duration,
}

pub struct Services {
    pub stores: Stores,
    pub ingestor: Arc<TelemetryIngestor>,
    pub generator: Arc<LedgerGenerator>,
    pub aggregator: Arc<Aggregator>,
    pub reconciler: Arc<ReconciliationJob>,
    pub reader: Arc<AggregateReader>,
    pub dirty: Arc<DirtyBuckets>,
    pub wake: Arc<Notify>,
    intervals: Intervals,
}

impl Services {
    pub fn build(stores: Stores, cfg: &AppConfig) -> anyhow::Result<Self> {
        let offset = cfg.aggregation.offset()?;
        let catalog: Arc<dyn DeviceCatalog> = Arc::new(StaticCatalog::from_config(&cfg.devices));
        let wake = Arc::new(Notify::new());
        let dirty = Arc::new(DirtyBuckets::new(offset));

        let ingestor = Arc::new(TelemetryIngestor::new(
            stores.telemetry.clone(),
            QualitySettings::from(&cfg.ingest),
            wake.clone(),
        ));
        let generator = Arc::new(LedgerGenerator::new(
            stores.telemetry.clone(),
            stores.ledger.clone(),
            CostResolver::new(stores.costs.clone()),
            catalog.clone(),
            GeneratorSettings {
                default_cost_per_kwh: cfg.ledger.default_cost_per_kwh,
                workers: cfg.ledger.workers.max(1),
                offline_timeout: cfg.ledger.offline_timeout_secs.map(Duration::from_secs),
            },
        ));
        let aggregator = Arc::new(Aggregator::new(
            stores.ledger.clone(),
            stores.aggregates.clone(),
            offset,
            cfg.aggregation.max_retries,
            cfg.aggregation.retry_backoff(),
        ));
        let reconciler = Arc::new(ReconciliationJob::new(
            stores.telemetry.clone(),
            stores.ledger.clone(),
            stores.review.clone(),
            aggregator.clone(),
            ReconcileSettings {
                gap_threshold: Duration::from_secs(cfg.reconciliation.gap_threshold_secs),
                lookback: Duration::from_secs(u64::from(cfg.reconciliation.lookback_days) * SECS_PER_DAY),
            },
        ));
        let reader = Arc::new(AggregateReader::new(stores.aggregates.clone(), catalog));

        Ok(Self {
            stores,
            ingestor,
            generator,
            aggregator,
            reconciler,
            reader,
            dirty,
            wake,
            intervals: Intervals {
                ledger_poll: cfg.ledger.poll_interval(),
                aggregation: Duration::from_secs(cfg.aggregation.interval_secs.max(1)),
                reconciliation: Duration::from_secs(cfg.reconciliation.interval_secs.max(1)),
                catchup: Duration::from_secs(u64::from(cfg.aggregation.catchup_days) * SECS_PER_DAY),
            },
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            generator: self.generator.clone(),
            dirty: self.dirty.clone(),
            costs: self.stores.costs.clone(),
            review: self.stores.review.clone(),
            reader: self.reader.clone(),
        }
    }

    /// Marks the buckets of the last `catchup_days` of every stream dirty, so
    /// aggregates interrupted by a shutdown are rewritten.
    pub async fn catch_up(&self, now: OffsetDateTime) -> Result<usize, StoreError> {
        let from = now - self.intervals.catchup;
        for key in self.stores.ledger.ledger_keys().await? {
            if let Some(switch_id) = key.switch_id.as_deref() {
                self.dirty.mark_span(&key.device_id, switch_id, from, now);
            }
        }
        let marked = self.dirty.len();
        tracing::info!(buckets = marked, "aggregate catch-up scheduled");
        Ok(marked)
    }

    /// Starts the ledger, aggregation and reconciliation loops.
    pub fn spawn_workers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.generator.clone().run(
                self.intervals.ledger_poll,
                self.wake.clone(),
                self.dirty.clone(),
                cancel.clone(),
            )),
            tokio::spawn(self.aggregator.clone().run(
                self.intervals.aggregation,
                self.dirty.clone(),
                cancel.clone(),
            )),
            tokio::spawn(
                self.reconciler
                    .clone()
                    .run_periodic(self.intervals.reconciliation, cancel.clone()),
            ),
        ]
    }
}
