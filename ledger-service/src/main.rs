use std::net::SocketAddr;

use anyhow::{Context, Result};
use ledger_service::{
    api,
    app::{Services, Stores},
    config::AppConfig,
    ingest::Submission,
    metrics_server, observability,
    pipeline::Pipeline,
    sinks::PartitionedIngestSink,
    sources::HttpTelemetrySource,
};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let stores = Stores::open(&cfg.store).await?;
    let services = Services::build(stores, &cfg)?;
    services.catch_up(OffsetDateTime::now_utc()).await?;

    let cancel = CancellationToken::new();
    let workers = services.spawn_workers(&cancel);

    // Admin and read API
    let api_addr: SocketAddr = cfg
        .api
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api.bind_addr: {e}"))?;
    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind api listener on {api_addr}"))?;
    tracing::info!(addr = %api_addr, "api listening");
    let api_app = api::router(services.api_state());
    let api_cancel = cancel.clone();
    let api_server = tokio::spawn(async move {
        let shutdown = async move { api_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, api_app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "api server error");
        }
    });

    // Telemetry ingest pipeline
    let source = HttpTelemetrySource::new(
        &cfg.ingest.http_bind_addr,
        cfg.ingest.channel_capacity,
        cfg.ingest.max_request_records,
    )
    .await?;
    let sink = PartitionedIngestSink::new(
        services.ingestor.clone(),
        cfg.ingest.workers,
        cfg.ingest.channel_capacity / cfg.ingest.workers.max(1),
        cfg.ingest.max_retries,
        cfg.ingest.retry_backoff(),
    );
    let pipeline = Pipeline {
        name: "telemetry",
        source,
        sink,
    };

    tokio::select! {
        res = pipeline.run::<Submission>() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "ingest pipeline stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    cancel.cancel();
    for handle in workers {
        let _ = handle.await;
    }
    let _ = api_server.await;
    tracing::info!(pending_buckets = services.dirty.len(), "stopped");
    Ok(())
}
