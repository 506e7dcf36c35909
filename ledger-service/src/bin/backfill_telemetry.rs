use std::{env, sync::Arc};

use anyhow::{bail, Result};
use ledger_service::{
    app::{Services, Stores},
    config::AppConfig,
    ingest::Submission,
    observability,
    pipeline::Pipeline,
    sinks::PartitionedIngestSink,
    sources::TelemetryBackfillFileSource,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: backfill_telemetry <ndjson_file_path>");
    }
    let file_path = &args[1];

    // LEDGER_CONFIG can point at a backfill-specific file.
    let cfg = AppConfig::load()?;
    let stores = Stores::open(&cfg.store).await?;
    let services = Services::build(stores, &cfg)?;

    let sink = Arc::new(PartitionedIngestSink::new(
        services.ingestor.clone(),
        cfg.ingest.workers,
        cfg.ingest.channel_capacity,
        cfg.ingest.max_retries,
        cfg.ingest.retry_backoff(),
    ));
    let pipeline = Pipeline {
        name: "telemetry-backfill",
        source: TelemetryBackfillFileSource::new(file_path),
        sink: sink.clone(),
    };
    pipeline.run::<Submission>().await?;
    let tally = sink.tally();
    tracing::info!(
        accepted = tally.accepted,
        duplicate = tally.duplicate,
        rejected = tally.rejected,
        failed = tally.failed,
        "backfill ingested"
    );

    // Fold the replayed events into the ledger and rewrite touched buckets.
    let report = services.generator.run_pass().await?;
    services.dirty.mark_entries(&report.entries);
    let targets = services.dirty.drain();
    let (written, leftover) = services
        .aggregator
        .recompute_all(targets, &CancellationToken::new())
        .await;
    tracing::info!(
        events = report.processed_events,
        entries = report.entries.len(),
        late = report.late_events,
        buckets = written,
        "backfill applied"
    );
    if !leftover.is_empty() {
        bail!("{} aggregate buckets could not be written", leftover.len());
    }

    Ok(())
}
