use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::{
    ingest::{IngestOutcome, Submission, TelemetryIngestor},
    pipeline::{Envelope, PipelineError, Sink},
};

fn shard_index(key: &str, workers: usize) -> usize {
    use std::hash::{Hash, Hasher};

    let mut h = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % workers.max(1)
}

/// Fans submissions out to `workers` tasks, each owning a bounded queue.
/// Submissions of one (device, switch) stream always go to the same worker,
/// so a stream is appended in the order it arrived.
pub struct PartitionedIngestSink {
    ingestor: Arc<TelemetryIngestor>,
    workers: usize,
    queue_depth: usize,
    max_retries: u32,
    retry_backoff: Duration,
    tally: Arc<Mutex<OutcomeTally>>,
}

impl PartitionedIngestSink {
    pub fn new(
        ingestor: Arc<TelemetryIngestor>,
        workers: usize,
        queue_depth: usize,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            ingestor,
            workers: workers.max(1),
            queue_depth: queue_depth.max(1),
            max_retries,
            retry_backoff,
            tally: Arc::new(Mutex::new(OutcomeTally::default())),
        }
    }

    /// Outcomes of every submission handled so far.
    pub fn tally(&self) -> OutcomeTally {
        self.tally.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

struct IngestWorker {
    ingestor: Arc<TelemetryIngestor>,
    max_retries: u32,
    retry_backoff: Duration,
    tally: Arc<Mutex<OutcomeTally>>,
}

impl IngestWorker {
    async fn handle(&self, env: Envelope<Submission>) {
        let received_at = OffsetDateTime::from(env.received_at);
        let Submission { telemetry, reply } = env.payload;

        let mut attempt: u32 = 0;
        let outcome = loop {
            match self.ingestor.ingest(&telemetry, received_at).await {
                Ok(outcome) => break Some(outcome),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(error = %e, attempt, "telemetry append failed, retrying with backoff");
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "telemetry append failed, giving up");
                    metrics::counter!("telemetry_ingest_errors_total").increment(1);
                    break None;
                }
            }
        };

        {
            let mut tally = self.tally.lock().unwrap_or_else(|p| p.into_inner());
            match &outcome {
                Some(o) => tally.record(o),
                None => tally.failed += 1,
            }
        }

        if let Ok(dur) = SystemTime::now().duration_since(env.received_at) {
            metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
        }

        // Dropping the reply without an outcome tells the caller the item failed.
        if let (Some(reply), Some(outcome)) = (reply, outcome) {
            let _ = reply.send(outcome);
        }
    }
}

#[async_trait::async_trait]
impl Sink<Submission> for PartitionedIngestSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Submission>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut txs = Vec::with_capacity(self.workers);
        let mut joins = Vec::with_capacity(self.workers);

        for _ in 0..self.workers {
            let (tx, mut rx) = mpsc::channel::<Envelope<Submission>>(self.queue_depth);
            txs.push(tx);

            let worker = IngestWorker {
                ingestor: self.ingestor.clone(),
                max_retries: self.max_retries,
                retry_backoff: self.retry_backoff,
                tally: self.tally.clone(),
            };
            joins.push(tokio::spawn(async move {
                while let Some(env) = rx.recv().await {
                    worker.handle(env).await;
                }
            }));
        }

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline for PartitionedIngestSink");
                    continue;
                }
            };

            let idx = shard_index(&env.payload.shard_key(), self.workers);
            if txs[idx].send(env).await.is_err() {
                return Err(PipelineError::Sink("ingest worker channel closed".to_string()));
            }
        }

        drop(txs);
        for j in joins {
            j.await
                .map_err(|e| PipelineError::Sink(format!("ingest worker join error: {e}")))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, serde::Serialize)]
pub struct OutcomeTally {
    pub accepted: usize,
    pub duplicate: usize,
    pub rejected: usize,
    /// Store failures that outlasted the retries.
    pub failed: usize,
}

impl OutcomeTally {
    pub fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Accepted { .. } => self.accepted += 1,
            IngestOutcome::Duplicate { .. } => self.duplicate += 1,
            IngestOutcome::Rejected { .. } | IngestOutcome::Overloaded => self.rejected += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{QualitySettings, TelemetrySubmission};
    use ledger_client::{domain::SwitchKey, MemoryStore, TelemetryStore};
    use tokio::sync::{oneshot, Notify};

    #[test]
    fn same_key_same_worker() {
        assert_eq!(shard_index("esp-1/1", 4), shard_index("esp-1/1", 4));
        assert!(shard_index("esp-1/2", 4) < 4);
        assert_eq!(shard_index("anything", 0), 0);
    }

    #[tokio::test]
    async fn workers_append_and_reply() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = Arc::new(TelemetryIngestor::new(
            store.clone(),
            QualitySettings::default(),
            Arc::new(Notify::new()),
        ));
        let sink = PartitionedIngestSink::new(ingestor, 3, 4, 0, Duration::from_millis(1));

        let mut replies = Vec::new();
        let mut envs = Vec::new();
        for minute in 0..5 {
            let (tx, rx) = oneshot::channel();
            replies.push(rx);
            let telemetry: TelemetrySubmission = serde_json::from_value(serde_json::json!({
                "device_id": "esp-1",
                "switch_id": "1",
                "timestamp": format!("2024-03-01T10:0{minute}:00Z"),
                "event_kind": "heartbeat"
            }))
            .unwrap();
            envs.push(Ok(Envelope::now(Submission {
                telemetry,
                reply: Some(tx),
            })));
        }

        sink.run(futures::stream::iter(envs)).await.unwrap();

        for rx in replies {
            assert!(matches!(rx.await.unwrap(), IngestOutcome::Accepted { .. }));
        }
        assert_eq!(sink.tally().accepted, 5);
        let events = store
            .unprocessed_events(&SwitchKey::switch("esp-1", "1"))
            .await
            .unwrap();
        assert_eq!(events.len(), 5);
        // Arrival order within the stream is preserved.
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }
}
