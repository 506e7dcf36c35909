use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    ingest::{IngestOutcome, Submission, TelemetrySubmission},
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<Submission>>,
    max_request_records: usize,
}

/// `POST /ingest/telemetry` feeding a bounded queue. When the queue is full,
/// items are shed immediately and reported as overloaded.
#[derive(Clone)]
pub struct HttpTelemetrySource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<Submission>>>>>,
}

/// Request body: a single submission or an array of them.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum IngestBody {
    Many(Vec<TelemetrySubmission>),
    One(TelemetrySubmission),
}

#[derive(serde::Serialize)]
struct IngestResponse {
    accepted: usize,
    duplicate: usize,
    rejected: usize,
    overloaded: usize,
    results: Vec<IngestOutcome>,
}

impl HttpTelemetrySource {
    pub async fn new(
        bind_addr: &str,
        channel_capacity: usize,
        max_request_records: usize,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let app = ingest_router(tx, max_request_records);

        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PipelineError::Source(format!("failed to bind ingest listener on {addr}: {e}")))?;
        tracing::info!(%addr, "telemetry ingest listening");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!(error = %e, "telemetry ingest server error");
            }
        });

        Ok(Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        })
    }
}

pub fn ingest_router(tx: mpsc::Sender<Envelope<Submission>>, max_request_records: usize) -> Router {
    let shared = SharedSender {
        tx,
        max_request_records: max_request_records.max(1),
    };
    Router::new()
        .route("/ingest/telemetry", post(ingest_telemetry))
        .layer(DefaultBodyLimit::max(4 * 1024 * 1024))
        .with_state(shared)
}

#[async_trait::async_trait]
impl Source<Submission> for HttpTelemetrySource {
    async fn stream(&self) -> Result<EnvelopeStream<Submission>, PipelineError> {
        let mut guard = self.receiver.lock().await;
        let rx = guard
            .take()
            .ok_or_else(|| PipelineError::Source("telemetry stream already taken".to_string()))?;

        Ok(Box::pin(ReceiverStream::new(rx).map(Ok)))
    }
}

async fn ingest_telemetry(
    State(sender): State<SharedSender>,
    Json(body): Json<IngestBody>,
) -> Result<(StatusCode, Json<IngestResponse>), StatusCode> {
    metrics::counter!("http_ingest_requests_total").increment(1);

    let items = match body {
        IngestBody::Many(items) => items,
        IngestBody::One(item) => vec![item],
    };
    if items.len() > sender.max_request_records {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let mut pending = Vec::with_capacity(items.len());
    for telemetry in items {
        let (reply_tx, reply_rx) = oneshot::channel();
        let env = Envelope::now(Submission {
            telemetry,
            reply: Some(reply_tx),
        });

        match sender.tx.try_send(env) {
            Ok(()) => pending.push(Some(reply_rx)),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("telemetry_ingest_overloaded_total").increment(1);
                pending.push(None);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::counter!("http_ingest_failed_total").increment(1);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    let mut results = Vec::with_capacity(pending.len());
    for reply in pending {
        let outcome = match reply {
            Some(rx) => rx.await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
            None => IngestOutcome::Overloaded,
        };
        results.push(outcome);
    }

    let mut response = IngestResponse {
        accepted: 0,
        duplicate: 0,
        rejected: 0,
        overloaded: 0,
        results: Vec::new(),
    };
    for r in &results {
        match r {
            IngestOutcome::Accepted { .. } => response.accepted += 1,
            IngestOutcome::Duplicate { .. } => response.duplicate += 1,
            IngestOutcome::Rejected { .. } => response.rejected += 1,
            IngestOutcome::Overloaded => response.overloaded += 1,
        }
    }
    response.results = results;

    let status = if response.overloaded > 0 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/ingest/telemetry")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn full_queue_sheds_with_503() {
        let (tx, _rx) = mpsc::channel(1);
        let app = ingest_router(tx.clone(), 10);
        // Occupy the only slot.
        tx.try_send(Envelope::now(Submission::new(TelemetrySubmission::default())))
            .unwrap();

        let resp = app
            .oneshot(request(serde_json::json!([{
                "device_id": "esp-1",
                "switch_id": "1",
                "timestamp": "2024-03-01T10:00:00Z",
                "event_kind": "switch_on",
                "payload": {"state": true}
            }])))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["overloaded"], 1);
        assert_eq!(json["results"][0]["status"], "overloaded");
    }

    #[tokio::test]
    async fn replies_are_returned_in_order() {
        let (tx, mut rx) = mpsc::channel::<Envelope<Submission>>(8);
        let app = ingest_router(tx, 10);

        // Stand-in for the ingest workers.
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let outcome = match env.payload.telemetry.device_id.as_deref() {
                    Some(_) => IngestOutcome::Duplicate {
                        event_id: "x".to_string(),
                    },
                    None => IngestOutcome::Rejected {
                        reason: "missing field 'device_id'".to_string(),
                    },
                };
                if let Some(reply) = env.payload.reply {
                    let _ = reply.send(outcome);
                }
            }
        });

        let resp = app
            .oneshot(request(serde_json::json!([
                {"device_id": "esp-1", "timestamp": 1, "event_kind": "heartbeat"},
                {"timestamp": 1, "event_kind": "heartbeat"}
            ])))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["duplicate"], 1);
        assert_eq!(json["rejected"], 1);
        assert_eq!(json["results"][1]["status"], "rejected");
    }

    #[tokio::test]
    async fn oversized_batches_are_refused() {
        let (tx, _rx) = mpsc::channel(8);
        let app = ingest_router(tx, 1);
        let resp = app
            .oneshot(request(serde_json::json!([{}, {}])))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
