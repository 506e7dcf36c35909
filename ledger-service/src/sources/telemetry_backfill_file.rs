use std::path::PathBuf;

use async_stream::stream;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use crate::{
    ingest::{Submission, TelemetrySubmission},
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
};

/// NDJSON file of telemetry submissions, one per line, in the same shape as
/// the HTTP ingest body. Used to replay firmware logs and exports.
pub struct TelemetryBackfillFileSource {
    path: PathBuf,
}

impl TelemetryBackfillFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn parse_line(line: &str) -> Option<Result<TelemetrySubmission, serde_json::Error>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(trimmed))
}

#[async_trait::async_trait]
impl Source<Submission> for TelemetryBackfillFileSource {
    async fn stream(&self) -> Result<EnvelopeStream<Submission>, PipelineError> {
        let file = File::open(&self.path).await.map_err(|e| {
            PipelineError::Source(format!("failed to open backfill file {}: {e}", self.path.display()))
        })?;
        let mut lines = BufReader::new(file).lines();

        let s = stream! {
            let mut line_no: u64 = 0;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(PipelineError::Source(format!("failed to read backfill line: {e}")));
                        break;
                    }
                };
                line_no += 1;

                match parse_line(&line) {
                    None => continue,
                    Some(Ok(telemetry)) => yield Ok(Envelope::now(Submission::new(telemetry))),
                    // A bad line is reported and skipped; the rest of the file still loads.
                    Some(Err(e)) => {
                        metrics::counter!("backfill_telemetry_parse_errors_total").increment(1);
                        yield Err(PipelineError::Source(format!("line {line_no}: {e}")));
                    }
                }
            }
        };

        Ok(Box::pin(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_line("   ").is_none());
        assert!(parse_line("# exported 2024-03-01").is_none());
        assert!(matches!(parse_line("{not json"), Some(Err(_))));

        let parsed = parse_line(r#"{"device_id":"esp-1","timestamp":1709287200000,"event_kind":"heartbeat"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.device_id.as_deref(), Some("esp-1"));
    }

    #[tokio::test]
    async fn bad_lines_do_not_stop_the_stream() {
        let path = std::env::temp_dir().join(format!("backfill-{}.ndjson", std::process::id()));
        tokio::fs::write(
            &path,
            "{\"device_id\":\"esp-1\",\"timestamp\":1,\"event_kind\":\"heartbeat\"}\n\
             garbage\n\
             \n\
             {\"device_id\":\"esp-2\",\"timestamp\":2,\"event_kind\":\"heartbeat\"}\n",
        )
        .await
        .unwrap();

        let source = TelemetryBackfillFileSource::new(&path);
        let items: Vec<_> = source.stream().await.unwrap().collect().await;
        let _ = tokio::fs::remove_file(&path).await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        let last = items[2].as_ref().unwrap();
        assert_eq!(last.payload.telemetry.device_id.as_deref(), Some("esp-2"));
    }

    #[tokio::test]
    async fn missing_file_is_a_source_error() {
        let source = TelemetryBackfillFileSource::new("/definitely/not/here.ndjson");
        assert!(matches!(source.stream().await, Err(PipelineError::Source(_))));
    }
}
