pub mod http_telemetry;
pub mod telemetry_backfill_file;

pub use http_telemetry::HttpTelemetrySource;
pub use telemetry_backfill_file::TelemetryBackfillFileSource;
