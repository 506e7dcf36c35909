pub mod aggregate;
pub mod api;
pub mod app;
pub mod catalog;
pub mod config;
pub mod cost;
pub mod error;
pub mod ids;
pub mod ingest;
pub mod ledger;
pub mod locks;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod query;
pub mod reconcile;
pub mod sinks;
pub mod sources;

pub use pipeline::{Envelope, Pipeline};
