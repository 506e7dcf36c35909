pub mod partitioned_ingest;

pub use partitioned_ingest::{OutcomeTally, PartitionedIngestSink};
