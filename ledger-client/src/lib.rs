pub mod db;
pub mod domain;
pub mod store;

pub use store::{
    AggregateStore, CostStore, InsertOutcome, LedgerStore, MemoryStore, ReviewQueue, StoreError,
    TelemetryStore,
};
