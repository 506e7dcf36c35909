pub mod aggregate;
pub mod cost;
pub mod ledger;
pub mod review;
pub mod telemetry;

pub use aggregate::{rollup_by_bucket, Aggregate, BucketTotal, Granularity, SwitchScope};
pub use cost::{CostScope, CostVersion, NewCostVersion};
pub use ledger::{CalculationMethod, Confidence, EntryKind, LedgerEntry};
pub use review::{Anomaly, AnomalyKind};
pub use telemetry::{
    EventKind, EventPosition, NewTelemetryEvent, Payload, QualityFlag, SwitchKey, TelemetryEvent,
};
