//! Ledger generation from switch telemetry.

mod generator;
pub mod state;

pub use generator::{GeneratorSettings, LedgerGenerator, PassReport};
pub use state::{ClosedInterval, SwitchState};
