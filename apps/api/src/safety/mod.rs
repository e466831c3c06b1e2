// SQL safety gate.
// Every candidate statement, generated or user-supplied, passes through here
// before it can reach a connector. The parser makes the accept/reject call;
// keyword and pattern scans sit in front of it.

pub mod analysis;
pub mod config;
pub mod gate;

pub use config::GateConfig;
pub use gate::{ApprovedSql, GateError, SafetyGate, ValidationResult};
