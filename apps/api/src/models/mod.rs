pub mod data_source;
pub mod definitions;
pub mod embedding;
pub mod query;

use thiserror::Error;

/// A stored enum column held a value this build does not know.
#[derive(Debug, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
