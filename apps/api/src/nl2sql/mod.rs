// Natural-language to SQL: query records, the orchestrator that drives
// conversion and execution, and its HTTP handlers.

pub mod handlers;
pub mod service;
pub mod store;

pub use service::Orchestrator;
pub use store::PgQueryStore;
