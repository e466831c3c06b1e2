// Data source registry: ownership lookups, active sources and their
// discovered schemas. Connection configs are parsed by `connectors::config`.

pub mod handlers;
pub mod store;

pub use store::{DataSourceStore, PgDataSourceStore};
