// Retrieval: embeddings, the similarity index, schema sync and the
// context handed to SQL generation.

pub mod context_builder;
pub mod embedder;
pub mod handlers;
pub mod indexing;
pub mod prompts;
pub mod similarity;
pub mod store;
pub mod sync;

pub use context_builder::ContextBuilder;
pub use indexing::Indexer;
pub use similarity::SimilarityIndex;
pub use sync::SchemaSync;
