//! Semantic search infrastructure for content embeddings.
//!
//! This module provides embedding generation through fastembed-rs and the
//! in-process building blocks of the local vector store.
//!
//! # Architecture
//!
//! - `embeddings`: Wraps fastembed for embedding generation
//! - `index`: In-memory vector index with cosine similarity search
//! - `ivf`: IVF partitions for approximate search over large indexes
//! - `storage`: Binary file I/O for vectors.bin persistence
//! - `preprocess`: Text bounds for embedding input and snippets

pub mod embeddings;
pub mod index;
mod ivf;
pub mod preprocess;
pub mod storage;

pub use embeddings::{Embedder, EmbeddingError, TextEmbedder};
pub use index::{VectorEntry, VectorIndex};
pub use preprocess::{
    embedding_input, index_snippet, truncate_chars, PRESENTED_SNIPPET_CHARS, STORED_SNIPPET_CHARS,
};
pub use storage::{model_id_hash, VectorStorage, VectorStorageError};

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";

/// Output dimension of the default model
pub const DEFAULT_DIMENSIONS: usize = 384;
