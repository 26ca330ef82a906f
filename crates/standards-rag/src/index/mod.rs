//! Read-only corpus indexes: chunk store and BM25 lexical index

pub mod bm25;
pub mod store;

pub use bm25::{tokenize, Bm25Index};
pub use store::ChunkStore;
