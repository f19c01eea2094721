//! Library surface for the hybrid RAG engine, so the crate can be embedded
//! without its HTTP layer (spec.md §6 "Library surface") and so integration
//! tests under `tests/` can exercise the Coordinator directly instead of
//! going through HTTP.

pub mod cache;
pub mod chunker;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod embedding_client;
pub mod error;
pub mod indexer;
pub mod retriever;
pub mod routes;
pub mod server;
pub mod storage;
pub mod watcher;
pub mod workspace;
