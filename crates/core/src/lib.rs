//! Core library: ingestion, classification jobs, indexing and retrieval.

pub mod classifier;
pub mod config;
pub mod embeddings;
pub mod indexer;
pub mod knowledge;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod retrieval;
pub mod scanner;

pub use providers;
