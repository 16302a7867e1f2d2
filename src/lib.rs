//! Compliance review: 10DLC submission verification against carrier guidelines.

pub mod carrier;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod guidelines;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod service;
pub mod store;
