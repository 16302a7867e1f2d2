//! Carrier guideline knowledge: the similarity-searchable store and the
//! retrieval policy on top of it.

pub mod retriever;
pub mod store;

pub use retriever::{FALLBACK_GUIDELINES_VERSION, GuidelineRetriever, fallback_guidelines};
pub use store::{GuidelineDocument, GuidelineMatch, GuidelineStore};
