//! Kanji vocabulary: extraction from text and the per-scope occurrence index.

pub mod extract;
pub mod store;
pub mod types;
