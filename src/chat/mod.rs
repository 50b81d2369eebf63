//! Append-only conversation log with a recency-sorted summary view.

pub mod store;
pub mod types;
