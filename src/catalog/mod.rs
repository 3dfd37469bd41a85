//! Catalog backends and the run ledger.
//!
//! - [`MemoryCatalog`]: in-memory catalog with atomic change-set commits
//! - [`MemoryRunStore`]: in-memory ledger of finished runs

pub mod memory;

pub use memory::{MemoryCatalog, MemoryRunStore};
