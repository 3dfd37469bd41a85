//! Storage adapters for the remote file store.
//!
//! - [`MemoryStorage`]: in-memory store with injectable failures
//! - [`LocalFolderStorage`]: local directory tree (mounted share, synced bucket)

pub mod local;
pub mod memory;

pub use local::LocalFolderStorage;
pub use memory::MemoryStorage;
