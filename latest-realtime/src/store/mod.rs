//! Persistence adapters implementing [`MutationStore`](crate::interceptor::MutationStore).
//!
//! - [`memory`]: in-process map behind an async mutex
//! - [`rocks`] : RocksDB, one LZ4-compressed JSON value per record

pub mod memory;
pub mod rocks;

pub use memory::{MemoryStore, MemoryStoreError};
pub use rocks::{RocksStore, RocksStoreConfig, RocksStoreError};
