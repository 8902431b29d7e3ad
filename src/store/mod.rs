//! Job store: the only persistent state of the scheduler.
//!
//! The store is an ordered key-value map with per-key `put`/`get`/`delete`
//! and prefix `list`. It offers no transactions and no compare-and-swap;
//! every higher-level invariant is enforced by read-then-write logic in
//! [`crate::scheduler::JobStateMachine`].

pub mod keys;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("backend failure: {0}")]
    Backend(String),
}

/// Counters reported by the `stats` command.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StoreStats {
    #[prost(uint64, tag = "1")]
    pub keys: u64,
    #[prost(uint64, tag = "2")]
    pub bytes: u64,
    #[prost(uint64, tag = "3")]
    pub puts: u64,
    #[prost(uint64, tag = "4")]
    pub gets: u64,
    #[prost(uint64, tag = "5")]
    pub deletes: u64,
    #[prost(uint64, tag = "6")]
    pub lists: u64,
}

impl StoreStats {
    pub fn to_bytes(&self) -> Vec<u8> {
        prost::Message::encode_to_vec(self)
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Returns `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Full keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn stats(&self) -> StoreStats;
}
