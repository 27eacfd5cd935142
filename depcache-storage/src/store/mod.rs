//! Request cache stores.
//!
//! A [`ResponseStore`] is a plain key-value table from [`RequestKey`] to a
//! stored response. Two implementations ship: an in-memory map for tests and
//! short-lived processes, and an LMDB environment for entries that should
//! survive restarts.

pub mod lmdb_backend;
pub mod memory;
pub mod request_key;
pub mod traits;

pub use lmdb_backend::{LmdbResponseStore, LmdbStoreError};
pub use memory::InMemoryResponseStore;
pub use request_key::RequestKey;
pub use traits::{ResponseStore, StoreStats, StoredResponse};
