//! LMDB-backed response store.
//!
//! Uses the heed crate (Rust bindings for LMDB) so request cache entries
//! survive restarts, the way a browser's Cache Storage does.
//!
//! # Value Layout
//!
//! `[stored_at millis: 8 bytes LE][meta length: 4 bytes LE][meta json][body]`
//!
//! The metadata holds the final URL, status and headers (including the tag
//! header written by the engine). The body is stored raw.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depcache_core::{DepcacheError, DepcacheResult, Headers, Response, StoreError};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};

use super::request_key::RequestKey;
use super::traits::{ResponseStore, StoreStats, StoredResponse};

const TIMESTAMP_LEN: usize = 8;
const META_LEN_LEN: usize = 4;
const HEADER_LEN: usize = TIMESTAMP_LEN + META_LEN_LEN;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Corrupt entry for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for DepcacheError {
    fn from(e: LmdbStoreError) -> Self {
        let store = match e {
            LmdbStoreError::EnvOpen(reason) | LmdbStoreError::DbOpen(reason) => {
                StoreError::Open { reason }
            }
            LmdbStoreError::Io(io) => StoreError::Open {
                reason: io.to_string(),
            },
            LmdbStoreError::Transaction(reason) => StoreError::TransactionFailed { reason },
            LmdbStoreError::Serialization { key, reason } => StoreError::Encode { key, reason },
            LmdbStoreError::Corrupt { key, reason } => StoreError::Corrupt { key, reason },
        };
        DepcacheError::Store(store)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredMeta {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
}

fn encode_value(
    key: &RequestKey,
    response: &Response,
    stored_at: DateTime<Utc>,
) -> Result<Vec<u8>, LmdbStoreError> {
    let meta = StoredMeta {
        url: response.url.clone(),
        status: response.status,
        headers: response
            .headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
    };
    let meta_bytes = serde_json::to_vec(&meta).map_err(|e| LmdbStoreError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    let meta_len = u32::try_from(meta_bytes.len()).map_err(|_| LmdbStoreError::Serialization {
        key: key.to_string(),
        reason: "response metadata exceeds 4 GiB".to_string(),
    })?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + meta_bytes.len() + response.body.len());
    bytes.extend_from_slice(&stored_at.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(&meta_len.to_le_bytes());
    bytes.extend_from_slice(&meta_bytes);
    bytes.extend_from_slice(&response.body);
    Ok(bytes)
}

fn decode_value(key: &RequestKey, bytes: &[u8]) -> Result<StoredResponse, LmdbStoreError> {
    let corrupt = |reason: &str| LmdbStoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if bytes.len() < HEADER_LEN {
        return Err(corrupt("value shorter than header"));
    }

    let timestamp_bytes: [u8; TIMESTAMP_LEN] = bytes[0..TIMESTAMP_LEN]
        .try_into()
        .map_err(|_| corrupt("invalid timestamp"))?;
    let stored_at = DateTime::from_timestamp_millis(i64::from_le_bytes(timestamp_bytes))
        .ok_or_else(|| corrupt("timestamp out of range"))?;

    let len_bytes: [u8; META_LEN_LEN] = bytes[TIMESTAMP_LEN..HEADER_LEN]
        .try_into()
        .map_err(|_| corrupt("invalid metadata length"))?;
    let meta_end = HEADER_LEN + u32::from_le_bytes(len_bytes) as usize;
    if bytes.len() < meta_end {
        return Err(corrupt("metadata truncated"));
    }

    let meta: StoredMeta =
        serde_json::from_slice(&bytes[HEADER_LEN..meta_end]).map_err(|e| LmdbStoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

    Ok(StoredResponse {
        response: Response {
            url: meta.url,
            status: meta.status,
            headers: meta.headers.into_iter().collect::<Headers>(),
            body: bytes[meta_end..].to_vec(),
        },
        stored_at,
    })
}

/// LMDB-backed response store.
///
/// # Example
///
/// ```ignore
/// use depcache_storage::{LmdbResponseStore, RequestKey, ResponseStore};
///
/// let store = LmdbResponseStore::new("/var/cache/depcache", 256)?;
/// store.put(&RequestKey::new("GET", url), &response, Utc::now()).await?;
/// ```
pub struct LmdbResponseStore {
    env: Env,
    db: Database<Bytes, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LmdbResponseStore {
    /// Open (or create) a store in `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        tracing::debug!(path = %path.as_ref().display(), max_size_mb, "opened LMDB response store");

        Ok(Self {
            env,
            db,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl ResponseStore for LmdbResponseStore {
    async fn get(&self, key: &RequestKey) -> DepcacheResult<Option<StoredResponse>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        match self.db.get(&rtxn, &key.encode()) {
            Ok(Some(bytes)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(decode_value(key, bytes)?))
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(LmdbStoreError::Transaction(e.to_string()).into())
            }
        }
    }

    async fn put(
        &self,
        key: &RequestKey,
        response: &Response,
        stored_at: DateTime<Utc>,
    ) -> DepcacheResult<()> {
        let value = encode_value(key, response, stored_at)?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        self.db
            .put(&mut wtxn, &key.encode(), &value)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, key: &RequestKey) -> DepcacheResult<bool> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let deleted = self
            .db
            .delete(&mut wtxn, &key.encode())
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(deleted)
    }

    async fn clear(&self) -> DepcacheResult<u64> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let removed = self
            .db
            .len(&wtxn)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        self.db
            .clear(&mut wtxn)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(removed)
    }

    async fn stats(&self) -> DepcacheResult<StoreStats> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let mut entry_count = 0u64;
        let mut size_bytes = 0u64;
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        for (_, value) in iter.flatten() {
            entry_count += 1;
            size_bytes += value.len() as u64;
        }

        Ok(StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbResponseStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store =
            LmdbResponseStore::new(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    fn make_response(url: &str) -> Response {
        Response::new(url, 200)
            .with_header("content-type", "application/javascript")
            .with_header("x-manifest-deps", r#"[["/app.js","abc"]]"#)
            .with_body(b"export default 1;".to_vec())
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _temp_dir) = create_test_store();
        let key = RequestKey::new("GET", "http://h/app.js");
        let response = make_response("http://h/app.js");
        let stored_at = Utc::now();

        store
            .put(&key, &response, stored_at)
            .await
            .expect("put should succeed");

        let stored = store
            .get(&key)
            .await
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(stored.response, response);
        assert!((stored.stored_at - stored_at).num_seconds().abs() < 1);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _temp_dir) = create_test_store();
        let cached = store
            .get(&RequestKey::new("GET", "http://h/missing"))
            .await
            .expect("get should succeed");
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_put_replaces_entry() {
        let (store, _temp_dir) = create_test_store();
        let key = RequestKey::new("GET", "http://h/app.js");

        store
            .put(&key, &make_response("http://h/app.js"), Utc::now())
            .await
            .expect("put should succeed");
        let replacement = Response::new("http://h/app.js", 404);
        store
            .put(&key, &replacement, Utc::now())
            .await
            .expect("put should succeed");

        let stored = store
            .get(&key)
            .await
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(stored.response.status, 404);
        assert!(stored.response.body.is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (store, _temp_dir) = create_test_store();
        for i in 0..4 {
            let url = format!("http://h/{i}.js");
            store
                .put(&RequestKey::new("GET", &url), &make_response(&url), Utc::now())
                .await
                .expect("put should succeed");
        }

        assert!(store
            .delete(&RequestKey::new("GET", "http://h/0.js"))
            .await
            .expect("delete should succeed"));
        assert!(!store
            .delete(&RequestKey::new("GET", "http://h/0.js"))
            .await
            .expect("delete should succeed"));

        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.entry_count, 3);

        assert_eq!(store.clear().await.expect("clear should succeed"), 3);
        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let key = RequestKey::new("GET", "http://h/app.js");
        {
            let store =
                LmdbResponseStore::new(temp_dir.path(), 10).expect("store creation should succeed");
            store
                .put(&key, &make_response("http://h/app.js"), Utc::now())
                .await
                .expect("put should succeed");
        }
        let store =
            LmdbResponseStore::new(temp_dir.path(), 10).expect("store reopen should succeed");
        assert!(store.get(&key).await.expect("get should succeed").is_some());
    }

    #[test]
    fn test_decode_rejects_truncated_value() {
        let key = RequestKey::new("GET", "http://h/a");
        let mut bytes = encode_value(&key, &make_response("http://h/a"), Utc::now())
            .expect("encode should succeed");
        bytes.truncate(HEADER_LEN + 3);
        let err = decode_value(&key, &bytes).unwrap_err();
        assert!(matches!(err, LmdbStoreError::Corrupt { .. }));

        let err = decode_value(&key, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, LmdbStoreError::Corrupt { .. }));
    }

    #[test]
    fn test_store_error_conversion() {
        let err: DepcacheError = LmdbStoreError::Transaction("map full".to_string()).into();
        assert!(matches!(
            err,
            DepcacheError::Store(StoreError::TransactionFailed { .. })
        ));
    }
}
