//! depcache Core - Manifest, Tag and Error Types
//!
//! Value types shared by every depcache crate. A manifest snapshot maps
//! resource paths to versions; a tag records a query against a manifest and
//! the digest it observed; a cached result stays valid for as long as all of
//! its tags still hold against the latest manifest.
//!
//! This crate does no I/O.

pub mod config;
pub mod error;
pub mod manifest;
pub mod response;
pub mod tag;

pub use config::{EngineConfig, StoreConfig, DEFAULT_IMMUTABLE_MIN_AGE, DEFAULT_TAGS_HEADER};
pub use error::{
    ComputeError, ConfigError, DepcacheError, DepcacheResult, ManifestError, QueryError,
    StoreError,
};
pub use manifest::{Exclusion, Manifest, ManifestEntry};
pub use response::{CacheControl, CacheRequest, Headers, Response};
pub use tag::{
    compute_tag, decode_tags, encode_tags, exact_query, tags_are_current, Digest, Tag, TagHasher,
    TagQuery,
};
