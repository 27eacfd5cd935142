//! Request cache keys.
//!
//! A stored response is addressed by its request line: the upper-cased method
//! and the URL with any fragment removed. Fragments never reach the server,
//! so two URLs differing only in their fragment share one entry.

use std::fmt;

use depcache_core::CacheRequest;

/// Separator byte between method and URL in the encoded form.
const SEPARATOR: u8 = b' ';

/// Normalized identity of a request cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    method: String,
    url: String,
}

impl RequestKey {
    pub fn new(method: &str, url: &str) -> Self {
        let url = match url.split_once('#') {
            Some((before, _)) => before,
            None => url,
        };
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
        }
    }

    pub fn for_request(request: &CacheRequest) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Encode as `METHOD URL` bytes for the LMDB key space.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.method.len() + 1 + self.url.len());
        bytes.extend_from_slice(self.method.as_bytes());
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(self.url.as_bytes());
        bytes
    }

    /// Decode a key produced by [`RequestKey::encode`].
    ///
    /// Returns `None` if the bytes are not UTF-8 or lack the separator.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let (method, url) = text.split_once(SEPARATOR as char)?;
        if method.is_empty() {
            return None;
        }
        Some(Self {
            method: method.to_string(),
            url: url.to_string(),
        })
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}
