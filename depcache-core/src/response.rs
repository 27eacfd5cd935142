//! Request and response values exchanged with the fetch collaborator.
//!
//! The engine only depends on a handful of response fields: status, the
//! `etag` version header, the `cache-control` directive and the final URL
//! after redirects.

use std::time::Duration;

use serde::de::DeserializeOwned;

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace every value for `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value.into()));
    }

    /// Remove every value for `name`, returning the first one removed.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut removed = None;
        self.0.retain(|(key, value)| {
            if key.eq_ignore_ascii_case(name) {
                if removed.is_none() {
                    removed = Some(value.clone());
                }
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A request descriptor handed to the fetch collaborator and used as the
/// identity of request cache entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
}

impl CacheRequest {
    /// A `GET` for `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Only `GET` requests can be stored.
    pub fn is_cacheable(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    /// Whether the `accept` header lists `media_type`.
    pub fn accepts(&self, media_type: &str) -> bool {
        self.headers
            .get("accept")
            .map(|accept| {
                accept
                    .split(',')
                    .any(|part| part.split(';').next().unwrap_or("").trim() == media_type)
            })
            .unwrap_or(false)
    }
}

/// A fetched (or cached) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// The `etag` header with any weak prefix and surrounding quotes removed.
    pub fn version(&self) -> Option<String> {
        let raw = self.headers.get("etag")?.trim();
        let raw = raw.strip_prefix("W/").unwrap_or(raw);
        let unquoted = raw
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .unwrap_or(raw);
        Some(unquoted.to_string())
    }

    pub fn cache_control(&self) -> CacheControl {
        self.headers
            .get("cache-control")
            .map(CacheControl::parse)
            .unwrap_or_default()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// The subset of `cache-control` directives the tracker cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub max_age: Option<u64>,
    pub immutable: bool,
}

impl CacheControl {
    pub fn parse(header: &str) -> Self {
        let mut parsed = Self::default();
        for directive in header.split(',') {
            let directive = directive.trim();
            let (name, value) = match directive.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (directive, None),
            };
            if name.eq_ignore_ascii_case("max-age") {
                parsed.max_age = value.and_then(|v| v.parse().ok());
            } else if name.eq_ignore_ascii_case("immutable") {
                parsed.immutable = true;
            }
        }
        parsed
    }

    /// Whether the resource asks to be treated as permanently valid.
    pub fn is_long_lived(&self, min_age: Duration) -> bool {
        self.immutable
            || self
                .max_age
                .map(|age| age >= min_age.as_secs())
                .unwrap_or(false)
    }
}
