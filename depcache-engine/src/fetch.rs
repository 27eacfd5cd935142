//! Underlying fetch collaborator.
//!
//! The engine only needs status, the `etag` and `cache-control` headers, and
//! the final URL after redirects from whatever performs the real fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use depcache_core::{CacheRequest, ComputeError, DepcacheResult, Headers, Response};

/// Performs the actual network (or network-like) fetch for a request.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &CacheRequest) -> DepcacheResult<Response>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    async fn fetch(&self, request: &CacheRequest) -> DepcacheResult<Response> {
        (**self).fetch(request).await
    }
}

fn fetch_error(url: &str, reason: impl ToString) -> ComputeError {
    ComputeError::Fetch {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// HTTP FETCHER
// ============================================================================

/// Fetcher backed by a reqwest client. Redirects are followed and the final
/// URL is reported on the response.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &CacheRequest) -> DepcacheResult<Response> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| fetch_error(&request.url, e))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| fetch_error(&request.url, e))?;

        let url = response.url().to_string();
        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_error(&url, e))?;

        tracing::trace!(url = %url, status, "fetched");

        Ok(Response {
            url,
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

// ============================================================================
// MOCK FETCHER
// ============================================================================

/// Scripted fetcher for tests and embedding.
///
/// Unknown URLs answer `404` with no headers. Every call is counted per URL.
#[derive(Debug, Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<String, Result<Response, String>>>,
    calls: Mutex<HashMap<String, u64>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MockFetcher::set_response`].
    pub fn with_response(self, url: impl Into<String>, response: Response) -> Self {
        self.set_response(url, response);
        self
    }

    /// Answer requests for `url` with `response`.
    pub fn set_response(&self, url: impl Into<String>, response: Response) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(url.into(), Ok(response));
        }
    }

    /// Fail requests for `url` with a fetch error.
    pub fn set_failure(&self, url: impl Into<String>, reason: impl Into<String>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(url.into(), Err(reason.into()));
        }
    }

    /// Number of fetches issued for `url`.
    pub fn calls(&self, url: &str) -> u64 {
        self.calls
            .lock()
            .ok()
            .and_then(|calls| calls.get(url).copied())
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls
            .lock()
            .map(|calls| calls.values().sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &CacheRequest) -> DepcacheResult<Response> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(request.url.clone()).or_insert(0) += 1;
        }
        let scripted = self
            .responses
            .lock()
            .ok()
            .and_then(|responses| responses.get(&request.url).cloned());
        match scripted {
            Some(Ok(response)) => Ok(response),
            Some(Err(reason)) => Err(fetch_error(&request.url, reason).into()),
            None => Ok(Response::new(request.url.clone(), 404)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depcache_core::DepcacheError;

    #[tokio::test]
    async fn test_mock_fetcher_scripted_and_default() {
        let fetcher = MockFetcher::new().with_response(
            "http://h/a.js",
            Response::new("http://h/a.js", 200).with_header("etag", "\"1\""),
        );

        let hit = fetcher
            .fetch(&CacheRequest::get("http://h/a.js"))
            .await
            .expect("fetch should succeed");
        assert_eq!(hit.status, 200);

        let missing = fetcher
            .fetch(&CacheRequest::get("http://h/b.js"))
            .await
            .expect("fetch should succeed");
        assert!(missing.is_not_found());

        assert_eq!(fetcher.calls("http://h/a.js"), 1);
        assert_eq!(fetcher.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_fetcher_failure() {
        let fetcher = MockFetcher::new();
        fetcher.set_failure("http://h/down", "connection refused");
        let err = fetcher
            .fetch(&CacheRequest::get("http://h/down"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DepcacheError::Compute(ComputeError::Fetch { .. })
        ));
    }
}
