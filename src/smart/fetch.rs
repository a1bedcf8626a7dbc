//! HTTP seam for SMART SL publishers
//!
//! `SmartClient` never talks to reqwest directly; it goes through `Fetcher`
//! so manifests and NDJSON files can be served from memory in tests or
//! offline replays.

use crate::errors::SmartError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a URL and return its body as text.
    ///
    /// Non-success statuses are errors; retry policy belongs to the caller.
    async fn fetch_text(&self, url: &str) -> Result<String, SmartError>;
}

/// reqwest-backed fetcher with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, SmartError> {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|source| SmartError::Transport {
                url: String::new(),
                source,
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, SmartError> {
        let transport = |source| SmartError::Transport {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(transport)?;

        if !response.status().is_success() {
            return Err(SmartError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        response.text().await.map_err(transport)
    }
}

/// Serves fixed bodies from memory and counts requests per URL.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    bodies: HashMap<String, String>,
    hits: Mutex<HashMap<String, usize>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(url, body);
        self
    }

    pub fn insert(&mut self, url: impl Into<String>, body: impl Into<String>) {
        self.bodies.insert(url.into(), body.into());
    }

    /// Number of times `url` was requested.
    pub fn hits(&self, url: &str) -> usize {
        match self.hits.lock() {
            Ok(hits) => hits.get(url).copied().unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(url).copied().unwrap_or(0),
        }
    }

    /// Total requests across all URLs.
    pub fn total_hits(&self) -> usize {
        match self.hits.lock() {
            Ok(hits) => hits.values().sum(),
            Err(poisoned) => poisoned.into_inner().values().sum(),
        }
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, SmartError> {
        match self.hits.lock() {
            Ok(mut hits) => *hits.entry(url.to_string()).or_insert(0) += 1,
            Err(poisoned) => *poisoned.into_inner().entry(url.to_string()).or_insert(0) += 1,
        }

        self.bodies.get(url).cloned().ok_or_else(|| SmartError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}
