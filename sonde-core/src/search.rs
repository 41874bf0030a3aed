//! Search gateway abstraction and adapters.
//!
//! Defines the `SearchGateway` trait the pipeline fans out over, a
//! DuckDuckGo instant-answer adapter (no API key required), and a
//! keyword-fixture mock for tests.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::config::SearchConfig;
use crate::error::SearchError;
use crate::types::SourceRef;

/// One hit returned by a search gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

impl SearchHit {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        snippet: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
        }
    }

    pub fn source_ref(&self) -> SourceRef {
        SourceRef::new(&self.title, &self.url)
    }
}

/// Trait for search gateways.
#[async_trait]
pub trait SearchGateway: Send + Sync {
    /// Run a query and return up to `max_results` hits.
    async fn search(&self, query: &str, max_results: usize)
    -> Result<Vec<SearchHit>, SearchError>;

    /// Gateway name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// DuckDuckGo gateway
// ---------------------------------------------------------------------------

/// Search the web using the DuckDuckGo instant answers API.
///
/// Privacy-first: queries go directly to DuckDuckGo, never through a
/// third party, and no API key is required.
pub struct DuckDuckGoSearch {
    client: Client,
    timeout_secs: u64,
}

impl DuckDuckGoSearch {
    pub fn new(config: &SearchConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("sonde/0.3")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            timeout_secs: config.timeout_secs,
        }
    }

    /// Extract hits from a DuckDuckGo instant-answer body.
    fn parse_body(body: &Value, max_results: usize) -> Vec<SearchHit> {
        let mut hits = Vec::new();

        // Abstract (main answer)
        if let Some(abstract_text) = body.get("AbstractText").and_then(|v| v.as_str())
            && !abstract_text.is_empty()
        {
            let source = body
                .get("AbstractSource")
                .and_then(|v| v.as_str())
                .unwrap_or("DuckDuckGo");
            let url = body
                .get("AbstractURL")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            hits.push(SearchHit::new(source, url, abstract_text));
        }

        // Related topics
        if let Some(topics) = body.get("RelatedTopics").and_then(|v| v.as_array()) {
            for topic in topics.iter().take(max_results.saturating_sub(hits.len())) {
                if let Some(text) = topic.get("Text").and_then(|v| v.as_str()) {
                    let url = topic.get("FirstURL").and_then(|v| v.as_str()).unwrap_or("");
                    let title = text.split(" - ").next().unwrap_or(text);
                    hits.push(SearchHit::new(title, url, text));
                }
            }
        }

        // Plain results array
        if let Some(res_array) = body.get("Results").and_then(|v| v.as_array()) {
            for result in res_array
                .iter()
                .take(max_results.saturating_sub(hits.len()))
            {
                if let Some(text) = result.get("Text").and_then(|v| v.as_str()) {
                    let url = result
                        .get("FirstURL")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    hits.push(SearchHit::new(text, url, text));
                }
            }
        }

        hits.truncate(max_results);
        hits
    }
}

#[async_trait]
impl SearchGateway for DuckDuckGoSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::InvalidQuery {
                reason: "query is empty".into(),
            });
        }

        let url = format!(
            "https://api.duckduckgo.com/?q={}&format=json&no_html=1&skip_disambig=1",
            urlencoding::encode(query)
        );

        debug!(query = %query, "Sending search request");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                SearchError::Timeout {
                    timeout_secs: self.timeout_secs,
                }
            } else {
                SearchError::Network {
                    message: format!("Search request failed: {}", e),
                }
            }
        })?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchError::ResponseParse {
                message: format!("Failed to parse search response: {}", e),
            })?;

        Ok(Self::parse_body(&body, max_results))
    }

    fn name(&self) -> &str {
        "duckduckgo"
    }
}

// ---------------------------------------------------------------------------
// Mock gateway
// ---------------------------------------------------------------------------

/// A mock search gateway backed by keyword fixtures.
///
/// A query matches a fixture when it contains the fixture keyword
/// (case-insensitive). Unmatched queries get a deterministic echo hit so
/// pipeline tests always have something to synthesize. Queries matching
/// a registered failure substring return an error instead, which makes
/// per-query failures reproducible under concurrent fan-out.
pub struct MockSearch {
    fixtures: Mutex<Vec<(String, Vec<SearchHit>)>>,
    failures: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockSearch {
    pub fn new() -> Self {
        Self {
            fixtures: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Register hits returned for queries containing `keyword`.
    pub fn with_fixture(self, keyword: &str, hits: Vec<SearchHit>) -> Self {
        self.fixtures
            .lock()
            .unwrap()
            .push((keyword.to_lowercase(), hits));
        self
    }

    /// Make queries containing `substring` fail with a network error.
    pub fn fail_on(self, substring: &str) -> Self {
        self.failures.lock().unwrap().push(substring.to_lowercase());
        self
    }

    /// Number of `search` calls received so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockSearch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchGateway for MockSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lowered = query.to_lowercase();

        for substring in self.failures.lock().unwrap().iter() {
            if lowered.contains(substring) {
                return Err(SearchError::Network {
                    message: format!("mock failure for query '{}'", query),
                });
            }
        }

        for (keyword, hits) in self.fixtures.lock().unwrap().iter() {
            if lowered.contains(keyword) {
                let mut hits = hits.clone();
                hits.truncate(max_results);
                return Ok(hits);
            }
        }

        Ok(vec![SearchHit::new(
            format!("Result for {}", query),
            format!("https://example.com/{}", urlencoding::encode(query)),
            format!("Mock snippet describing {}", query),
        )])
    }

    fn name(&self) -> &str {
        "mock"
    }
}
