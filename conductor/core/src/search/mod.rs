//! Web Search Augmentation
//!
//! When a user opts in, the text of their turn is sent to a web search
//! provider and the results are injected as a system message. Search is
//! best effort: a failure never fails the turn, it only changes the notice
//! the model receives.

mod augmenter;
mod tavily;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use augmenter::{Augmentation, SearchAugmenter, SearchDefaults};
pub use tavily::TavilyClient;

/// One search hit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Page title
    #[serde(default)]
    pub title: String,
    /// Page URL
    #[serde(default)]
    pub url: String,
    /// Extracted snippet
    #[serde(default)]
    pub content: String,
}

/// Parameters of one search call
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    /// Query text
    pub query: String,
    /// `basic` or `advanced`
    pub search_depth: String,
    /// Maximum number of results
    pub max_results: usize,
    /// Restrict results to these domains
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include_domains: Vec<String>,
    /// Drop results from these domains
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_domains: Vec<String>,
}

/// Search failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    /// No credential is configured anywhere
    #[error("no search API key configured")]
    MissingCredential,

    /// The provider rejected the request
    #[error("search provider returned HTTP {status}: {body}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// Response body
        body: String,
    },

    /// The provider could not be reached
    #[error("search provider unreachable: {0}")]
    Transport(String),

    /// The response could not be decoded
    #[error("invalid search response: {0}")]
    Decode(String),
}

/// A web search API
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run `query` with `api_key`
    async fn search(
        &self,
        api_key: &str,
        query: &SearchQuery,
    ) -> Result<Vec<SearchResult>, SearchError>;
}
