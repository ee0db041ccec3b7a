//! Tavily search client

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{SearchError, SearchProvider, SearchQuery, SearchResult};
use crate::backend::truncate_error_body;

/// HTTP client for the Tavily search API
#[derive(Clone, Debug)]
pub struct TavilyClient {
    base_url: String,
    http_client: reqwest::Client,
}

#[derive(Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    #[serde(flatten)]
    query: &'a SearchQuery,
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

impl TavilyClient {
    /// Create a client for `base_url` with a per-request timeout
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SearchError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SearchError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn search_url(&self) -> String {
        format!("{}/search", self.base_url)
    }
}

#[async_trait]
impl SearchProvider for TavilyClient {
    async fn search(
        &self,
        api_key: &str,
        query: &SearchQuery,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let response = self
            .http_client
            .post(self.search_url())
            .bearer_auth(api_key)
            .json(&TavilyRequest { api_key, query })
            .send()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate_error_body(&mut body);
            return Err(SearchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Decode(e.to_string()))?;
        Ok(parsed.results)
    }
}
