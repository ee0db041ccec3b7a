//! Credential fallback and result formatting for web search

use std::sync::Arc;

use parking_lot::RwLock;

use super::{SearchError, SearchProvider, SearchQuery, SearchResult};
use crate::backend::ChatMessage;
use crate::messages::UserId;
use crate::store::ChatStore;

/// Outcome of a search attempt, always convertible into a system message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Augmentation {
    /// At least one result
    Results(Vec<SearchResult>),
    /// The search ran and found nothing
    NoResults,
    /// Every credential failed, or none was configured
    Unavailable(String),
}

impl Augmentation {
    /// Whether the search degraded to a notice
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::Results(_))
    }

    /// System message to insert ahead of the conversation turns
    #[must_use]
    pub fn into_system_message(self) -> ChatMessage {
        let content = match self {
            Self::Results(results) => {
                let mut block = String::from(
                    "You must use the following web search results to answer the user's \
                     question. If the results contain the answer, base your answer on them \
                     rather than on your own knowledge. Web search results:\n\n",
                );
                for (n, result) in results.iter().enumerate() {
                    block.push_str(&format!(
                        "{}. {}: {}\n{}\n\n",
                        n + 1,
                        result.title,
                        result.url,
                        result.content
                    ));
                }
                block.truncate(block.trim_end().len());
                block
            }
            Self::NoResults => "The user enabled web search, but no relevant results were \
                                found. Answer from your existing knowledge."
                .to_string(),
            Self::Unavailable(reason) => format!(
                "The user enabled web search, but the search failed: {reason}. Tell the user \
                 that web search is currently unavailable and answer from your existing \
                 knowledge."
            ),
        };
        ChatMessage::system(content)
    }
}

/// Process-wide search defaults
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchDefaults {
    /// Maximum results per search
    pub max_results: usize,
    /// Depth used when the user has no preference
    pub search_depth: String,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            max_results: 5,
            search_depth: "basic".to_string(),
        }
    }
}

/// Runs web searches on behalf of users with credential fallback.
///
/// Credentials are tried in order: the user's own key, the process-wide key,
/// then the key from the environment. The first key that succeeds becomes the
/// process-wide key for later searches.
pub struct SearchAugmenter {
    provider: Arc<dyn SearchProvider>,
    store: Arc<dyn ChatStore>,
    process_key: RwLock<Option<String>>,
    env_key: Option<String>,
    defaults: SearchDefaults,
}

impl SearchAugmenter {
    /// Create an augmenter.
    ///
    /// `process_key` comes from configuration, `env_key` from `TAVILY_API_KEY`.
    #[must_use]
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        store: Arc<dyn ChatStore>,
        process_key: Option<String>,
        env_key: Option<String>,
        defaults: SearchDefaults,
    ) -> Self {
        Self {
            provider,
            store,
            process_key: RwLock::new(process_key.filter(|k| !k.is_empty())),
            env_key: env_key.filter(|k| !k.is_empty()),
            defaults,
        }
    }

    /// Current process-wide key
    #[must_use]
    pub fn process_key(&self) -> Option<String> {
        self.process_key.read().clone()
    }

    /// Search for `query` on behalf of `user`. Never fails.
    pub async fn augment(&self, query: &str, user: &UserId) -> Augmentation {
        let query = query.trim();
        if query.is_empty() {
            return Augmentation::NoResults;
        }

        let settings = match self.store.search_settings(user).await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "Failed to load search settings");
                crate::messages::SearchSettings::default()
            }
        };

        let search = SearchQuery {
            query: query.to_string(),
            search_depth: settings
                .search_depth
                .clone()
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| self.defaults.search_depth.clone()),
            max_results: self.defaults.max_results,
            include_domains: settings.include_domains.clone(),
            exclude_domains: settings.exclude_domains.clone(),
        };

        let mut last_error = SearchError::MissingCredential;
        for key in self.candidate_keys(settings.api_key) {
            match self.provider.search(&key, &search).await {
                Ok(results) => {
                    *self.process_key.write() = Some(key);
                    tracing::info!(user = %user, results = results.len(), "Web search completed");
                    return if results.is_empty() {
                        Augmentation::NoResults
                    } else {
                        Augmentation::Results(results)
                    };
                }
                Err(e) => {
                    tracing::warn!(user = %user, error = %e, "Web search attempt failed");
                    last_error = e;
                }
            }
        }

        tracing::warn!(user = %user, error = %last_error, "Web search unavailable");
        Augmentation::Unavailable(last_error.to_string())
    }

    fn candidate_keys(&self, user_key: Option<String>) -> Vec<String> {
        let mut keys: Vec<String> = Vec::with_capacity(3);
        let process_key = self.process_key();
        for key in [user_key, process_key, self.env_key.clone()]
            .into_iter()
            .flatten()
        {
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}
