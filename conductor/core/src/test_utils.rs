//! Scripted backend shared by unit tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backend::{BackendError, ChatRequest, LlmBackend, LlmResponse, StreamingToken};
use crate::routing::{ConnectionPool, EvictionPolicy, ModelRouter};

/// Backend that replays fixed fragments and counts calls
pub(crate) struct ScriptedBackend {
    pub fragments: Vec<String>,
    pub token_delay: Duration,
    pub fail_stream: Option<String>,
    pub fail_prime: HashSet<String>,
    pub primes: AtomicU32,
    pub streams: AtomicU32,
    pub last_request: Mutex<Option<ChatRequest>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            fragments: vec!["Hel".into(), "lo".into()],
            token_delay: Duration::ZERO,
            fail_stream: None,
            fail_prime: HashSet::new(),
            primes: AtomicU32::new(0),
            streams: AtomicU32::new(0),
            last_request: Mutex::new(None),
        }
    }
}

impl ScriptedBackend {
    pub fn primes(&self) -> u32 {
        self.primes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn chat_streaming(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());
        if let Some(ref reason) = self.fail_stream {
            return Err(BackendError::Unreachable(reason.clone()));
        }

        let (tx, rx) = mpsc::channel(16);
        let fragments = self.fragments.clone();
        let delay = self.token_delay;
        tokio::spawn(async move {
            let mut full = String::new();
            for fragment in fragments {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                full.push_str(&fragment);
                if tx.send(StreamingToken::Token(fragment)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamingToken::Complete { message: full }).await;
        });
        Ok(rx)
    }

    async fn chat(&self, request: &ChatRequest) -> Result<LlmResponse, BackendError> {
        self.primes.fetch_add(1, Ordering::SeqCst);
        if self.fail_prime.contains(&request.model) {
            return Err(BackendError::Remote(format!("model '{}' not found", request.model)));
        }
        Ok(LlmResponse {
            content: "Hi".into(),
            model: request.model.clone(),
            duration_ms: Some(1),
        })
    }
}

/// Router over `size` connections all sharing `backend`
pub(crate) fn router_over(backend: &Arc<ScriptedBackend>, size: usize) -> Arc<ModelRouter> {
    let backends: Vec<Arc<dyn LlmBackend>> = (0..size)
        .map(|_| Arc::clone(backend) as Arc<dyn LlmBackend>)
        .collect();
    Arc::new(ModelRouter::new(
        Arc::new(ConnectionPool::new(backends)),
        EvictionPolicy::FirstSlot,
    ))
}
