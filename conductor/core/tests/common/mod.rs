//! Shared fixtures for integration tests: a scripted inference backend, a
//! scripted search provider, and a server bound to an ephemeral port.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use conductor_core::config::ConductorConfig;
use conductor_core::{
    transport, BackendError, ChatRequest, Conductor, ConductorParts, LlmBackend, LlmResponse,
    MemoryStore, SearchError, SearchProvider, SearchQuery, SearchResult,
    StaticTokenAuthenticator, StreamingToken, UserId,
};

pub const ALICE_TOKEN: &str = "alice-token";
pub const BOB_TOKEN: &str = "bob-token";

// ============================================================================
// Mock backend
// ============================================================================

/// Inference backend that replays scripted fragments.
///
/// Priming calls are counted per model and can be slowed down or made to
/// fail, which is enough to observe routing decisions from outside.
pub struct MockBackend {
    pub fragments: Vec<String>,
    pub token_delay: Duration,
    pub prime_delay: Duration,
    pub failing_models: HashSet<String>,
    pub reachable: bool,
    primes: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            fragments: vec!["Hello".into(), " world".into()],
            token_delay: Duration::ZERO,
            prime_delay: Duration::ZERO,
            failing_models: HashSet::new(),
            reachable: true,
            primes: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl MockBackend {
    pub fn with_fragments(mut self, fragments: &[&str]) -> Self {
        self.fragments = fragments.iter().map(|f| (*f).to_string()).collect();
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn with_prime_delay(mut self, delay: Duration) -> Self {
        self.prime_delay = delay;
        self
    }

    pub fn failing(mut self, model: &str) -> Self {
        self.failing_models.insert(model.to_string());
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Priming loads issued for `model`
    pub fn primes_for(&self, model: &str) -> usize {
        self.primes.lock().get(model).copied().unwrap_or(0)
    }

    /// Priming loads issued for any model
    pub fn total_primes(&self) -> usize {
        self.primes.lock().values().sum()
    }

    /// Highest number of priming loads observed running at once
    pub fn max_concurrent_primes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Streaming requests received so far
    pub fn stream_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn health_check(&self) -> bool {
        self.reachable
    }

    async fn chat_streaming(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError> {
        self.requests.lock().push(request.clone());

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
        *self.primes.lock().entry(request.model.clone()).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.prime_delay.is_zero() {
            tokio::time::sleep(self.prime_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_models.contains(&request.model) {
            return Err(BackendError::Remote(format!(
                "model '{}' not found",
                request.model
            )));
        }
        Ok(LlmResponse {
            content: "Hi".into(),
            model: request.model.clone(),
            duration_ms: Some(1),
        })
    }
}

/// `size` pool connections all served by `backend`
pub fn backends(backend: &Arc<MockBackend>, size: usize) -> Vec<Arc<dyn LlmBackend>> {
    (0..size)
        .map(|_| Arc::clone(backend) as Arc<dyn LlmBackend>)
        .collect()
}

// ============================================================================
// Mock search
// ============================================================================

/// Search provider that accepts one key
pub struct MockSearch {
    pub accepted_key: String,
    pub results: Vec<SearchResult>,
    pub seen_keys: Mutex<Vec<String>>,
}

impl MockSearch {
    pub fn accepting(key: &str, results: Vec<SearchResult>) -> Self {
        Self {
            accepted_key: key.to_string(),
            results,
            seen_keys: Mutex::new(Vec::new()),
        }
    }

    /// A provider that rejects every key
    pub fn rejecting() -> Self {
        Self::accepting("", Vec::new())
    }
}

#[async_trait]
impl SearchProvider for MockSearch {
    async fn search(
        &self,
        api_key: &str,
        _query: &SearchQuery,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.seen_keys.lock().push(api_key.to_string());
        if !self.accepted_key.is_empty() && api_key == self.accepted_key {
            Ok(self.results.clone())
        } else {
            Err(SearchError::Rejected {
                status: 401,
                body: "invalid api key".into(),
            })
        }
    }
}

// ============================================================================
// Conductor and server fixtures
// ============================================================================

pub struct Fixture {
    pub conductor: Arc<Conductor>,
    pub store: Arc<MemoryStore>,
    pub backend: Arc<MockBackend>,
}

pub fn fixture(backend: MockBackend, pool_size: usize) -> Fixture {
    fixture_with(backend, pool_size, MockSearch::rejecting(), ConductorConfig::default())
}

pub fn fixture_with(
    backend: MockBackend,
    pool_size: usize,
    search: MockSearch,
    config: ConductorConfig,
) -> Fixture {
    let backend = Arc::new(backend);
    let store = Arc::new(MemoryStore::new());

    let mut auth = StaticTokenAuthenticator::new();
    auth.insert(ALICE_TOKEN, UserId::from("alice"));
    auth.insert(BOB_TOKEN, UserId::from("bob"));

    let conductor = Conductor::new(
        &config,
        ConductorParts {
            store: store.clone(),
            auth: Arc::new(auth),
            backends: backends(&backend, pool_size),
            search_provider: Arc::new(search),
        },
    );

    Fixture {
        conductor: Arc::new(conductor),
        store,
        backend,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub fixture: Fixture,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn spawn_server(fixture: Fixture) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    let conductor = Arc::clone(&fixture.conductor);
    tokio::spawn(async move {
        let _ = transport::serve(listener, conductor, async {
            let _ = rx.await;
        })
        .await;
    });

    TestServer {
        addr,
        fixture,
        shutdown: Some(tx),
    }
}

/// Serve `router` on an ephemeral port and return its base URL.
///
/// Stands in for an upstream HTTP service (inference backend, search API).
pub async fn spawn_stub(router: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

/// A base URL nothing listens on
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}
