//! Credential Verification
//!
//! Maps an opaque credential (bearer token or `?token=` query value) to a
//! user. The conductor only sees the [`Authenticator`] trait; the daemon uses
//! [`StaticTokenAuthenticator`] configured from the `[auth]` table.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::RngCore;
use thiserror::Error;

use crate::messages::UserId;

/// Size of issued tokens in bytes (hex-encoded to twice this length)
pub const TOKEN_SIZE: usize = 32;

/// Authentication failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential was supplied
    #[error("missing credential")]
    MissingCredential,

    /// The credential is not recognized
    #[error("invalid credential")]
    InvalidCredential,
}

/// Verifies credentials
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve `credential` to a user
    async fn authenticate(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// Fixed token table
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: Vec<(Vec<u8>, UserId)>,
}

impl std::fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenAuthenticator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl StaticTokenAuthenticator {
    /// Create an authenticator with no tokens
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a token-to-user map
    #[must_use]
    pub fn from_map(tokens: &HashMap<String, String>) -> Self {
        let mut auth = Self::new();
        for (token, user) in tokens {
            auth.insert(token, UserId::from(user.as_str()));
        }
        auth
    }

    /// Accept `token` for `user`
    pub fn insert(&mut self, token: &str, user: UserId) {
        self.tokens.push((token.as_bytes().to_vec(), user));
    }

    /// Mint a random token for `user` and accept it
    pub fn issue(&mut self, user: UserId) -> String {
        let token = generate_token();
        self.insert(&token, user);
        token
    }

    /// Number of accepted tokens
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are accepted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<UserId, AuthError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        // Compare against every entry so timing does not reveal the position
        let mut matched: Option<&UserId> = None;
        for (token, user) in &self.tokens {
            if constant_time_compare(token, credential.as_bytes()) && matched.is_none() {
                matched = Some(user);
            }
        }
        matched.cloned().ok_or(AuthError::InvalidCredential)
    }
}

/// Generate a random hex token
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Extract the token from an `Authorization: Bearer <token>` header value
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

/// Constant-time comparison of two byte slices.
///
/// Length mismatch returns early; token length is not secret.
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
