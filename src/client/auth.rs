//! Request authenticators
//!
//! Applied to every outgoing request just before it is sent. Token rotation
//! spreads requests round-robin across the connection's credentials, which
//! multiplies the usable rate budget by the number of tokens.

use crate::config::AuthConfig;
use crate::{CollectError, Result};
use reqwest::RequestBuilder;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder;

    /// Number of credentials requests are spread across
    fn credential_count(&self) -> usize {
        1
    }
}

/// Sends requests unauthenticated
#[derive(Debug, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        request
    }
}

#[derive(Debug)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for BasicAuth {
    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }
}

/// Bearer tokens used in turn
#[derive(Debug)]
pub struct TokenRotation {
    tokens: Vec<String>,
    next: AtomicUsize,
}

impl TokenRotation {
    pub fn new(tokens: Vec<String>) -> Result<Self> {
        if tokens.is_empty() {
            return Err(CollectError::Config(
                "Token auth requires at least one token".to_string(),
            ));
        }
        Ok(Self {
            tokens,
            next: AtomicUsize::new(0),
        })
    }

    /// Token for the next request
    pub fn next_token(&self) -> &str {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.tokens.len();
        &self.tokens[index]
    }
}

impl Authenticator for TokenRotation {
    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.next_token())
    }

    fn credential_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Build the authenticator described by a connection's config
pub fn from_config(auth: &AuthConfig) -> Result<Arc<dyn Authenticator>> {
    Ok(match auth {
        AuthConfig::None => Arc::new(NoAuth),
        AuthConfig::Token { tokens } => Arc::new(TokenRotation::new(tokens.clone())?),
        AuthConfig::Basic { username, password } => {
            Arc::new(BasicAuth::new(username.clone(), password.clone()))
        }
    })
}
