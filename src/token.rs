//! Short-lived credential providers
//!
//! The MQTT wrapper and the presence session ask a [`TokenProvider`] for a
//! fresh token on every connect and reconnect.

use crate::deferred::Deferred;
use crate::error::sanitize_error_message;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Token fetch failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TokenError {
    #[error("CLIENT_TIMEOUT: {0}")]
    ClientTimeout(String),
    #[error("UNAUTHENTICATED: {0}")]
    Unauthenticated(String),
    #[error("NETWORK_ERROR: {0}")]
    NetworkError(String),
    #[error("UNKNOWN_ERROR: {0}")]
    Unknown(String),
}

/// Source of short-lived access tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> Result<String, TokenError>;
}

/// Provider that always returns the same token
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}

/// Settings for [`HttpTokenProvider`]
#[derive(Debug, Clone)]
pub struct HttpTokenConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Subtracted from `expires_in` so a token is refreshed before the server rejects it
    pub expiry_margin: Duration,
}

impl HttpTokenConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
            expiry_margin: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

type ErrorHandler = Arc<dyn Fn(&TokenError) + Send + Sync>;

#[derive(Default)]
struct ProviderState {
    cached: Option<CachedToken>,
    inflight: Option<Deferred<String, TokenError>>,
    context: Option<String>,
    error_handler: Option<ErrorHandler>,
}

/// Fetches tokens from `{base_url}/api/user/ulms_token`
///
/// Tokens are cached until shortly before they expire. Concurrent callers
/// during a fetch share the single in-flight request.
#[derive(Clone)]
pub struct HttpTokenProvider {
    config: HttpTokenConfig,
    client: Client,
    state: Arc<Mutex<ProviderState>>,
}

impl HttpTokenProvider {
    pub fn new(config: HttpTokenConfig) -> Result<Self, TokenError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TokenError::Unknown(e.to_string()))?;

        Ok(Self {
            config,
            client,
            state: Arc::new(Mutex::new(ProviderState::default())),
        })
    }

    /// Set the `context` query parameter for subsequent fetches
    pub fn set_context(&self, context: Option<String>) {
        self.lock_state().context = context;
    }

    /// Called with every classified fetch failure
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&TokenError) + Send + Sync + 'static,
    {
        self.lock_state().error_handler = Some(Arc::new(handler));
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn token_url(base_url: &str, context: Option<&str>) -> String {
        match context {
            Some(context) => format!("{base_url}/api/user/ulms_token?context={context}"),
            None => format!("{base_url}/api/user/ulms_token"),
        }
    }

    async fn fetch_token_data(&self, context: Option<String>) -> Result<TokenResponse, TokenError> {
        let url = Self::token_url(&self.config.base_url, context.as_deref());
        debug!(target: "token", "Requesting token from {}", url);

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<TokenErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            return Err(TokenError::Unauthenticated(message));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Unknown(format!("{status}: {body}")));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| TokenError::Unknown(e.to_string()))
    }

    async fn refresh(self, deferred: Deferred<String, TokenError>, context: Option<String>) {
        let started = Instant::now();
        let result = self.fetch_token_data(context).await;

        let handler = {
            let mut state = self.lock_state();
            state.inflight = None;
            match &result {
                Ok(data) => {
                    let lifetime = Duration::from_secs(data.expires_in)
                        .saturating_sub(self.config.expiry_margin);
                    state.cached = Some(CachedToken {
                        access_token: data.access_token.clone(),
                        expires_at: started + lifetime,
                    });
                    None
                }
                Err(_) => state.error_handler.clone(),
            }
        };

        match result {
            Ok(data) => {
                deferred.resolve(data.access_token);
            }
            Err(error) => {
                warn!(target: "token", "Token fetch failed: {}", sanitize_error_message(&error.to_string()));
                if let Some(handler) = handler {
                    handler(&error);
                }
                deferred.reject(error);
            }
        }
    }
}

fn classify_request_error(error: reqwest::Error) -> TokenError {
    if error.is_timeout() {
        TokenError::ClientTimeout("Request was aborted (client timeout)".to_string())
    } else if error.is_connect() {
        TokenError::NetworkError(error.to_string())
    } else {
        TokenError::Unknown(error.to_string())
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn get_token(&self) -> Result<String, TokenError> {
        let deferred = {
            let mut state = self.lock_state();

            if let Some(inflight) = &state.inflight {
                inflight.clone()
            } else {
                if let Some(cached) = &state.cached {
                    if Instant::now() < cached.expires_at {
                        return Ok(cached.access_token.clone());
                    }
                }

                let deferred = Deferred::new();
                state.inflight = Some(deferred.clone());
                // detached so a dropped caller cannot strand the other waiters
                tokio::spawn(self.clone().refresh(deferred.clone(), state.context.clone()));
                deferred
            }
        };

        deferred.wait().await
    }
}
