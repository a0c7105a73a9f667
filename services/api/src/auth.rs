//! Client identity verification.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

const MOCK_TOKEN: &str = "mock-token-for-testing";
const TEST_TOKEN_PREFIX: &str = "test-";
const TEST_USER_ID: &str = "test_user";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingToken,
    #[error("Invalid authentication token")]
    InvalidToken,
}

/// Resolves a client-supplied token to an identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verifies tokens against a static allow-list.
#[derive(Debug, Clone, Default)]
pub struct TokenVerifier {
    tokens: HashMap<String, String>,
    allow_test_tokens: bool,
}

impl TokenVerifier {
    pub fn new(tokens: HashMap<String, String>, allow_test_tokens: bool) -> Self {
        Self {
            tokens,
            allow_test_tokens,
        }
    }

    fn is_test_token(&self, token: &str) -> bool {
        self.allow_test_tokens && (token == MOCK_TOKEN || token.starts_with(TEST_TOKEN_PREFIX))
    }
}

/// Removes an optional `Bearer` scheme and surrounding whitespace.
fn strip_bearer(raw: &str) -> &str {
    let token = raw.trim();
    match token.strip_prefix("Bearer") {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim(),
        _ => token,
    }
}

#[async_trait]
impl IdentityVerifier for TokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = strip_bearer(token);
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if let Some(user_id) = self.tokens.get(token) {
            return Ok(Identity {
                user_id: user_id.clone(),
            });
        }
        if self.is_test_token(token) {
            debug!("Accepted development token");
            return Ok(Identity {
                user_id: TEST_USER_ID.to_string(),
            });
        }
        Err(AuthError::InvalidToken)
    }
}
