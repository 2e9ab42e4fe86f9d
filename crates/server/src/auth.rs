//! Bearer API keys for the authenticated portal channel. Each key maps to one
//! directory identity; the directory decides whether that identity is still
//! active and what role it holds.

use std::sync::Arc;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use lendroute_core::config::PortalApiKey;
use lendroute_core::directory::UserDirectory;
use lendroute_core::domain::approver::Approver;
use lendroute_core::errors::ApplicationError;
use secrecy::ExposeSecret;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthResult {
    Allowed(Approver),
    Denied { reason: &'static str },
}

#[derive(Clone)]
pub struct AuthManager {
    keys: Arc<Vec<PortalApiKey>>,
    directory: Arc<dyn UserDirectory>,
}

impl AuthManager {
    pub fn new(keys: Vec<PortalApiKey>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { keys: Arc::new(keys), directory }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthResult, ApplicationError> {
        let Some(presented) = bearer_key(headers) else {
            return Ok(AuthResult::Denied { reason: "API key required" });
        };

        let Some(entry) =
            self.keys.iter().find(|entry| keys_match(entry.key.expose_secret(), presented))
        else {
            warn!(event_name = "portal.auth.unknown_key", "portal request with unknown API key");
            return Ok(AuthResult::Denied { reason: "Invalid API key" });
        };

        match self.directory.find_by_id(&entry.user_id).await? {
            Some(user) => {
                debug!(event_name = "portal.auth.allowed", user_id = %user.id, "portal caller authenticated");
                Ok(AuthResult::Allowed(user))
            }
            None => {
                warn!(
                    event_name = "portal.auth.inactive_user",
                    user_id = %entry.user_id,
                    "API key maps to a missing or inactive user"
                );
                Ok(AuthResult::Denied { reason: "API key user is not active" })
            }
        }
    }
}

fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, key) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let key = key.trim();
    (!key.is_empty()).then_some(key)
}

/// Constant-time over the key bytes; only the length is observable.
fn keys_match(expected: &str, presented: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}
