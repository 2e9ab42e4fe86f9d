//! Encrypted, expiring approval tokens.
//!
//! A token is `base64url(nonce || ciphertext)` where the ciphertext is the
//! XChaCha20-Poly1305 sealing of a JSON envelope holding the caller's payload,
//! the absolute expiry and 32 random bytes. The cipher key is derived from the
//! configured secret with HMAC-SHA256 so the raw secret never keys the cipher
//! directly.
//!
//! Verification never consumes a token. Single use is enforced by the request
//! store, which clears the stored copy in the same write as the decision.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const KEY_CONTEXT: &[u8] = b"lendroute/approval-token/key/v1";
const ASSOCIATED_DATA: &[u8] = b"lendroute/approval-token/v1";
const CIPHER_NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const ENVELOPE_NONCE_LEN: usize = 32;

pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 168;

#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    payload: Map<String, Value>,
    expires_at: DateTime<Utc>,
    nonce: String,
}

pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Outcome of checking a token. Never an error: callers match on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenVerification {
    Valid(Map<String, Value>),
    Expired { expired_at: DateTime<Utc> },
    Malformed,
}

impl TokenVerification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token key could not be derived from the configured secret")]
    KeyDerivation,
    #[error("token payload could not be serialized: {0}")]
    Serialize(String),
    #[error("token could not be sealed")]
    Seal,
}

#[derive(Clone)]
pub struct ApprovalTokenService {
    key: Key,
    default_ttl: Duration,
}

impl std::fmt::Debug for ApprovalTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalTokenService")
            .field("key", &"[REDACTED]")
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl ApprovalTokenService {
    pub fn new(secret: &SecretString) -> Result<Self, TokenError> {
        Self::with_default_ttl(secret, Duration::hours(DEFAULT_TOKEN_TTL_HOURS))
    }

    pub fn with_default_ttl(secret: &SecretString, default_ttl: Duration) -> Result<Self, TokenError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|_| TokenError::KeyDerivation)?;
        mac.update(KEY_CONTEXT);
        let key = Key::clone_from_slice(&mac.finalize().into_bytes());
        Ok(Self { key, default_ttl })
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn issue(&self, payload: Map<String, Value>, ttl: Duration) -> Result<IssuedToken, TokenError> {
        self.issue_at(payload, ttl, Utc::now())
    }

    pub fn issue_at(
        &self,
        payload: Map<String, Value>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let mut envelope_nonce = [0_u8; ENVELOPE_NONCE_LEN];
        OsRng.fill_bytes(&mut envelope_nonce);

        let expires_at = now + ttl;
        let envelope =
            TokenEnvelope { payload, expires_at, nonce: URL_SAFE_NO_PAD.encode(envelope_nonce) };
        let plaintext =
            serde_json::to_vec(&envelope).map_err(|error| TokenError::Serialize(error.to_string()))?;

        let mut cipher_nonce = [0_u8; CIPHER_NONCE_LEN];
        OsRng.fill_bytes(&mut cipher_nonce);
        let ciphertext = XChaCha20Poly1305::new(&self.key)
            .encrypt(
                XNonce::from_slice(&cipher_nonce),
                Payload { msg: &plaintext, aad: ASSOCIATED_DATA },
            )
            .map_err(|_| TokenError::Seal)?;

        let mut sealed = Vec::with_capacity(CIPHER_NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&cipher_nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(IssuedToken { token: URL_SAFE_NO_PAD.encode(sealed), expires_at })
    }

    pub fn verify(&self, token: &str) -> TokenVerification {
        self.verify_at(token, Utc::now())
    }

    /// Decrypts and checks expiry. Any decoding, authentication or parsing
    /// failure is `Malformed`; a token is still valid at its exact expiry.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> TokenVerification {
        let Ok(sealed) = URL_SAFE_NO_PAD.decode(token.trim()) else {
            return TokenVerification::Malformed;
        };
        if sealed.len() <= CIPHER_NONCE_LEN + TAG_LEN {
            return TokenVerification::Malformed;
        }

        let (cipher_nonce, ciphertext) = sealed.split_at(CIPHER_NONCE_LEN);
        let Ok(plaintext) = XChaCha20Poly1305::new(&self.key).decrypt(
            XNonce::from_slice(cipher_nonce),
            Payload { msg: ciphertext, aad: ASSOCIATED_DATA },
        ) else {
            return TokenVerification::Malformed;
        };

        let Ok(envelope) = serde_json::from_slice::<TokenEnvelope>(&plaintext) else {
            return TokenVerification::Malformed;
        };

        if envelope.expires_at < now {
            return TokenVerification::Expired { expired_at: envelope.expires_at };
        }

        TokenVerification::Valid(envelope.payload)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use secrecy::SecretString;
    use serde_json::{json, Map, Value};

    use super::{ApprovalTokenService, TokenVerification};

    fn service(secret: &str) -> ApprovalTokenService {
        ApprovalTokenService::new(&SecretString::from(secret.to_owned())).expect("service")
    }

    fn payload() -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("request_id".to_owned(), json!("LR-2026-0001"));
        payload.insert("applicant_id".to_owned(), json!("u-41"));
        payload
    }

    #[test]
    fn verify_returns_payload_unchanged_right_after_issue() {
        let service = service("a-sufficiently-long-test-secret-value");

        let issued = service.issue(payload(), Duration::hours(1)).expect("issue");

        assert_eq!(service.verify(&issued.token), TokenVerification::Valid(payload()));
    }

    #[test]
    fn zero_ttl_token_expires_one_tick_later() {
        let service = service("a-sufficiently-long-test-secret-value");
        let issued_at = Utc::now();

        let issued = service.issue_at(payload(), Duration::zero(), issued_at).expect("issue");

        assert!(service.verify_at(&issued.token, issued_at).is_valid());
        assert_eq!(
            service.verify_at(&issued.token, issued_at + Duration::milliseconds(1)),
            TokenVerification::Expired { expired_at: issued_at }
        );
    }

    #[test]
    fn default_ttl_is_one_week() {
        let service = service("a-sufficiently-long-test-secret-value");
        assert_eq!(service.default_ttl(), Duration::hours(168));
    }

    #[test]
    fn same_payload_never_yields_same_token() {
        let service = service("a-sufficiently-long-test-secret-value");

        let first = service.issue(payload(), Duration::hours(1)).expect("issue");
        let second = service.issue(payload(), Duration::hours(1)).expect("issue");

        assert_ne!(first.token, second.token);
    }

    #[test]
    fn tampered_token_fails_closed() {
        let service = service("a-sufficiently-long-test-secret-value");
        let issued = service.issue(payload(), Duration::hours(1)).expect("issue");

        let mut chars: Vec<char> = issued.token.chars().collect();
        let last = chars.len() - 5;
        chars[last] = if chars[last] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();

        assert_eq!(service.verify(&tampered), TokenVerification::Malformed);
    }

    #[test]
    fn token_from_another_secret_is_malformed() {
        let issuer = service("a-sufficiently-long-test-secret-value");
        let verifier = service("a-completely-different-secret-value!");
        let issued = issuer.issue(payload(), Duration::hours(1)).expect("issue");

        assert_eq!(verifier.verify(&issued.token), TokenVerification::Malformed);
    }

    #[test]
    fn services_built_from_one_secret_derive_the_same_key() {
        let issuer = service("a-sufficiently-long-test-secret-value");
        let restarted = service("a-sufficiently-long-test-secret-value");
        let issued = issuer.issue(payload(), Duration::hours(1)).expect("issue");

        assert_eq!(restarted.verify(&issued.token), TokenVerification::Valid(payload()));
    }

    #[test]
    fn garbage_input_is_malformed() {
        let service = service("a-sufficiently-long-test-secret-value");

        assert_eq!(service.verify(""), TokenVerification::Malformed);
        assert_eq!(service.verify("not base64 !!"), TokenVerification::Malformed);
        assert_eq!(service.verify("c2hvcnQ"), TokenVerification::Malformed);
    }

    #[test]
    fn debug_output_redacts_token_material() {
        let service = service("a-sufficiently-long-test-secret-value");
        let issued = service.issue(payload(), Duration::hours(1)).expect("issue");

        assert!(!format!("{issued:?}").contains(&issued.token));
        assert!(format!("{service:?}").contains("[REDACTED]"));
    }
}
