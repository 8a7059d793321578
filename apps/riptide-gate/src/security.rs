//! Handshake CSRF tokens.
//!
//! A token names the user it was minted for; verification recovers that
//! identity, so the gate never trusts a client-supplied user id directly.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use thiserror::Error;
use tracing::warn;

type HmacSha256 = Hmac<sha2::Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsrfError {
    #[error("malformed csrf token")]
    Malformed,
    #[error("csrf token signature mismatch")]
    BadSignature,
    #[error("csrf token expired")]
    Expired,
}

/// Validates the `csrf` field of a handshake and yields the user it was
/// minted for.
pub trait CsrfPolicy: Send + Sync {
    fn mint(&self, user_id: &str) -> String;
    fn verify(&self, token: &str) -> Result<String, CsrfError>;
}

/// HMAC-SHA256 tokens shaped `user.nonce.issued_at.mac`, the first three
/// parts covered by the mac. The embedded user id cannot be swapped without
/// the secret.
pub struct HmacCsrf {
    secret: Vec<u8>,
    ttl: Duration,
}

impl HmacCsrf {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self { secret: secret.into(), ttl }
    }

    fn mint_at(&self, user_id: &str, issued_at: u64) -> String {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let body = format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(user_id.as_bytes()),
            URL_SAFE_NO_PAD.encode(nonce),
            issued_at
        );
        let mac = self.mac_for(&body);
        format!("{body}.{}", URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn mac_for(&self, body: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("invalid hmac key");
        mac.update(body.as_bytes());
        mac
    }
}

impl CsrfPolicy for HmacCsrf {
    fn mint(&self, user_id: &str) -> String {
        self.mint_at(user_id, unix_now())
    }

    fn verify(&self, token: &str) -> Result<String, CsrfError> {
        let parts: Vec<&str> = token.split('.').collect();
        let &[user, nonce, issued_at, mac] = parts.as_slice() else {
            return Err(CsrfError::Malformed);
        };
        let issued: u64 = issued_at.parse().map_err(|_| CsrfError::Malformed)?;
        let user = URL_SAFE_NO_PAD
            .decode(user)
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .ok_or(CsrfError::Malformed)?;

        let body = format!("{}.{nonce}.{issued_at}", URL_SAFE_NO_PAD.encode(user.as_bytes()));
        let provided = URL_SAFE_NO_PAD.decode(mac).map_err(|_| CsrfError::BadSignature)?;
        self.mac_for(&body)
            .verify_slice(&provided)
            .map_err(|_| CsrfError::BadSignature)?;

        if unix_now().saturating_sub(issued) > self.ttl.as_secs() {
            return Err(CsrfError::Expired);
        }
        Ok(user)
    }
}

/// Development fallback when no secret is configured: every token passes
/// and maps to the anonymous user.
pub struct AllowAll;

impl CsrfPolicy for AllowAll {
    fn mint(&self, user_id: &str) -> String {
        format!("dev.{user_id}")
    }

    fn verify(&self, token: &str) -> Result<String, CsrfError> {
        Ok(token.strip_prefix("dev.").unwrap_or("anonymous").to_string())
    }
}

pub fn policy_from(secret: Option<&str>, ttl: Duration) -> Arc<dyn CsrfPolicy> {
    match secret {
        Some(secret) if !secret.is_empty() => Arc::new(HmacCsrf::new(secret.as_bytes(), ttl)),
        _ => {
            warn!(
                target: "riptide::gate",
                "RIPTIDE_CSRF_SECRET not set; accepting all handshake tokens"
            );
            Arc::new(AllowAll)
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
