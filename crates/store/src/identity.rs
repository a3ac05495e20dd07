//! Principal acquisition and the local identity provider.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use civicwatch_core::{CivicError, PrincipalId, Result};

use crate::traits::IdentityProvider;

/// Obtain a principal: token sign-in when a token is given, falling back to
/// anonymous sign-in if that fails. The whole exchange is bounded by `timeout`.
///
/// Only fatal when the anonymous fallback itself fails (or time runs out);
/// the error is always `CivicError::Authentication`.
pub async fn acquire_principal(
    provider: &dyn IdentityProvider,
    token: Option<&str>,
    timeout: Duration,
) -> Result<PrincipalId> {
    match tokio::time::timeout(timeout, sign_in(provider, token)).await {
        Ok(result) => result,
        Err(_) => Err(CivicError::Authentication(format!(
            "identity acquisition timed out after {:?}",
            timeout
        ))),
    }
}

async fn sign_in(provider: &dyn IdentityProvider, token: Option<&str>) -> Result<PrincipalId> {
    if let Some(token) = token {
        match provider.sign_in_with_token(token).await {
            Ok(principal) => {
                info!(principal = %principal, "signed in with token");
                return Ok(principal);
            }
            Err(e) => {
                warn!(error = %e, "token sign-in failed, falling back to anonymous");
            }
        }
    }

    let principal = provider.sign_in_anonymously().await.map_err(|e| match e {
        CivicError::Authentication(_) => e,
        other => CivicError::Authentication(other.to_string()),
    })?;
    info!(principal = %principal, "signed in anonymously");
    Ok(principal)
}

/// In-process identity provider.
///
/// Token principals are derived from a hash of the token so the token itself
/// never ends up in collection paths or logs.
#[derive(Debug)]
pub struct LocalIdentity {
    accept_tokens: AtomicBool,
    allow_anonymous: AtomicBool,
    delay: Option<Duration>,
}

impl LocalIdentity {
    pub fn new() -> Self {
        Self {
            accept_tokens: AtomicBool::new(true),
            allow_anonymous: AtomicBool::new(true),
            delay: None,
        }
    }

    /// Every sign-in waits this long first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_accept_tokens(&self, accept: bool) {
        self.accept_tokens.store(accept, Ordering::SeqCst);
    }

    pub fn set_allow_anonymous(&self, allow: bool) {
        self.allow_anonymous.store(allow, Ordering::SeqCst);
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentity {
    async fn sign_in_with_token(&self, token: &str) -> Result<PrincipalId> {
        self.pause().await;
        let token = token.trim();
        if token.is_empty() {
            return Err(CivicError::Authentication("empty auth token".into()));
        }
        if !self.accept_tokens.load(Ordering::SeqCst) {
            return Err(CivicError::Authentication("auth token rejected".into()));
        }
        Ok(PrincipalId(format!("user-{:016x}", fnv1a(token.as_bytes()))))
    }

    async fn sign_in_anonymously(&self) -> Result<PrincipalId> {
        self.pause().await;
        if !self.allow_anonymous.load(Ordering::SeqCst) {
            return Err(CivicError::Authentication("anonymous sign-in disabled".into()));
        }
        Ok(PrincipalId(format!("anon-{}", uuid::Uuid::new_v4().simple())))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn token_sign_in_is_stable_and_hides_token() {
        let identity = LocalIdentity::new();
        let a = acquire_principal(&identity, Some("tok-123"), TIMEOUT).await.unwrap();
        let b = acquire_principal(&identity, Some("tok-123"), TIMEOUT).await.unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("user-"));
        assert!(!a.as_str().contains("tok-123"));
    }

    #[tokio::test]
    async fn rejected_token_falls_back_to_anonymous() {
        let identity = LocalIdentity::new();
        identity.set_accept_tokens(false);
        let principal = acquire_principal(&identity, Some("tok"), TIMEOUT).await.unwrap();
        assert!(principal.as_str().starts_with("anon-"));
    }

    #[tokio::test]
    async fn no_token_signs_in_anonymously() {
        let identity = LocalIdentity::new();
        let principal = acquire_principal(&identity, None, TIMEOUT).await.unwrap();
        assert!(principal.as_str().starts_with("anon-"));
    }

    #[tokio::test]
    async fn failed_fallback_is_fatal() {
        let identity = LocalIdentity::new();
        identity.set_accept_tokens(false);
        identity.set_allow_anonymous(false);
        let err = acquire_principal(&identity, Some("tok"), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CivicError::Authentication(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let identity = LocalIdentity::new().with_delay(Duration::from_secs(60));
        let err = acquire_principal(&identity, None, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
