//! Authenticated session state.
//!
//! A [`Session`] is immutable once minted. [`SessionHandle`] owns the current
//! one and is the only place a session is ever replaced: refreshes are
//! serialized and generation-checked, so several batches that hit the same
//! expired token trigger a single call to the [`AuthProvider`].

mod providers;

pub use providers::{parse_cookie_header, CommandAuthProvider, StaticAuthProvider};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth provider failed: {0}")]
    Provider(String),

    #[error("auth provider returned an empty bearer token")]
    EmptyToken,

    #[error("invalid auth provider output: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("session still rejected after {0} refreshes")]
    Exhausted(u32),

    #[error("failed to run auth helper {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("auth helper timed out after {0:?}")]
    Timeout(Duration),
}

/// Bearer token plus the cookies the API expects alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub bearer_token: String,
    pub cookies: BTreeMap<String, String>,
}

impl Session {
    pub fn new(bearer_token: impl Into<String>, cookies: BTreeMap<String, String>) -> Self {
        Self {
            bearer_token: bearer_token.into(),
            cookies,
        }
    }

    /// `Cookie` header value, or `None` without cookies.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Source of fresh sessions.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_session(&self) -> Result<Session, AuthError>;
}

/// A session together with the generation it was minted in.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub generation: u64,
    pub session: Arc<Session>,
}

pub struct SessionHandle {
    provider: Arc<dyn AuthProvider>,
    current: RwLock<Option<SessionSnapshot>>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
}

impl SessionHandle {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self {
            provider,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current session, minting the first one on demand.
    pub async fn current(&self) -> Result<SessionSnapshot, AuthError> {
        if let Some(snapshot) = self.current.read().await.clone() {
            return Ok(snapshot);
        }
        self.refresh(0).await
    }

    /// The current session without minting one.
    async fn peek(&self) -> Option<SessionSnapshot> {
        self.current.read().await.clone()
    }

    /// Replace the session seen as `stale_generation`.
    ///
    /// If another caller already replaced it, the newer session is returned
    /// without calling the provider. Generation 0 means "no session yet".
    pub async fn refresh(&self, stale_generation: u64) -> Result<SessionSnapshot, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(existing) = self.current.read().await.clone() {
            if existing.generation != stale_generation {
                return Ok(existing);
            }
        }

        let session = self.provider.get_session().await.map_err(|e| {
            warn!("Session refresh failed: {}", e);
            e
        })?;
        if session.bearer_token.trim().is_empty() {
            return Err(AuthError::EmptyToken);
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = SessionSnapshot {
            generation,
            session: Arc::new(session),
        };
        *self.current.write().await = Some(snapshot.clone());
        info!(
            "Session refreshed (generation {}, {} cookies)",
            generation,
            snapshot.session.cookies.len()
        );
        Ok(snapshot)
    }

    /// Unconditionally mint a new session.
    pub async fn force_refresh(&self) -> Result<SessionSnapshot, AuthError> {
        let stale = self.peek().await.map(|s| s.generation).unwrap_or(0);
        self.refresh(stale).await
    }

    /// Number of sessions minted so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Provider that mints `token-1`, `token-2`, ... and counts calls.
    #[derive(Default)]
    pub(crate) struct CountingProvider {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl AuthProvider for CountingProvider {
        async fn get_session(&self) -> Result<Session, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Session::new(format!("token-{}", n), BTreeMap::new()))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl AuthProvider for FailingProvider {
        async fn get_session(&self) -> Result<Session, AuthError> {
            Err(AuthError::Provider("browser crashed".into()))
        }
    }

    #[test]
    fn test_cookie_header() {
        let mut cookies = BTreeMap::new();
        assert_eq!(Session::new("t", cookies.clone()).cookie_header(), None);
        cookies.insert("b".to_string(), "2".to_string());
        cookies.insert("a".to_string(), "1".to_string());
        assert_eq!(
            Session::new("t", cookies).cookie_header().as_deref(),
            Some("a=1; b=2")
        );
    }

    #[tokio::test]
    async fn test_current_mints_once() {
        let provider = Arc::new(CountingProvider::default());
        let handle = SessionHandle::new(provider.clone());
        let first = handle.current().await.unwrap();
        let second = handle.current().await.unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(second.session.bearer_token, "token-1");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_of_same_generation_calls_provider_once() {
        let provider = Arc::new(CountingProvider::default());
        let handle = Arc::new(SessionHandle::new(provider.clone()));
        let stale = handle.current().await.unwrap().generation;

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.refresh(stale).await })
            })
            .collect();
        for task in tasks {
            let snapshot = task.await.unwrap().unwrap();
            assert_eq!(snapshot.generation, 2);
            assert_eq!(snapshot.session.bearer_token, "token-2");
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_always_mints() {
        let provider = Arc::new(CountingProvider::default());
        let handle = SessionHandle::new(provider.clone());
        handle.current().await.unwrap();
        handle.force_refresh().await.unwrap();
        let snapshot = handle.force_refresh().await.unwrap();
        assert_eq!(snapshot.generation, 3);
        assert_eq!(handle.generation(), 3);
    }

    #[tokio::test]
    async fn test_provider_failure_propagates() {
        let handle = SessionHandle::new(Arc::new(FailingProvider));
        let err = handle.current().await.unwrap_err();
        assert!(matches!(err, AuthError::Provider(_)));
        assert!(handle.peek().await.is_none());
    }
}
