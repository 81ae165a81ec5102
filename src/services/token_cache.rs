// services/token_cache.rs
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Upstream that mints bearer tokens (the Daraja OAuth endpoint in production).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<Credential>;
}

type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Credential, String>>>;

#[derive(Default)]
struct CacheState {
    credential: Option<Credential>,
    in_flight: Option<(u64, SharedFetch)>,
    generation: u64,
}

/// Lazily refreshed bearer token with a single in-flight refresh.
///
/// Concurrent callers that find no usable token all await the same upstream
/// fetch; a failed fetch is reported to every one of them and nothing is
/// cached.
pub struct CredentialCache {
    source: Arc<dyn TokenSource>,
    safety_margin: chrono::Duration,
    state: Mutex<CacheState>,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn TokenSource>, safety_margin: Duration) -> Self {
        CredentialCache {
            source,
            safety_margin: chrono::Duration::from_std(safety_margin)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| AppError::service("credential cache lock poisoned"))
    }

    pub async fn get_token(&self) -> Result<String> {
        let (generation, fetch) = {
            let mut state = self.lock()?;

            if let Some(credential) = &state.credential {
                if credential.expires_at - self.safety_margin > Utc::now() {
                    debug!("Using cached access token");
                    return Ok(credential.token.clone());
                }
            }

            match &state.in_flight {
                Some((generation, fetch)) => {
                    debug!("Joining in-flight token refresh");
                    (*generation, fetch.clone())
                }
                None => {
                    info!("Requesting new access token");
                    state.generation += 1;
                    let generation = state.generation;
                    let source = self.source.clone();
                    let fetch = async move {
                        source.fetch().await.map_err(|err| match err {
                            AppError::AuthenticationFailure(msg) => msg,
                            other => other.to_string(),
                        })
                    }
                    .boxed()
                    .shared();
                    state.in_flight = Some((generation, fetch.clone()));
                    (generation, fetch)
                }
            }
        };

        let result = fetch.await;

        {
            let mut state = self.lock()?;
            let owns_slot = matches!(&state.in_flight, Some((g, _)) if *g == generation);
            if owns_slot {
                state.in_flight = None;
                if let Ok(credential) = &result {
                    state.credential = Some(credential.clone());
                }
            }
        }

        match result {
            Ok(credential) => Ok(credential.token),
            Err(msg) => {
                warn!("Access token refresh failed: {}", msg);
                Err(AppError::AuthenticationFailure(msg))
            }
        }
    }

    /// Drops the cached token, e.g. after the gateway answered 401.
    pub fn invalidate(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.credential = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
        fail: bool,
    }

    impl CountingSource {
        fn new(lifetime: chrono::Duration, fail: bool) -> Arc<Self> {
            Arc::new(CountingSource {
                calls: AtomicUsize::new(0),
                lifetime,
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch(&self) -> Result<Credential> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(AppError::AuthenticationFailure("400 Bad Request".to_string()));
            }
            Ok(Credential {
                token: format!("token-{}", n),
                expires_at: Utc::now() + self.lifetime,
            })
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let source = CountingSource::new(chrono::Duration::hours(1), false);
        let cache = CredentialCache::new(source.clone(), Duration::from_secs(60));

        let (a, b) = tokio::join!(cache.get_token(), cache.get_token());
        assert_eq!(a.unwrap(), "token-1");
        assert_eq!(b.unwrap(), "token-1");
        assert_eq!(source.calls(), 1);

        // Served from cache afterwards.
        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn many_spawned_callers_share_one_fetch() {
        let source = CountingSource::new(chrono::Duration::hours(1), false);
        let cache = Arc::new(CredentialCache::new(source.clone(), Duration::from_secs(60)));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_token().await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_and_is_not_cached() {
        let source = CountingSource::new(chrono::Duration::hours(1), true);
        let cache = CredentialCache::new(source.clone(), Duration::from_secs(60));

        let (a, b) = tokio::join!(cache.get_token(), cache.get_token());
        assert!(matches!(a, Err(AppError::AuthenticationFailure(ref m)) if m == "400 Bad Request"));
        assert!(matches!(b, Err(AppError::AuthenticationFailure(_))));
        assert_eq!(source.calls(), 1);

        assert!(cache.get_token().await.is_err());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn token_inside_safety_margin_is_refreshed() {
        let source = CountingSource::new(chrono::Duration::seconds(30), false);
        let cache = CredentialCache::new(source.clone(), Duration::from_secs(60));

        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let source = CountingSource::new(chrono::Duration::hours(1), false);
        let cache = CredentialCache::new(source.clone(), Duration::from_secs(60));

        cache.get_token().await.unwrap();
        cache.invalidate();
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
    }
}
