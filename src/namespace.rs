//! Typed views over a cache chain
//!
//! A [`NamespacedCache`] binds a key prefix, default load options and a
//! [`DataFetcher`] to a [`CacheChain`], so callers deal in ids and values
//! instead of keys and loaders. Several namespaces can share one chain.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::CacheError;
use crate::chain::{CacheChain, Cacheable};
use crate::options::LoadOptions;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for fetching values from the system of record.
///
/// Implementations can use a database, HTTP, or any other data source.
#[async_trait]
pub trait DataFetcher<V: Send + 'static>: Send + Sync + 'static {
    /// Fetch the value for the given id, or None if it doesn't exist.
    async fn fetch(&self, id: &str) -> Result<Option<V>, BoxError>;

    /// Fetch several ids at once. Ids without a value are left out.
    async fn fetch_many(&self, ids: &[String]) -> Result<HashMap<String, V>, BoxError> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(value) = self.fetch(id).await? {
                found.insert(id.clone(), value);
            }
        }
        Ok(found)
    }
}

pub struct NamespacedCache<V, F> {
    chain: CacheChain,
    fetcher: Arc<F>,
    options: LoadOptions,
    _value: PhantomData<fn() -> V>,
}

impl<V, F> Clone for NamespacedCache<V, F> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            fetcher: Arc::clone(&self.fetcher),
            options: self.options.clone(),
            _value: PhantomData,
        }
    }
}

impl<V, F> NamespacedCache<V, F>
where
    V: Cacheable,
    F: DataFetcher<V>,
{
    /// Create a view storing its entries under `prefix` (e.g. `"user:"`).
    pub fn new(chain: CacheChain, prefix: impl Into<String>, fetcher: F) -> Self {
        Self {
            chain,
            fetcher: Arc::new(fetcher),
            options: LoadOptions::new().with_prefix(prefix),
            _value: PhantomData,
        }
    }

    /// Replace the default options. The namespace prefix is kept unless
    /// `options` sets its own.
    pub fn with_options(mut self, mut options: LoadOptions) -> Self {
        if options.key_prefix.is_none() {
            options.key_prefix = self.options.key_prefix.take();
        }
        self.options = options;
        self
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Get the value for the given id, using the chain.
    pub async fn get(&self, id: &str) -> Result<Option<V>, CacheError> {
        let fetcher = Arc::clone(&self.fetcher);
        self.chain
            .load(
                id,
                |id| async move { fetcher.fetch(&id).await },
                &self.options,
            )
            .await
            .map_err(CacheError::Backend)
    }

    /// Get several values; ids without a value are absent from the map.
    pub async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, V>, CacheError> {
        let fetcher = Arc::clone(&self.fetcher);
        self.chain
            .load_multi(
                ids,
                |missing| async move { fetcher.fetch_many(&missing).await },
                &self.options,
            )
            .await
            .map_err(CacheError::Backend)
    }

    /// Store a value the caller already has.
    pub async fn put(&self, id: &str, value: &V) -> Result<(), CacheError> {
        self.chain.set(id, value, &self.options).await
    }

    /// Invalidate the cache entry for the given id.
    pub async fn invalidate(&self, id: &str) -> Result<(), CacheError> {
        self.chain.remove(id, &self.options).await;
        Ok(())
    }

    pub async fn invalidate_many(&self, ids: &[String]) -> Result<(), CacheError> {
        join_all(ids.iter().map(|id| self.chain.remove(id, &self.options))).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Account {
        id: String,
        plan: String,
    }

    struct AccountFetcher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DataFetcher<Account> for AccountFetcher {
        async fn fetch(&self, id: &str) -> Result<Option<Account>, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match id {
                "broken" => Err("account service unavailable".into()),
                "missing" => Ok(None),
                _ => Ok(Some(Account {
                    id: id.to_owned(),
                    plan: "pro".to_owned(),
                })),
            }
        }
    }

    async fn accounts() -> (NamespacedCache<Account, AccountFetcher>, Arc<AtomicUsize>) {
        let config = CacheConfig {
            enable_pubsub: false,
            ..CacheConfig::default()
        };
        let chain = CacheChain::from_config(config).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = NamespacedCache::new(
            chain,
            "account:",
            AccountFetcher {
                calls: Arc::clone(&calls),
            },
        );
        (cache, calls)
    }

    #[tokio::test]
    async fn test_get_fetches_once() {
        let (cache, calls) = accounts().await;

        let first = cache.get("a1").await.unwrap().unwrap();
        let second = cache.get("a1").await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.plan, "pro");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let (cache, calls) = accounts().await;

        cache.get("a1").await.unwrap();
        cache.invalidate("a1").await.unwrap();
        cache.get("a1").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_errors_surface_as_backend_errors() {
        let (cache, _) = accounts().await;
        assert!(matches!(
            cache.get("broken").await,
            Err(CacheError::Backend(_))
        ));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_many_fetches_only_misses() {
        let (cache, calls) = accounts().await;
        cache.get("a1").await.unwrap();

        let ids = vec!["a1".to_owned(), "a2".to_owned(), "missing".to_owned()];
        let found = cache.get_many(&ids).await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found["a2"].id, "a2");
        // a1 once, then a2 and missing through the default fetch_many
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        cache.invalidate_many(&ids).await.unwrap();
        cache.get_many(&ids).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_default_fetch_many_runs_on_spawned_task() {
        let fetcher = Arc::new(AccountFetcher {
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let ids = vec!["a1".to_owned(), "missing".to_owned()];

        let found = tokio::spawn(async move { fetcher.fetch_many(&ids).await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found["a1"].plan, "pro");
    }

    #[tokio::test]
    async fn test_with_options_keeps_prefix() {
        let (cache, _) = accounts().await;
        let cache = cache.with_options(LoadOptions::new().cache_absent());
        assert_eq!(cache.options().key_prefix.as_deref(), Some("account:"));
        assert!(cache.options().cache_absent);
    }
}
