use thiserror::Error;

/// Describes why a purge attempt against a single pod failed.
///
/// A cache miss is not an error; see [`CacheManager::purge_cache`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// The request could not be issued as given.
    #[error("{0}")]
    Validation(String),

    /// The proxy answered, but with an error.
    #[error("{0}")]
    Upstream(String),

    /// The proxy could not be reached.
    #[error("{0}")]
    Transport(String),
}

/// Issues purges against a single proxy replica.
#[async_trait::async_trait]
pub trait CacheManager: Send + Sync {
    /// Purges `path` from the cache of the proxy at `host:port`.
    ///
    /// Returns `Ok(true)` if the object was cached and has been removed and `Ok(false)` if the
    /// object was not cached.
    async fn purge_cache(
        &self,
        host: &str,
        path: &str,
        port: i32,
        preserve_path: bool,
    ) -> Result<bool, CacheError>;
}

#[async_trait::async_trait]
impl<C: CacheManager + ?Sized> CacheManager for std::sync::Arc<C> {
    async fn purge_cache(
        &self,
        host: &str,
        path: &str,
        port: i32,
        preserve_path: bool,
    ) -> Result<bool, CacheError> {
        (**self).purge_cache(host, path, port, preserve_path).await
    }
}
