//! Coordination façade over a shared key/value + pub/sub service. Claims,
//! registry records, latest values and counters all go through this trait;
//! every key is built by [`keys`] so the namespace prefix is never skipped.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::CacheError;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Atomic claim primitive: set only when the key is absent. Returns
    /// whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    async fn mset(&self, pairs: &[(String, String)], ttl: Option<Duration>)
        -> Result<(), CacheError>;

    async fn incr(&self, key: &str) -> Result<i64, CacheError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError>;
}

/// Cache keyspace, namespaced by a prefix (default `chomp`). The namespace
/// is part of every key, so cross-namespace collisions cannot be expressed.
pub mod keys {
    pub fn claim(ns: &str, ingester: &str) -> String {
        format!("{ns}:claims:{ingester}")
    }

    pub fn registry(ns: &str, ingester: &str) -> String {
        format!("{ns}:ingesters:{ingester}")
    }

    pub fn latest(ns: &str, ingester: &str) -> String {
        format!("{ns}:latest:{ingester}")
    }

    pub fn registry_lock(ns: &str) -> String {
        format!("{ns}:locks:ingesters")
    }

    pub fn counter(ns: &str, ingester: &str, kind: &str) -> String {
        format!("{ns}:counters:{ingester}:{kind}")
    }

    pub fn channel(ns: &str, ingester: &str) -> String {
        format!("{ns}:{ingester}")
    }
}

const LOCK_TTL: Duration = Duration::from_millis(5000);
const LOCK_RETRY: Duration = Duration::from_millis(100);
const LOCK_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Run `f` while holding a short-lived advisory lock. The lock record
/// auto-expires in case of a crash; release is best-effort.
pub async fn with_lock<F, Fut, T, E>(
    cache: &dyn Cache,
    lock_key: &str,
    owner: &str,
    f: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: From<CacheError>,
{
    let deadline = tokio::time::Instant::now() + LOCK_TIMEOUT;
    while !cache.set_if_absent(lock_key, owner, Some(LOCK_TTL)).await? {
        if tokio::time::Instant::now() > deadline {
            return Err(CacheError::LockTimeout(lock_key.to_string()).into());
        }
        tokio::time::sleep(LOCK_RETRY).await;
    }

    let result = f().await;
    // only the owner releases; on error the TTL cleans up
    if cache.get(lock_key).await.map_err(E::from)?.as_deref() == Some(owner) {
        cache.del(lock_key).await.map_err(E::from)?;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::{memory::MemoryCache, *};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn lock_serializes_and_releases() {
        let cache = Arc::new(MemoryCache::new());
        let key = keys::registry_lock("chomp");

        let out = with_lock(cache.as_ref(), &key, "proc-1", || async {
            Ok::<_, CacheError>(7)
        })
        .await
        .unwrap();
        assert_eq!(out, 7);

        // released: a second holder acquires immediately
        assert!(cache.set_if_absent(&key, "proc-2", None).await.unwrap());
    }

    #[test]
    fn keys_carry_namespace() {
        assert_eq!(keys::claim("chomp", "btc_feed"), "chomp:claims:btc_feed");
        assert_eq!(keys::latest("other", "btc_feed"), "other:latest:btc_feed");
        assert_eq!(
            keys::counter("chomp", "btc_feed", "retry"),
            "chomp:counters:btc_feed:retry"
        );
        assert_eq!(keys::channel("chomp", "btc_feed"), "chomp:btc_feed");
    }
}
