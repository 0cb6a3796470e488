//! In-process cache implementation backing tests and single-node runs.
//! TTL-aware; pub/sub rides on tokio broadcast channels.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use tokio::sync::broadcast;

use super::Cache;
use crate::error::CacheError;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > Instant::now())
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let found = entries.get(key).map(|e| (e.live(), e.value.clone()));
        match found {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(Entry::live) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let found = entries.get(key).map(|e| (e.live(), e.value.clone()));
            match found {
                Some((true, value)) => out.push(Some(value)),
                Some((false, _)) => {
                    entries.remove(key);
                    out.push(None);
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    async fn mset(
        &self,
        pairs: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let expires_at = ttl.map(|t| Instant::now() + t);
        for (key, value) in pairs {
            entries.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let next = entries
            .get(key)
            .filter(|e| e.live())
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        // best-effort: no subscribers is not an error
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError> {
        let receiver = self.sender(channel).subscribe();
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let cache = MemoryCache::new();
        assert!(cache.set_if_absent("k", "a", None).await.unwrap());
        assert!(!cache.set_if_absent("k", "b", None).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_keys_release_claims() {
        let cache = MemoryCache::new();
        assert!(cache
            .set_if_absent("k", "a", Some(Duration::from_millis(10)))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.set_if_absent("k", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn mget_matches_mset() {
        let cache = MemoryCache::new();
        cache
            .mset(
                &[("a".into(), "1".into()), ("b".into(), "2".into())],
                None,
            )
            .await
            .unwrap();
        let out = cache
            .mget(&["a".into(), "missing".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(out, vec![Some("1".into()), None, Some("2".into())]);
    }

    #[tokio::test]
    async fn incr_counts_from_zero() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("c").await.unwrap(), 1);
        assert_eq!(cache.incr("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscriber() {
        let cache = MemoryCache::new();
        let mut stream = cache.subscribe("chomp:feed").await.unwrap();
        cache.publish("chomp:feed", "{\"x\":1}").await.unwrap();
        let msg = stream.next().await.unwrap();
        assert_eq!(msg, "{\"x\":1}");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let cache = MemoryCache::new();
        cache.publish("nobody", "payload").await.unwrap();
    }
}
