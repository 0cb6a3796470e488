//! Redis-backed cache implementation over a multiplexed connection
//! manager. Values are stored as plain strings; callers serialize.

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use redis::AsyncCommands;

use super::Cache;
use crate::error::CacheError;

pub struct RedisCache {
    client: redis::Client,
    connection: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, connection })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.pset_ex(key, value, ttl.as_millis() as u64).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let out: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(out.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        // redis collapses a single-key MGET reply; keep the shape uniform
        let values: Vec<Option<String>> = if keys.len() == 1 {
            vec![conn.get(&keys[0]).await?]
        } else {
            conn.mget(keys).await?
        };
        Ok(values)
    }

    async fn mset(
        &self,
        pairs: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        for (key, value) in pairs {
            match ttl {
                Some(ttl) => {
                    pipe.pset_ex(key, value, ttl.as_millis() as u64).ignore();
                }
                None => {
                    pipe.set(key, value).ignore();
                }
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }
}
