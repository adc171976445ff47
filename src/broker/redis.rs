//! Redis-backed broker. Lists map to LPUSH/BRPOP-style queues, the delayed
//! queue to a sorted set popped with a small script, claims to SET NX PX.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Broker, BrokerError, Subscription};

pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connects to the broker at `url`, e.g. `redis://localhost:6379/0`.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::Unavailable(format!("bad broker url {url:?}: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        Ok(RedisBroker { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn unavailable(e: redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(e.to_string())
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push_back(&self, key: &str, value: String) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.rpush::<_, _, ()>(key, value).await.map_err(unavailable)
    }

    async fn pop_front(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn();
        // BLPOP with a zero timeout blocks forever; clamp to at least 10ms.
        let secs = timeout.as_secs_f64().max(0.01);
        let popped: Option<(String, String)> =
            conn.blpop(key, secs).await.map_err(unavailable)?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn pop_front_many(
        &self,
        key: &str,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<String>, BrokerError> {
        let Some(first) = self.pop_front(key, timeout).await? else {
            return Ok(Vec::new());
        };
        let mut drained = vec![first];
        if max > 1 {
            let mut conn = self.conn();
            let rest: Option<Vec<String>> = redis::cmd("LPOP")
                .arg(key)
                .arg(max - 1)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            drained.extend(rest.unwrap_or_default());
        }
        Ok(drained)
    }

    async fn list_len(&self, key: &str) -> Result<usize, BrokerError> {
        let mut conn = self.conn();
        conn.llen(key).await.map_err(unavailable)
    }

    async fn list_all(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn();
        conn.lrange(key, 0, -1).await.map_err(unavailable)
    }

    async fn list_clear(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await.map_err(unavailable)
    }

    async fn hash_set(&self, key: &str, field: &str, value: String) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(unavailable)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn();
        conn.hget(key, field).await.map_err(unavailable)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut conn = self.conn();
        conn.hgetall(key).await.map_err(unavailable)
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.hdel::<_, _, ()>(key, field).await.map_err(unavailable)
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, BrokerError> {
        let mut conn = self.conn();
        conn.hincr(key, field, by).await.map_err(unavailable)
    }

    async fn zadd(&self, key: &str, score: i64, member: String) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(unavailable)
    }

    async fn zpeek_min(&self, key: &str) -> Result<Option<(i64, String)>, BrokerError> {
        let mut conn = self.conn();
        let entries: Vec<(String, i64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(entries
            .into_iter()
            .next()
            .map(|(member, score)| (score, member)))
    }

    async fn zpop_due(&self, key: &str, max_score: i64) -> Result<Option<String>, BrokerError> {
        // Scripted so peek-and-remove is one atomic step across schedulers.
        let script = redis::Script::new(
            r"local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
              if #due == 0 then return false end
              redis.call('ZREM', KEYS[1], due[1])
              return due[1]",
        );
        let mut conn = self.conn();
        script
            .key(key)
            .arg(max_score)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.set::<_, _, ()>(key, value).await.map_err(unavailable)
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.pexpire::<_, ()>(key, ttl.as_millis() as i64)
            .await
            .map_err(unavailable)
    }

    async fn del(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await.map_err(unavailable)
    }

    async fn exists(&self, key: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn();
        conn.exists(key).await.map_err(unavailable)
    }

    async fn publish(&self, channel: &str, message: String) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, message)
            .await
            .map_err(unavailable)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(unavailable)?;
        pubsub.subscribe(channel).await.map_err(unavailable)?;
        let (tx, rx) = mpsc::channel(64);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, "dropping unreadable pubsub payload: {e}"),
                }
            }
        });
        Ok(Subscription::new(rx))
    }
}
