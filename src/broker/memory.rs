//! In-process broker used by tests and single-machine development. Mutations
//! wake blocked poppers through a shared notifier; expiring keys are lazily
//! collected on access.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use super::{Broker, BrokerError, Subscription};

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, BTreeSet<(i64, String)>>,
    kv: HashMap<String, (String, Option<Instant>)>,
    channels: HashMap<String, Vec<mpsc::Sender<String>>>,
}

impl State {
    fn expire_kv(&mut self, key: &str) {
        if let Some((_, Some(deadline))) = self.kv.get(key) {
            if Instant::now() >= *deadline {
                self.kv.remove(key);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    /// Woken on every list push so blocked pops re-check.
    wake: Arc<Notify>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> super::SharedBroker {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push_back(&self, key: &str, value: String) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.lists.entry(key.to_string()).or_default().push_back(value);
        drop(state);
        self.wake.notify_waiters();
        Ok(())
    }

    async fn pop_front(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.wake.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(list) = state.lists.get_mut(key) {
                    if let Some(value) = list.pop_front() {
                        return Ok(Some(value));
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Either a push arrives or we run out of patience.
            let _ = tokio::time::timeout(remaining, notified).await;
            if Instant::now() >= deadline {
                // One last non-blocking check so a push racing the deadline
                // is not lost.
                let mut state = self.state.lock().await;
                let value = state.lists.get_mut(key).and_then(VecDeque::pop_front);
                return Ok(value);
            }
        }
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
        let mut state = self.state.lock().await;
        if let Some(list) = state.lists.get_mut(key) {
            while drained.len() < max {
                match list.pop_front() {
                    Some(value) => drained.push(value),
                    None => break,
                }
            }
        }
        Ok(drained)
    }

    async fn list_len(&self, key: &str) -> Result<usize, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn list_all(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_clear(&self, key: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.lists.remove(key);
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: String) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, BrokerError> {
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current = hash
            .get(field)
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|e| BrokerError::Corrupt(format!("non-integer hash field {field}: {e}")))?
            .unwrap_or(0);
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn zadd(&self, key: &str, score: i64, member: String) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert((score, member));
        drop(state);
        self.wake.notify_waiters();
        Ok(())
    }

    async fn zpeek_min(&self, key: &str) -> Result<Option<(i64, String)>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state
            .zsets
            .get(key)
            .and_then(|z| z.iter().next().cloned()))
    }

    async fn zpop_due(&self, key: &str, max_score: i64) -> Result<Option<String>, BrokerError> {
        let mut state = self.state.lock().await;
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(None);
        };
        let due = zset
            .iter()
            .next()
            .filter(|(score, _)| *score <= max_score)
            .cloned();
        if let Some(entry) = due {
            zset.remove(&entry);
            return Ok(Some(entry.1));
        }
        Ok(None)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut state = self.state.lock().await;
        state.expire_kv(key);
        Ok(state.kv.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.kv.insert(key.to_string(), (value, None));
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        state.expire_kv(key);
        if state.kv.contains_key(key) {
            return Ok(false);
        }
        state
            .kv
            .insert(key.to_string(), (value, Some(Instant::now() + ttl)));
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.kv.get_mut(key) {
            entry.1 = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.kv.remove(key);
        state.lists.remove(key);
        state.hashes.remove(key);
        state.zsets.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        state.expire_kv(key);
        Ok(state.kv.contains_key(key)
            || state.lists.contains_key(key)
            || state.hashes.contains_key(key)
            || state.zsets.contains_key(key))
    }

    async fn publish(&self, channel: &str, message: String) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(subscribers) = state.channels.get_mut(channel) {
            subscribers.retain(|tx| tx.try_send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().await;
        state.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_is_fifo() {
        let broker = MemoryBroker::new();
        broker.push_back("q", "a".into()).await.unwrap();
        broker.push_back("q", "b".into()).await.unwrap();
        let got = broker.pop_front("q", Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn blocking_pop_wakes_on_push() {
        let broker = MemoryBroker::new();
        let popper = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.pop_front("q", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.push_back("q", "x".into()).await.unwrap();
        let got = popper.await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn pop_times_out_empty() {
        let broker = MemoryBroker::new();
        let got = broker.pop_front("q", Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn set_nx_claims_once_and_expires() {
        let broker = MemoryBroker::new();
        assert!(broker
            .set_nx_ex("lock", "me".into(), Duration::from_millis(30))
            .await
            .unwrap());
        assert!(!broker
            .set_nx_ex("lock", "you".into(), Duration::from_millis(30))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(broker
            .set_nx_ex("lock", "you".into(), Duration::from_millis(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn zset_pops_only_due_members() {
        let broker = MemoryBroker::new();
        broker.zadd("z", 100, "early".into()).await.unwrap();
        broker.zadd("z", 200, "late".into()).await.unwrap();
        assert_eq!(broker.zpop_due("z", 150).await.unwrap().as_deref(), Some("early"));
        assert_eq!(broker.zpop_due("z", 150).await.unwrap(), None);
        assert_eq!(broker.zpeek_min("z").await.unwrap(), Some((200, "late".into())));
    }

    #[tokio::test]
    async fn pubsub_delivers_in_order() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("ch").await.unwrap();
        broker.publish("ch", "1".into()).await.unwrap();
        broker.publish("ch", "2".into()).await.unwrap();
        assert_eq!(sub.recv().await.as_deref(), Some("1"));
        assert_eq!(sub.recv().await.as_deref(), Some("2"));
    }
}
