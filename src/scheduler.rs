//! The scheduling service: moves entries from the delayed queue onto the
//! execution queue when their time arrives. It never looks inside a node;
//! all it knows is (request, node, due time).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::NodeState;
use crate::broker::{keys, Broker, SharedBroker, WorkItem};
use crate::config::SiteConfig;
use crate::request::RequestHandle;

pub struct Scheduler {
    broker: SharedBroker,
    site: Arc<SiteConfig>,
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(broker: SharedBroker, site: SiteConfig) -> Self {
        Scheduler {
            broker,
            site: Arc::new(site),
        }
    }

    #[must_use]
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("scheduler started");
        let mut wake = None;
        let mut consecutive_errors: u32 = 0;
        while !*shutdown.borrow() {
            // (Re)subscribe lazily so a broker restart only costs one pass.
            if wake.is_none() {
                match self.broker.subscribe(keys::SCHED_WAKE).await {
                    Ok(subscription) => wake = Some(subscription),
                    Err(e) => warn!("cannot subscribe to wake channel: {e}"),
                }
            }
            match self.pass().await {
                Ok(idle_for) => {
                    consecutive_errors = 0;
                    let nap = idle_for.min(Duration::from_secs(1));
                    match wake.as_mut() {
                        Some(subscription) => {
                            // New delayed entries poke the wake channel; a
                            // plain sleep caps how stale our view can get.
                            let _ = tokio::time::timeout(nap, subscription.recv()).await;
                        }
                        None => tokio::time::sleep(nap).await,
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff =
                        self.site.retry_backoff() * 2u32.pow(consecutive_errors.min(6));
                    warn!("scheduler pass failed ({e}), backing off {backoff:?}");
                    wake = None;
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Drains everything currently due, then reports how long until the next
    /// entry (or a second when the queue is empty).
    async fn pass(&self) -> Result<Duration, crate::broker::BrokerError> {
        loop {
            let now = chrono::Utc::now().timestamp_millis();
            match self.broker.zpop_due(keys::SCHED_DELAYED, now).await? {
                Some(raw) => self.promote(&raw).await?,
                None => {
                    let until_next = self
                        .broker
                        .zpeek_min(keys::SCHED_DELAYED)
                        .await?
                        .map(|(due, _)| Duration::from_millis((due - now).max(0) as u64))
                        .unwrap_or(Duration::from_secs(1));
                    return Ok(until_next);
                }
            }
        }
    }

    /// Moves one due entry onto the execution queue, announcing READY. The
    /// claim sentinel keeps duplicate moves (scheduler races, broker
    /// redeliveries) from double-enqueueing a run.
    async fn promote(&self, raw: &str) -> Result<(), crate::broker::BrokerError> {
        let item = match WorkItem::decode(raw) {
            Ok(item) => item,
            Err(e) => {
                warn!("dropping unreadable delayed entry: {e}");
                return Ok(());
            }
        };
        let claimed = self
            .broker
            .set_nx_ex(
                &keys::sched_claim(&item.run_id),
                "moved".to_string(),
                self.site.request_timeout(),
            )
            .await?;
        if !claimed {
            debug!(run_id = %item.run_id, "delayed entry already moved, skipping");
            return Ok(());
        }
        if let Some(req) = RequestHandle::load(self.broker.clone(), &item.request_id).await? {
            if req.is_cancelled().await? {
                debug!(request_id = %item.request_id, "not promoting node of cancelled request");
                return Ok(());
            }
            // A node cancelled while parked must stay cancelled.
            if req
                .state(&item.node_id)
                .await?
                .is_some_and(crate::api::NodeState::is_terminal)
            {
                debug!(node_id = %item.node_id, "not promoting terminal node");
                return Ok(());
            }
            req.transition(&item.node_id, NodeState::Ready, "node ready")
                .await?;
        }
        debug!(request_id = %item.request_id, node_id = %item.node_id, "promoting delayed node");
        self.broker
            .push_back(keys::EXEC_QUEUE, item.encode())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{NodeSpec, Pipeline, CONSTANT_API};
    use crate::broker::{Broker, MemoryBroker};
    use serde_json::json;

    #[tokio::test]
    async fn promotes_due_entries_only() {
        let broker = MemoryBroker::shared();
        let pipeline = Pipeline::new(vec![
            NodeSpec::new("x", CONSTANT_API).with_params(json!({"value": 1}))
        ]);
        let req = RequestHandle::create(broker.clone(), "r1".to_string(), &pipeline)
            .await
            .unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        req.schedule_at(&"x".to_string(), now - 10).await.unwrap();
        req.schedule_at(&"x".to_string(), now + 60_000).await.unwrap();

        let scheduler = Scheduler::new(broker.clone(), SiteConfig::builtin("test"));
        let idle = scheduler.pass().await.unwrap();

        // One entry moved, the future one stayed behind.
        assert_eq!(broker.list_len(keys::EXEC_QUEUE).await.unwrap(), 1);
        assert!(broker
            .zpeek_min(keys::SCHED_DELAYED)
            .await
            .unwrap()
            .is_some());
        assert!(idle > Duration::from_secs(30));
        assert_eq!(
            req.state(&"x".to_string()).await.unwrap(),
            Some(NodeState::Ready)
        );
    }

    #[tokio::test]
    async fn duplicate_moves_are_idempotent() {
        let broker = MemoryBroker::shared();
        let scheduler = Scheduler::new(broker.clone(), SiteConfig::builtin("test"));
        let item = WorkItem::new("r2".to_string(), "x".to_string());
        scheduler.promote(&item.encode()).await.unwrap();
        scheduler.promote(&item.encode()).await.unwrap();
        assert_eq!(broker.list_len(keys::EXEC_QUEUE).await.unwrap(), 1);
    }
}
