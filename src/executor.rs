//! The execution service: a pool of cooperative workers pulling ready nodes
//! off the execution queue, running their adapters, persisting values into
//! the cache, routing them downstream, and driving the per-node state
//! machine. All coordination state lives in the broker; a worker holds
//! nothing a crash could lose beyond its in-flight node, which is protected
//! by an expiring claim.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterCtx, AdapterError, Deferral, Inputs, PortItem, ValueStream};
use crate::api::response::ErrorKind;
use crate::api::{self, Arity, NodeId, NodeSpec, NodeState, Pipeline};
use crate::blob::{LocalBlobStore, SharedBlobStore};
use crate::broker::{keys, Broker, BrokerError, SharedBroker, WorkItem};
use crate::cache::{BuildHandle, CacheError, Lookup, ValueCache};
use crate::config::{ConfigError, SiteConfig};
use crate::fingerprint::{self, Fingerprint};
use crate::pipeline;
use crate::provider::{AdapterRegistry, Dispatch};
use crate::request::RequestHandle;

#[derive(Debug)]
pub enum RuntimeError {
    Broker(BrokerError),
    Cache(CacheError),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Broker(e) => write!(f, "{e}"),
            RuntimeError::Cache(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<BrokerError> for RuntimeError {
    fn from(e: BrokerError) -> Self {
        RuntimeError::Broker(e)
    }
}

impl From<CacheError> for RuntimeError {
    fn from(e: CacheError) -> Self {
        RuntimeError::Cache(e)
    }
}

/// Checks whether a node's preconditions are met and, exactly once, moves it
/// to READY and onto the execution queue (or the delayed queue when its
/// `not_before` lies in the future). Safe to call from any service on any
/// event; the queued claim makes it idempotent.
pub async fn enqueue_if_ready(
    broker: &SharedBroker,
    req: &RequestHandle,
    pipeline: &Pipeline,
    node_id: &NodeId,
    queued_ttl: Duration,
) -> Result<bool, BrokerError> {
    let Some(node) = pipeline.get(node_id) else {
        return Ok(false);
    };
    if req.state(node_id).await? != Some(NodeState::Pending) {
        return Ok(false);
    }
    for predecessor in &node.after {
        let terminal = req
            .state(predecessor)
            .await?
            .is_some_and(NodeState::is_terminal);
        if !terminal {
            return Ok(false);
        }
    }
    let arity = api::lookup(&node.api_class).map(|s| s.arity);
    match arity {
        Some(Arity::Unary) => {
            // A unary consumer starts as soon as its upstream produced
            // anything, or closed empty.
            let seen = req.seen_count(node_id, 0).await?;
            if seen < 1 && !req.input_closed(node_id, 0).await? {
                return Ok(false);
            }
        }
        Some(Arity::NAry) => {
            for port in 0..node.inputs.len() {
                if !req.input_closed(node_id, port).await? {
                    return Ok(false);
                }
            }
        }
        _ => {}
    }
    let claimed = broker
        .set_nx_ex(
            &keys::queued(req.request_id(), node_id),
            "1".to_string(),
            queued_ttl,
        )
        .await?;
    if !claimed {
        return Ok(false);
    }
    let now = chrono::Utc::now();
    if let Some(not_before) = node.not_before {
        if not_before > now {
            debug!(node_id = %node_id, %not_before, "routing node through delayed queue");
            req.schedule_at(node_id, not_before.timestamp_millis()).await?;
            return Ok(true);
        }
    }
    req.transition(node_id, NodeState::Ready, "node ready").await?;
    req.enqueue_now(node_id).await?;
    Ok(true)
}

enum Outcome {
    Completed { yielded: usize },
    Deferred(Deferral),
    Cancelled,
    TimedOut,
}

pub struct Executor {
    broker: SharedBroker,
    cache: ValueCache,
    dispatch: Dispatch,
    site: Arc<SiteConfig>,
}

/// Running worker pool; shut down to stop draining the queue.
pub struct ExecutorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl ExecutorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

impl Executor {
    pub fn new(
        broker: SharedBroker,
        site: SiteConfig,
        registry: AdapterRegistry,
    ) -> Result<Self, ConfigError> {
        let dispatch = Dispatch::new(&site, registry)?;
        let blobs: Option<SharedBlobStore> = site
            .cache
            .blob_root
            .as_ref()
            .map(|root| Arc::new(LocalBlobStore::new(root)) as SharedBlobStore);
        // Builder locks must outlive the longest node run.
        let lock_ttl = site.node_timeout() + Duration::from_secs(60);
        let cache = ValueCache::new(
            broker.clone(),
            blobs,
            site.cache.byte_budget,
            site.cache.inline_limit,
            lock_ttl,
        );
        Ok(Executor {
            broker,
            cache,
            dispatch,
            site: Arc::new(site),
        })
    }

    #[must_use]
    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }

    #[must_use]
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Spawns the worker pool.
    #[must_use]
    pub fn start(self: &Arc<Self>, workers: usize) -> ExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = (0..workers)
            .map(|worker| {
                let executor = Arc::clone(self);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    executor.worker_loop(worker, shutdown).await;
                })
            })
            .collect();
        ExecutorHandle {
            shutdown: shutdown_tx,
            workers: handles,
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, shutdown: watch::Receiver<bool>) {
        info!(worker, "executor worker started");
        let mut consecutive_errors: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let popped = self
                .broker
                .pop_front(keys::EXEC_QUEUE, Duration::from_secs(1))
                .await;
            let raw = match popped {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    consecutive_errors = 0;
                    continue;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = self.site.retry_backoff() * 2u32.pow(consecutive_errors.min(6));
                    warn!(worker, "queue pop failed ({e}), backing off {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };
            consecutive_errors = 0;
            let item = match WorkItem::decode(&raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!(worker, "dropping unreadable work item: {e}");
                    continue;
                }
            };
            self.handle_item(item).await;
        }
        info!(worker, "executor worker stopped");
    }

    /// Runs one queue entry, retrying whole-item on transient broker
    /// trouble, and converting a spent retry budget into node failure.
    async fn handle_item(self: &Arc<Self>, item: WorkItem) {
        let mut last_error = None;
        for attempt in 0..=self.site.broker_retries {
            match self.process_item(&item).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        request_id = %item.request_id,
                        node_id = %item.node_id,
                        attempt,
                        "work item failed: {e}"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(self.site.retry_backoff() * (attempt + 1)).await;
                }
            }
        }
        // Retry budget spent; surface INTERNAL on a best-effort basis.
        if let Some(e) = last_error {
            if let Ok(Some(req)) = RequestHandle::load(self.broker.clone(), &item.request_id).await
            {
                let _ = req
                    .send_error(&item.node_id, ErrorKind::Internal, e.to_string(), None)
                    .await;
                let _ = req.set_state(&item.node_id, NodeState::Failed).await;
                if let Ok(pipeline) = req.pipeline().await {
                    let _ = self
                        .cascade_cancel(&req, &pipeline, &item.node_id, "failed")
                        .await;
                }
            }
        }
    }

    async fn process_item(self: &Arc<Self>, item: &WorkItem) -> Result<(), RuntimeError> {
        let Some(req) = RequestHandle::load(self.broker.clone(), &item.request_id).await? else {
            debug!(request_id = %item.request_id, "work item for unknown request, dropping");
            return Ok(());
        };
        self.ensure_heartbeat(&req).await?;

        let pipeline = req.pipeline().await?;
        if req.is_cancelled().await? {
            self.sweep_cancelled(&req, &pipeline, "request cancelled").await?;
            return Ok(());
        }
        if req.age().await? > self.site.request_timeout() {
            req.cancel().await?;
            self.sweep_cancelled(&req, &pipeline, "request timed out").await?;
            return Ok(());
        }
        let Some(node) = pipeline.get(&item.node_id).cloned() else {
            debug!(node_id = %item.node_id, "work item for unknown node, dropping");
            return Ok(());
        };
        if req
            .state(&item.node_id)
            .await?
            .is_some_and(NodeState::is_terminal)
        {
            // Drained duplicate, or cancelled while queued.
            return Ok(());
        }
        let claim = keys::exec_claim(req.request_id(), &item.node_id);
        let claim_ttl = self.site.node_timeout() + Duration::from_secs(30);
        if !self
            .broker
            .set_nx_ex(&claim, item.run_id.clone(), claim_ttl)
            .await?
        {
            debug!(node_id = %item.node_id, "node already claimed by another worker");
            return Ok(());
        }
        let result = self.run_node(&req, &pipeline, &node).await;
        self.broker.del(&claim).await?;
        result
    }

    async fn run_node(
        self: &Arc<Self>,
        req: &RequestHandle,
        pipeline: &Pipeline,
        node: &NodeSpec,
    ) -> Result<(), RuntimeError> {
        req.transition(&node.node_id, NodeState::Running, "node started")
            .await?;
        let fp = self.fingerprint_of(req, pipeline, node).await?;

        let mut attempt: u32 = 0;
        loop {
            match self.obtain(&fp, node.force_compute).await? {
                Obtained::Replay(values) => {
                    debug!(node_id = %node.node_id, n = values.len(), "cache hit, replaying sealed stream");
                    for value in &values {
                        self.deliver(req, pipeline, node, value).await?;
                    }
                    self.finish_completed(req, pipeline, node).await?;
                    return Ok(());
                }
                Obtained::Build(mut build) => {
                    match self.attempt(req, pipeline, node, &mut build).await {
                        Ok(Outcome::Completed { yielded }) => {
                            if let Some(handle) = build {
                                handle.seal().await?;
                            }
                            debug!(node_id = %node.node_id, yielded, "adapter completed");
                            self.finish_completed(req, pipeline, node).await?;
                            return Ok(());
                        }
                        Ok(Outcome::Deferred(deferral)) => {
                            if let Some(handle) = build {
                                handle.abandon().await?;
                            }
                            self.defer(req, node, deferral).await?;
                            return Ok(());
                        }
                        Ok(Outcome::Cancelled) => {
                            if let Some(handle) = build {
                                handle.abandon().await?;
                            }
                            self.sweep_cancelled(req, pipeline, "request cancelled").await?;
                            return Ok(());
                        }
                        Ok(Outcome::TimedOut) => {
                            if let Some(handle) = build {
                                handle.abandon().await?;
                            }
                            self.time_out(req, pipeline, node).await?;
                            return Ok(());
                        }
                        Err(e) if e.is_retryable() && attempt < self.site.upstream_retries => {
                            if let Some(handle) = build {
                                handle.abandon().await?;
                            }
                            attempt += 1;
                            let backoff = self.site.retry_backoff() * 2u32.pow(attempt.min(6));
                            warn!(node_id = %node.node_id, attempt, "retrying after {e} in {backoff:?}");
                            tokio::time::sleep(backoff).await;
                        }
                        Err(e) => {
                            if let Some(handle) = build {
                                handle.abandon().await?;
                            }
                            self.fail(req, pipeline, node, &e).await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Memoized by Process at submission; recomputed only for records from
    /// older writers.
    async fn fingerprint_of(
        &self,
        req: &RequestHandle,
        pipeline: &Pipeline,
        node: &NodeSpec,
    ) -> Result<Fingerprint, RuntimeError> {
        if let Some(fp) = req.fingerprint(&node.node_id).await? {
            return Ok(fp);
        }
        let fps = fingerprint::pipeline_fingerprints(pipeline).map_err(|e| {
            RuntimeError::Broker(BrokerError::Corrupt(format!("unfingerprintable pipeline: {e}")))
        })?;
        let fp = fps[&node.node_id].clone();
        req.set_fingerprint(&node.node_id, &fp).await?;
        Ok(fp)
    }

    async fn obtain(&self, fp: &Fingerprint, force: bool) -> Result<Obtained, CacheError> {
        if force {
            // Lookups are skipped, but fresh values may still be recorded if
            // nobody has sealed this fingerprint yet.
            return Ok(match self.cache.begin(fp).await? {
                Lookup::Build(handle) => Obtained::Build(Some(handle)),
                Lookup::Sealed(_) | Lookup::Pending => Obtained::Build(None),
            });
        }
        for _ in 0..2 {
            match self.cache.begin(fp).await? {
                Lookup::Sealed(values) => return Ok(Obtained::Replay(values)),
                Lookup::Build(handle) => return Ok(Obtained::Build(Some(handle))),
                Lookup::Pending => {
                    if let Some(values) =
                        self.cache.wait_sealed(fp, self.site.node_timeout()).await?
                    {
                        return Ok(Obtained::Replay(values));
                    }
                    // Builder died without sealing; race for the lock again.
                }
            }
        }
        Ok(Obtained::Build(None))
    }

    /// One pass through the adapter body: spawn the producer, pump its
    /// values, watch for cancellation and the soft timeout.
    async fn attempt(
        self: &Arc<Self>,
        req: &RequestHandle,
        pipeline: &Pipeline,
        node: &NodeSpec,
        build: &mut Option<BuildHandle>,
    ) -> Result<Outcome, AdapterError> {
        let resolved = self
            .dispatch
            .resolve(&node.provider, &node.api_class, &node.params)?;
        let continuation = req
            .continuation(&node.node_id)
            .await
            .map_err(|e| AdapterError::Internal(e.to_string()))?;

        let (tx, mut rx) = mpsc::channel::<Value>(16);
        let (ctx, deferral_slot) = AdapterCtx::new(
            req.clone(),
            node.node_id.clone(),
            resolved.provider,
            continuation,
            tx,
        );
        let inputs = self.wire_inputs(req, node);
        let adapter = resolved.adapter;
        let producer = tokio::spawn(async move { adapter.body(&ctx, inputs).await });

        let deadline = tokio::time::Instant::now() + self.site.node_timeout();
        let mut poll = tokio::time::interval(Duration::from_millis(250));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut yielded: usize = 0;
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(value) => {
                        if let Some(handle) = build.as_mut() {
                            handle
                                .put(yielded, &value)
                                .await
                                .map_err(|e| AdapterError::Internal(e.to_string()))?;
                        }
                        self.deliver(req, pipeline, node, &value)
                            .await
                            .map_err(|e| AdapterError::Internal(e.to_string()))?;
                        yielded += 1;
                    }
                    None => {
                        // Producer finished; its result decides the outcome.
                        let body_result = producer
                            .await
                            .map_err(|e| AdapterError::Internal(format!("adapter task died: {e}")))?;
                        body_result?;
                        let deferral = deferral_slot.lock().await.take();
                        return Ok(match deferral {
                            Some(deferral) => Outcome::Deferred(deferral),
                            None => Outcome::Completed { yielded },
                        });
                    }
                },
                _ = poll.tick() => {
                    let cancelled = req
                        .is_cancelled()
                        .await
                        .map_err(|e| AdapterError::Internal(e.to_string()))?;
                    if cancelled {
                        producer.abort();
                        return Ok(Outcome::Cancelled);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        producer.abort();
                        return Ok(Outcome::TimedOut);
                    }
                }
            }
        }
    }

    fn wire_inputs(&self, req: &RequestHandle, node: &NodeSpec) -> Inputs {
        let arity = api::lookup(&node.api_class).map(|s| s.arity);
        match arity {
            Some(Arity::Unary) => Inputs::One(ValueStream::new(
                self.broker.clone(),
                req.request_id(),
                &node.node_id,
                0,
            )),
            Some(Arity::NAry) => Inputs::Many(
                (0..node.inputs.len())
                    .map(|port| {
                        ValueStream::new(self.broker.clone(), req.request_id(), &node.node_id, port)
                    })
                    .collect(),
            ),
            _ => Inputs::None,
        }
    }

    /// Routes one yielded value: client response if the node is an output,
    /// then every consumer's input port, waking consumers that just became
    /// runnable.
    async fn deliver(
        &self,
        req: &RequestHandle,
        pipeline: &Pipeline,
        node: &NodeSpec,
        value: &Value,
    ) -> Result<(), BrokerError> {
        if node.is_output {
            req.send_value(&node.node_id, value.clone()).await?;
        }
        let consumers = pipeline::consumers(pipeline);
        if let Some(ports) = consumers.get(&node.node_id) {
            for (consumer, port) in ports {
                self.broker
                    .push_back(
                        &keys::input(req.request_id(), consumer, *port),
                        PortItem::Value { v: value.clone() }.encode(),
                    )
                    .await?;
                let seen = req.record_input(consumer, *port).await?;
                if seen == 1 {
                    enqueue_if_ready(
                        &self.broker,
                        req,
                        pipeline,
                        consumer,
                        self.site.request_timeout(),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Terminal bookkeeping for a successful node: close consumer ports,
    /// mark COMPLETED, wake whatever became runnable.
    async fn finish_completed(
        &self,
        req: &RequestHandle,
        pipeline: &Pipeline,
        node: &NodeSpec,
    ) -> Result<(), RuntimeError> {
        req.clear_continuation(&node.node_id).await?;
        let consumers = pipeline::consumers(pipeline);
        req.transition(&node.node_id, NodeState::Completed, "node completed")
            .await?;
        if let Some(ports) = consumers.get(&node.node_id) {
            for (consumer, port) in ports {
                self.broker
                    .push_back(
                        &keys::input(req.request_id(), consumer, *port),
                        PortItem::End.encode(),
                    )
                    .await?;
                req.mark_input_closed(consumer, *port).await?;
                enqueue_if_ready(
                    &self.broker,
                    req,
                    pipeline,
                    consumer,
                    self.site.request_timeout(),
                )
                .await?;
            }
        }
        for dependent in pipeline::after_dependents(pipeline, &node.node_id) {
            enqueue_if_ready(
                &self.broker,
                req,
                pipeline,
                &dependent,
                self.site.request_timeout(),
            )
            .await?;
        }
        Ok(())
    }

    /// Parks a node that asked for a delayed re-activation. No status is
    /// emitted here; the scheduler announces READY when the time comes.
    async fn defer(
        &self,
        req: &RequestHandle,
        node: &NodeSpec,
        deferral: Deferral,
    ) -> Result<(), RuntimeError> {
        debug!(node_id = %node.node_id, delay = ?deferral.delay, "node deferred");
        req.set_continuation(&node.node_id, &deferral.continuation).await?;
        req.set_state(&node.node_id, NodeState::Ready).await?;
        let at = chrono::Utc::now().timestamp_millis() + deferral.delay.as_millis() as i64;
        req.schedule_at(&node.node_id, at).await?;
        Ok(())
    }

    async fn fail(
        &self,
        req: &RequestHandle,
        pipeline: &Pipeline,
        node: &NodeSpec,
        error: &AdapterError,
    ) -> Result<(), RuntimeError> {
        warn!(node_id = %node.node_id, "node failed: {error}");
        req.send_error(&node.node_id, error.kind(), error.to_string(), None)
            .await?;
        req.set_state(&node.node_id, NodeState::Failed).await?;
        self.cascade_cancel(req, pipeline, &node.node_id, "failed").await?;
        Ok(())
    }

    async fn time_out(
        &self,
        req: &RequestHandle,
        pipeline: &Pipeline,
        node: &NodeSpec,
    ) -> Result<(), RuntimeError> {
        warn!(node_id = %node.node_id, "node timed out");
        // The status transition is the state change callers watch for; it
        // goes out first, the error detail after, matching the status-first
        // shape of every other cancellation path.
        req.transition(&node.node_id, NodeState::Cancelled, "node timed out")
            .await?;
        req.send_error(
            &node.node_id,
            ErrorKind::Cancelled,
            format!("node timed out after {:?}", self.site.node_timeout()),
            None,
        )
        .await?;
        self.cascade_cancel(req, pipeline, &node.node_id, "timed out").await?;
        Ok(())
    }

    /// Cancels everything downstream of `origin`. Siblings keep running.
    async fn cascade_cancel(
        &self,
        req: &RequestHandle,
        pipeline: &Pipeline,
        origin: &NodeId,
        reason: &str,
    ) -> Result<(), RuntimeError> {
        for dependent in pipeline::transitive_dependents(pipeline, origin) {
            let state = req.state(&dependent).await?;
            if state.is_some_and(NodeState::is_terminal) {
                continue;
            }
            req.transition(
                &dependent,
                NodeState::Cancelled,
                format!("cancelled: upstream {origin} {reason}"),
            )
            .await?;
            self.abort_ports(req, pipeline, &dependent).await?;
        }
        Ok(())
    }

    /// Marks every non-terminal node CANCELLED. Used for explicit cancel and
    /// the request hard timeout.
    async fn sweep_cancelled(
        &self,
        req: &RequestHandle,
        pipeline: &Pipeline,
        reason: &str,
    ) -> Result<(), RuntimeError> {
        for node in &pipeline.nodes {
            let state = req.state(&node.node_id).await?;
            if state.is_some_and(NodeState::is_terminal) {
                continue;
            }
            req.transition(&node.node_id, NodeState::Cancelled, reason).await?;
            self.abort_ports(req, pipeline, &node.node_id).await?;
        }
        Ok(())
    }

    /// Unblocks a consumer that may be mid-stream on its input ports.
    async fn abort_ports(
        &self,
        req: &RequestHandle,
        pipeline: &Pipeline,
        node_id: &NodeId,
    ) -> Result<(), RuntimeError> {
        if let Some(node) = pipeline.get(node_id) {
            for port in 0..node.inputs.len() {
                self.broker
                    .push_back(
                        &keys::input(req.request_id(), node_id, port),
                        PortItem::Abort.encode(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Starts the request's heartbeat producer if no executor in the cluster
    /// runs one yet. One producer per request, not per node, to bound
    /// response-queue pressure.
    async fn ensure_heartbeat(self: &Arc<Self>, req: &RequestHandle) -> Result<(), RuntimeError> {
        let claim = keys::heartbeat_claim(req.request_id());
        let interval = self.site.heartbeat_interval();
        let ttl = interval * 3;
        if !self
            .broker
            .set_nx_ex(&claim, "heartbeat".to_string(), ttl)
            .await?
        {
            return Ok(());
        }
        let executor = Arc::clone(self);
        let req = req.clone();
        tokio::spawn(async move {
            debug!(request_id = %req.request_id(), "heartbeat producer started");
            loop {
                tokio::time::sleep(interval).await;
                if executor.broker.expire(&claim, ttl).await.is_err() {
                    continue;
                }
                let Ok(states) = req.states().await else { continue };
                if states.is_empty() || states.values().all(|s| s.is_terminal()) {
                    let _ = executor.broker.del(&claim).await;
                    break;
                }
                match req.is_cancelled().await {
                    Ok(true) => {
                        if let Ok(pipeline) = req.pipeline().await {
                            let _ = executor
                                .sweep_cancelled(&req, &pipeline, "request cancelled")
                                .await;
                        }
                        continue;
                    }
                    Ok(false) => {}
                    Err(_) => continue,
                }
                if let Ok(age) = req.age().await {
                    if age > executor.site.request_timeout() {
                        let _ = req.cancel().await;
                        if let Ok(pipeline) = req.pipeline().await {
                            let _ = executor
                                .sweep_cancelled(&req, &pipeline, "request timed out")
                                .await;
                        }
                        continue;
                    }
                }
                let live = states
                    .values()
                    .any(|s| matches!(s, NodeState::Ready | NodeState::Running));
                if live {
                    let _ = req.send_heartbeat().await;
                }
            }
            debug!(request_id = %req.request_id(), "heartbeat producer stopped");
        });
        Ok(())
    }
}

enum Obtained {
    Replay(Vec<Value>),
    /// Run the adapter; `Some` when this worker owns the cache build.
    Build(Option<BuildHandle>),
}
