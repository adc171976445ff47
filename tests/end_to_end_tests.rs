//! End-to-end scenarios: all three services running in-process against the
//! in-memory broker, driven through the same submit/poll functions the HTTP
//! surface uses.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use conflux::api::response::{Response, ResponseBody};
use conflux::api::{NodeSpec, NodeState, Pipeline, CONSTANT_API};
use conflux::broker::{MemoryBroker, SharedBroker};
use conflux::config::SiteConfig;
use conflux::executor::{Executor, ExecutorHandle};
use conflux::process::{cancel_request, poll_responses, submit_pipeline};
use conflux::provider::AdapterRegistry;
use conflux::request::RequestHandle;
use conflux::scheduler::{Scheduler, SchedulerHandle};

fn test_site() -> SiteConfig {
    let mut site = SiteConfig::builtin("test-site");
    site.heartbeat_interval_ms = 200;
    site.retry_backoff_ms = 50;
    site.upstream_retries = 1;
    site
}

struct Services {
    executor: ExecutorHandle,
    scheduler: SchedulerHandle,
}

async fn start_services(
    broker: &SharedBroker,
    site: &SiteConfig,
    registry: AdapterRegistry,
) -> Services {
    let executor =
        Arc::new(Executor::new(broker.clone(), site.clone(), registry).expect("valid site"));
    Services {
        executor: executor.start(4),
        scheduler: Scheduler::new(broker.clone(), site.clone()).start(),
    }
}

impl Services {
    async fn stop(self) {
        self.executor.shutdown().await;
        self.scheduler.shutdown().await;
    }
}

/// Polls until every named node reached a terminal status, returning all
/// non-heartbeat responses in queue order.
async fn drain_until_terminal(
    broker: &SharedBroker,
    request_id: &String,
    stops: &[&str],
    patience: Duration,
) -> Vec<Response> {
    let mut remaining: HashSet<String> = stops.iter().map(|s| s.to_string()).collect();
    let deadline = Instant::now() + patience;
    let mut all = Vec::new();
    while !remaining.is_empty() && Instant::now() < deadline {
        let batch = poll_responses(broker, request_id, 100, Duration::from_millis(300))
            .await
            .expect("request exists");
        for response in batch {
            if let (Some(node_id), Some(_)) = (&response.node_id, response.terminal_state()) {
                remaining.remove(node_id);
            }
            if !response.is_heartbeat() {
                all.push(response);
            }
        }
    }
    assert!(
        remaining.is_empty(),
        "nodes never became terminal: {remaining:?}; saw {all:#?}"
    );
    all
}

/// Compact "node:event" rendering used for order assertions.
fn tag(response: &Response) -> String {
    let node = response.node_id.as_deref().unwrap_or("-");
    match &response.body {
        ResponseBody::Value { value } => format!("{node}:value({value})"),
        ResponseBody::Status { state, .. } => format!("{node}:{state}"),
        ResponseBody::Heartbeat {} => format!("{node}:heartbeat"),
        ResponseBody::Error { error_kind, .. } => format!("{node}:error({error_kind})"),
    }
}

#[tokio::test]
async fn smoke_constant_then_signal() {
    let broker = MemoryBroker::shared();
    let site = test_site();
    let services = start_services(&broker, &site, AdapterRegistry::builtin()).await;

    let pipeline = Pipeline::new(vec![
        NodeSpec::new("c", CONSTANT_API)
            .with_params(json!({"value": 42}))
            .output(),
        NodeSpec::new("done", "dfm.api.dfm.SignalClient")
            .with_params(json!({"message": "ok"}))
            .with_after(["c"])
            .output(),
    ]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses =
        drain_until_terminal(&broker, &request_id, &["done"], Duration::from_secs(10)).await;

    let tags: Vec<String> = responses.iter().map(tag).collect();
    assert_eq!(
        tags,
        vec![
            "c:READY",
            "c:RUNNING",
            "c:value(42)",
            "c:COMPLETED",
            "done:READY",
            "done:RUNNING",
            "done:value(\"ok\")",
            "done:COMPLETED",
        ],
        "unexpected response order"
    );

    services.stop().await;
}

#[tokio::test]
async fn after_edge_orders_statuses() {
    let broker = MemoryBroker::shared();
    let site = test_site();
    let services = start_services(&broker, &site, AdapterRegistry::builtin()).await;

    let pipeline = Pipeline::new(vec![
        NodeSpec::new("first", "dfm.api.testing.Sleepy")
            .with_params(json!({"sleep_ms": 100}))
            .output(),
        NodeSpec::new("second", "dfm.api.dfm.SignalClient")
            .with_params(json!({"message": "later"}))
            .with_after(["first"]),
    ]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses =
        drain_until_terminal(&broker, &request_id, &["second"], Duration::from_secs(10)).await;
    let tags: Vec<String> = responses.iter().map(tag).collect();

    let first_terminal = tags.iter().position(|t| t == "first:COMPLETED").unwrap();
    let second_running = tags.iter().position(|t| t == "second:RUNNING").unwrap();
    assert!(
        first_terminal < second_running,
        "predecessor statuses must precede dependent RUNNING: {tags:?}"
    );

    services.stop().await;
}

#[tokio::test]
async fn streaming_values_square_in_order() {
    let broker = MemoryBroker::shared();
    let site = test_site();
    let services = start_services(&broker, &site, AdapterRegistry::builtin()).await;

    let pipeline = Pipeline::new(vec![
        NodeSpec::new("up", "dfm.api.testing.EmitSeries")
            .with_params(json!({"count": 5, "interval_ms": 30})),
        NodeSpec::new("down", "dfm.api.testing.Square")
            .with_inputs(["up"])
            .output(),
    ]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses =
        drain_until_terminal(&broker, &request_id, &["down"], Duration::from_secs(10)).await;

    let values: Vec<i64> = responses
        .iter()
        .filter(|r| r.node_id.as_deref() == Some("down"))
        .filter_map(|r| match &r.body {
            ResponseBody::Value { value } => value.as_i64(),
            _ => None,
        })
        .collect();
    assert_eq!(values, vec![1, 4, 9, 16, 25]);

    services.stop().await;
}

#[tokio::test]
async fn zip2_waits_for_both_streams() {
    let broker = MemoryBroker::shared();
    let site = test_site();
    let services = start_services(&broker, &site, AdapterRegistry::builtin()).await;

    let pipeline = Pipeline::new(vec![
        NodeSpec::new("a", "dfm.api.testing.EmitSeries").with_params(json!({"count": 3})),
        NodeSpec::new("b", "dfm.api.testing.EmitSeries")
            .with_params(json!({"count": 3, "start": 10})),
        NodeSpec::new("z", "dfm.api.dfm.Zip2")
            .with_inputs(["a", "b"])
            .output(),
    ]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses =
        drain_until_terminal(&broker, &request_id, &["z"], Duration::from_secs(10)).await;

    let values: Vec<serde_json::Value> = responses
        .iter()
        .filter(|r| r.node_id.as_deref() == Some("z"))
        .filter_map(|r| match &r.body {
            ResponseBody::Value { value } => Some(value.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(values, vec![json!([1, 10]), json!([2, 11]), json!([3, 12])]);

    services.stop().await;
}

#[tokio::test]
async fn failure_cascades_to_dependents_only() {
    let broker = MemoryBroker::shared();
    let site = test_site();
    let services = start_services(&broker, &site, AdapterRegistry::builtin()).await;

    let pipeline = Pipeline::new(vec![
        NodeSpec::new("a", "dfm.api.testing.Sleepy").with_params(
            json!({"sleep_ms": 10, "fail": true, "fail_kind": "upstream_unavailable"}),
        ),
        NodeSpec::new("b", "dfm.api.testing.Square").with_inputs(["a"]),
        NodeSpec::new("c", "dfm.api.testing.Square").with_inputs(["a"]),
        NodeSpec::new("d", "dfm.api.dfm.SignalClient")
            .with_params(json!({"message": "never"}))
            .with_after(["b"]),
        // An unrelated sibling keeps running to completion.
        NodeSpec::new("lone", "dfm.api.dfm.GreetMe")
            .with_params(json!({"name": "sibling"}))
            .output(),
    ]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses = drain_until_terminal(
        &broker,
        &request_id,
        &["a", "b", "c", "d", "lone"],
        Duration::from_secs(10),
    )
    .await;
    let tags: Vec<String> = responses.iter().map(tag).collect();

    let error_at = tags
        .iter()
        .position(|t| t == "a:error(UPSTREAM_UNAVAILABLE)")
        .unwrap_or_else(|| panic!("no upstream error: {tags:?}"));
    for node in ["b", "c", "d"] {
        let cancelled_at = tags
            .iter()
            .position(|t| t == &format!("{node}:CANCELLED"))
            .unwrap_or_else(|| panic!("{node} was not cancelled: {tags:?}"));
        assert!(error_at < cancelled_at, "error must precede cascade");
        assert!(
            !tags.iter().any(|t| t.starts_with(&format!("{node}:value"))),
            "{node} must not produce values"
        );
    }
    assert!(
        tags.contains(&"lone:COMPLETED".to_string()),
        "sibling subgraph must keep running: {tags:?}"
    );

    services.stop().await;
}

#[tokio::test]
async fn bad_input_fails_without_retry_delay() {
    let broker = MemoryBroker::shared();
    let site = test_site();
    let services = start_services(&broker, &site, AdapterRegistry::builtin()).await;

    let pipeline = Pipeline::new(vec![NodeSpec::new("x", "dfm.api.testing.Sleepy")
        .with_params(json!({"fail": true, "fail_kind": "bad_input"}))
        .output()]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses =
        drain_until_terminal(&broker, &request_id, &["x"], Duration::from_secs(10)).await;
    let tags: Vec<String> = responses.iter().map(tag).collect();
    assert!(
        tags.contains(&"x:error(ADAPTER_BAD_INPUT)".to_string()),
        "expected bad-input error: {tags:?}"
    );

    services.stop().await;
}

#[tokio::test]
async fn cache_hit_replays_without_invoking_adapter() {
    let broker = MemoryBroker::shared();
    let site = test_site();

    // Counts instantiations at the adapter boundary.
    let loads = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut registry = AdapterRegistry::builtin();
    {
        let loads = Arc::clone(&loads);
        registry.register_factory("load_model_data", move |config, params| {
            loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            use conflux::adapter::Adapter;
            conflux::adapters::load_model_data::LoadModelData::configure(config, params)
                .map(|a| Arc::new(a) as Arc<dyn Adapter>)
        });
    }
    let services = start_services(&broker, &site, registry).await;

    let make_pipeline = || {
        Pipeline::new(vec![NodeSpec::new("load", "dfm.api.data_loader.LoadModelData")
            .with_params(json!({"time": "2024-01-01T00:00", "frames": 3, "delay_ms": 150}))
            .output()])
    };

    let extract = |responses: &[Response]| -> Vec<serde_json::Value> {
        responses
            .iter()
            .filter_map(|r| match &r.body {
                ResponseBody::Value { value } => Some(value.clone()),
                _ => None,
            })
            .collect()
    };

    let first_id = submit_pipeline(&broker, &site, make_pipeline()).await.unwrap();
    let started = Instant::now();
    let first =
        drain_until_terminal(&broker, &first_id, &["load"], Duration::from_secs(10)).await;
    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "first run must actually load"
    );

    let second_id = submit_pipeline(&broker, &site, make_pipeline()).await.unwrap();
    let second =
        drain_until_terminal(&broker, &second_id, &["load"], Duration::from_secs(10)).await;

    let first_values = extract(&first);
    let second_values = extract(&second);
    assert_eq!(first_values.len(), 3);
    assert_eq!(first_values, second_values, "replay must preserve order");
    assert_eq!(
        loads.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "second run must be served from the cache"
    );

    // Same node identity means same fingerprint across requests.
    let fp1 = RequestHandle::load(broker.clone(), &first_id)
        .await
        .unwrap()
        .unwrap()
        .fingerprint(&"load".to_string())
        .await
        .unwrap();
    let fp2 = RequestHandle::load(broker.clone(), &second_id)
        .await
        .unwrap()
        .unwrap()
        .fingerprint(&"load".to_string())
        .await
        .unwrap();
    assert_eq!(fp1, fp2);
    assert!(fp1.is_some());

    services.stop().await;
}

#[tokio::test]
async fn force_compute_skips_cache_lookup() {
    let broker = MemoryBroker::shared();
    let site = test_site();

    let loads = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut registry = AdapterRegistry::builtin();
    {
        let loads = Arc::clone(&loads);
        registry.register_factory("load_model_data", move |config, params| {
            loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            use conflux::adapter::Adapter;
            conflux::adapters::load_model_data::LoadModelData::configure(config, params)
                .map(|a| Arc::new(a) as Arc<dyn Adapter>)
        });
    }
    let services = start_services(&broker, &site, registry).await;

    let make_pipeline = |force: bool| {
        let mut node = NodeSpec::new("load", "dfm.api.data_loader.LoadModelData")
            .with_params(json!({"time": "2024-02-02T00:00"}))
            .output();
        if force {
            node = node.forced();
        }
        Pipeline::new(vec![node])
    };

    let first = submit_pipeline(&broker, &site, make_pipeline(false)).await.unwrap();
    drain_until_terminal(&broker, &first, &["load"], Duration::from_secs(10)).await;
    let second = submit_pipeline(&broker, &site, make_pipeline(true)).await.unwrap();
    drain_until_terminal(&broker, &second, &["load"], Duration::from_secs(10)).await;

    assert_eq!(
        loads.load(std::sync::atomic::Ordering::SeqCst),
        2,
        "force_compute must bypass the cache lookup"
    );

    services.stop().await;
}

#[tokio::test]
async fn delayed_scheduling_resumes_with_continuation() {
    use async_trait::async_trait;
    use conflux::adapter::{Adapter, AdapterCtx, AdapterError, Inputs};

    /// Defers itself once, then yields on the second activation.
    struct DeferredHello;

    #[async_trait]
    impl Adapter for DeferredHello {
        fn configure(
            _config: &serde_json::Value,
            _params: &serde_json::Value,
        ) -> Result<Self, AdapterError> {
            Ok(DeferredHello)
        }

        async fn body(&self, ctx: &AdapterCtx, _inputs: Inputs) -> Result<(), AdapterError> {
            match ctx.continuation() {
                Some(_) => ctx.emit(json!("hello")).await,
                None => {
                    ctx.schedule_after(Duration::from_millis(500), json!({"resumed": true}))
                        .await
                }
            }
        }
    }

    let broker = MemoryBroker::shared();
    let mut site = test_site();
    site.providers
        .get_mut("dfm")
        .unwrap()
        .interface
        .get_mut("dfm.api.testing.Sleepy")
        .unwrap()
        .adapter = "deferred_hello".to_string();
    let mut registry = AdapterRegistry::builtin();
    registry.register::<DeferredHello>("deferred_hello");
    let services = start_services(&broker, &site, registry).await;

    let pipeline = Pipeline::new(vec![NodeSpec::new("x", "dfm.api.testing.Sleepy")
        .with_params(json!({}))
        .output()]);
    let started = Instant::now();
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses =
        drain_until_terminal(&broker, &request_id, &["x"], Duration::from_secs(15)).await;

    assert!(
        started.elapsed() >= Duration::from_millis(500),
        "completion must wait for the deferral"
    );
    let tags: Vec<String> = responses.iter().map(tag).collect();
    let running: Vec<usize> = tags
        .iter()
        .enumerate()
        .filter(|(_, t)| *t == "x:RUNNING")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(running.len(), 2, "expected two activations: {tags:?}");
    assert!(tags.contains(&"x:value(\"hello\")".to_string()));
    assert!(tags.contains(&"x:COMPLETED".to_string()));

    services.stop().await;
}

#[tokio::test]
async fn mailbox_roundtrip_through_delayed_polling() {
    let broker = MemoryBroker::shared();
    let site = test_site();
    let services = start_services(&broker, &site, AdapterRegistry::builtin()).await;

    let pipeline = Pipeline::new(vec![
        NodeSpec::new("recv", "dfm.api.dfm.AwaitMessage")
            .with_params(json!({"mailbox": "door", "poll_interval_ms": 100}))
            .output(),
        NodeSpec::new("send", "dfm.api.dfm.SendMessage")
            .with_params(json!({"mailbox": "door", "message": "knock"})),
    ]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses =
        drain_until_terminal(&broker, &request_id, &["recv"], Duration::from_secs(15)).await;

    let got: Vec<String> = responses
        .iter()
        .filter(|r| r.node_id.as_deref() == Some("recv"))
        .filter_map(|r| match &r.body {
            ResponseBody::Value { value } => value.as_str().map(str::to_string),
            _ => None,
        })
        .collect();
    assert_eq!(got, vec!["knock".to_string()]);

    services.stop().await;
}

#[tokio::test]
async fn cancel_stops_running_and_pending_nodes() {
    let broker = MemoryBroker::shared();
    let site = test_site();
    let services = start_services(&broker, &site, AdapterRegistry::builtin()).await;

    let pipeline = Pipeline::new(vec![
        NodeSpec::new("root", "dfm.api.testing.Sleepy")
            .with_params(json!({"sleep_ms": 60_000, "value": 1}))
            .output(),
        NodeSpec::new("down", "dfm.api.testing.Square").with_inputs(["root"]),
    ]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();

    // Let the root reach RUNNING before pulling the plug.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let cancelled_at = Instant::now();
    cancel_request(&broker, &request_id).await.unwrap();
    // Idempotent: a second cancel is a quiet no-op.
    cancel_request(&broker, &request_id).await.unwrap();

    let responses = drain_until_terminal(
        &broker,
        &request_id,
        &["root", "down"],
        Duration::from_secs(10),
    )
    .await;
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(5),
        "cancellation must take effect promptly"
    );

    let req = RequestHandle::load(broker.clone(), &request_id)
        .await
        .unwrap()
        .unwrap();
    let states = req.states().await.unwrap();
    assert_eq!(states[&"root".to_string()], NodeState::Cancelled);
    assert_eq!(states[&"down".to_string()], NodeState::Cancelled);
    assert!(
        !responses.iter().any(Response::is_value),
        "no values after cancellation"
    );

    services.stop().await;
}

#[tokio::test]
async fn node_timeout_cancels_node_and_dependents() {
    let broker = MemoryBroker::shared();
    let mut site = test_site();
    site.node_timeout_ms = 300;
    let services = start_services(&broker, &site, AdapterRegistry::builtin()).await;

    let pipeline = Pipeline::new(vec![
        NodeSpec::new("slow", "dfm.api.testing.Sleepy")
            .with_params(json!({"sleep_ms": 60_000}))
            .output(),
        NodeSpec::new("after", "dfm.api.dfm.SignalClient")
            .with_params(json!({"message": "x"}))
            .with_after(["slow"]),
    ]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses = drain_until_terminal(
        &broker,
        &request_id,
        &["slow", "after"],
        Duration::from_secs(10),
    )
    .await;
    let tags: Vec<String> = responses.iter().map(tag).collect();
    assert!(
        tags.contains(&"slow:error(CANCELLED)".to_string()),
        "timeout surfaces as cancellation: {tags:?}"
    );
    assert!(tags.contains(&"slow:CANCELLED".to_string()));
    assert!(tags.contains(&"after:CANCELLED".to_string()));

    services.stop().await;
}

#[tokio::test]
async fn folded_constant_feeds_consumer_without_running() {
    let broker = MemoryBroker::shared();
    let site = test_site();
    let services = start_services(&broker, &site, AdapterRegistry::builtin()).await;

    let pipeline = Pipeline::new(vec![
        NodeSpec::new("six", CONSTANT_API).with_params(json!({"value": 6})),
        NodeSpec::new("sq", "dfm.api.testing.Square")
            .with_inputs(["six"])
            .output(),
    ]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses =
        drain_until_terminal(&broker, &request_id, &["sq"], Duration::from_secs(10)).await;
    let tags: Vec<String> = responses.iter().map(tag).collect();

    assert!(tags.contains(&"sq:value(36)".to_string()), "{tags:?}");
    // The folded constant never surfaces in the response stream.
    assert!(
        !tags.iter().any(|t| t.starts_with("six:")),
        "folded node must not emit: {tags:?}"
    );
    let req = RequestHandle::load(broker.clone(), &request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        req.state(&"six".to_string()).await.unwrap(),
        Some(NodeState::Completed)
    );

    services.stop().await;
}

#[tokio::test]
async fn duplicate_nodes_share_one_execution() {
    let broker = MemoryBroker::shared();
    let site = test_site();

    let loads = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut registry = AdapterRegistry::builtin();
    {
        let loads = Arc::clone(&loads);
        registry.register_factory("load_model_data", move |config, params| {
            loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            use conflux::adapter::Adapter;
            conflux::adapters::load_model_data::LoadModelData::configure(config, params)
                .map(|a| Arc::new(a) as Arc<dyn Adapter>)
        });
    }
    let services = start_services(&broker, &site, registry).await;

    // Two identical loads; one survives optimization and both consumers fan
    // out to it.
    let pipeline = Pipeline::new(vec![
        NodeSpec::new("l1", "dfm.api.data_loader.LoadModelData")
            .with_params(json!({"time": "2024-03-03T00:00"})),
        NodeSpec::new("l2", "dfm.api.data_loader.LoadModelData")
            .with_params(json!({"time": "2024-03-03T00:00"}))
            .output(),
    ]);
    let request_id = submit_pipeline(&broker, &site, pipeline).await.unwrap();
    let responses =
        drain_until_terminal(&broker, &request_id, &["l1"], Duration::from_secs(10)).await;

    assert_eq!(loads.load(std::sync::atomic::Ordering::SeqCst), 1);
    // The survivor inherited is_output from the collapsed duplicate.
    assert!(responses.iter().any(Response::is_value));

    services.stop().await;
}
