//! Integration tests for the broker
//!
//! These drive the coordinator end to end through in-process channels and the
//! Unix socket transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::Instant;

use nnbroker::channel::{self, ClientEnd};
use nnbroker::coordinator::{
    CoordRequest, Coordinator, CoordinatorConfig, CoordinatorHandle, QueueKey, QueueScope, SessionId, SessionState,
};
use nnbroker::correlator::CorrelationId;
use nnbroker::ipc::{self, BrokerMessage, ClientMessage};
use nnbroker::{BrokerClient, BrokerError, InferenceEngine, ModelLoader, Registration};

// =============================================================================
// Helpers
// =============================================================================

/// Maps `{"x": n}` to `{"y": 2n}`
struct Doubler;

#[async_trait]
impl InferenceEngine for Doubler {
    async fn run(&self, input: Value) -> eyre::Result<Value> {
        let x = input
            .get("x")
            .and_then(Value::as_i64)
            .ok_or_else(|| eyre::eyre!("input has no x"))?;
        Ok(json!({"y": x * 2}))
    }
}

/// Reports which context ran the model
struct Tagged(&'static str);

#[async_trait]
impl InferenceEngine for Tagged {
    async fn run(&self, _input: Value) -> eyre::Result<Value> {
        Ok(json!({"served_by": self.0}))
    }
}

struct SlowLoader(Duration);

#[async_trait]
impl ModelLoader for SlowLoader {
    async fn ready(&self) -> eyre::Result<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

struct BrokenLoader;

#[async_trait]
impl ModelLoader for BrokenLoader {
    async fn ready(&self) -> eyre::Result<()> {
        Err(eyre::eyre!("weights missing"))
    }
}

fn start(config: CoordinatorConfig) -> (CoordinatorHandle, tokio::task::JoinHandle<()>) {
    let coordinator = Coordinator::new(config);
    let handle = coordinator.handle();
    (handle, tokio::spawn(coordinator.run()))
}

async fn stop(handle: CoordinatorHandle, task: tokio::task::JoinHandle<()>) {
    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Connect a raw channel and register it, leaving heartbeats to the test
async fn raw_session(handle: &CoordinatorHandle, name: &str, can_serve: bool) -> (SessionId, ClientEnd) {
    let (id, mut end) = handle.connect().await.unwrap();
    end.send(ClientMessage::Register {
        resource_name: name.to_string(),
        kind: "feed-forward".to_string(),
        can_serve,
    })
    .await
    .unwrap();

    match end.recv().await {
        Some(BrokerMessage::Registered { session_id }) => assert_eq!(session_id, id),
        other => panic!("Expected registered, got {:?}", other),
    }
    (id, end)
}

/// Answer pings until an evaluate arrives, then return it
async fn next_evaluate(end: &mut ClientEnd) -> (CorrelationId, Value) {
    loop {
        match end.recv().await {
            Some(BrokerMessage::Ping { correlation_id }) => {
                end.send(ClientMessage::Pong { correlation_id }).await.unwrap();
            }
            Some(BrokerMessage::Evaluate { correlation_id, input }) => return (correlation_id, input),
            other => panic!("Expected evaluate, got {:?}", other),
        }
    }
}

async fn client(handle: &CoordinatorHandle, registration: Registration, engine: Option<Arc<dyn InferenceEngine>>) -> BrokerClient {
    let (_, end) = handle.connect().await.unwrap();
    let client = BrokerClient::connect(end, registration, engine, None).await.unwrap();
    client.registered().await.unwrap();
    client
}

async fn wait_queued(handle: &CoordinatorHandle, count: usize) {
    while handle.metrics().await.unwrap().queued_tasks != count {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Evaluation Routing
// =============================================================================

#[tokio::test]
async fn test_consumer_evaluation_served_by_elected_server() {
    let (handle, task) = start(CoordinatorConfig::default());

    let server = client(&handle, Registration::server("classifier"), Some(Arc::new(Doubler))).await;
    let consumer = client(&handle, Registration::consumer("classifier"), None).await;

    let output = consumer.evaluate(json!({"x": 1}), None).await.unwrap();
    assert_eq!(output, json!({"y": 2}));

    let snapshot = handle.snapshot().await.unwrap();
    let server_id = server.registered().await.unwrap();
    assert_eq!(snapshot.servers.get("classifier"), Some(&server_id));

    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.evaluations_completed, 1);
    assert_eq!(metrics.assigned_servers, 1);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_raw_protocol_forward_and_reply() {
    let (handle, task) = start(CoordinatorConfig::default());

    let (_, mut server) = raw_session(&handle, "classifier", true).await;
    let (consumer_id, _consumer) = raw_session(&handle, "classifier", false).await;

    let pending = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.evaluate(consumer_id, json!({"x": 1})).await })
    };

    let (correlation_id, input) = next_evaluate(&mut server).await;
    assert_eq!(input, json!({"x": 1}));
    server
        .send(ClientMessage::Evaluated {
            correlation_id,
            output: json!({"y": 2}),
        })
        .await
        .unwrap();

    assert_eq!(pending.await.unwrap(), Ok(json!({"y": 2})));

    stop(handle, task).await;
}

#[tokio::test]
async fn test_engine_error_surfaces_as_evaluation_failed() {
    let (handle, task) = start(CoordinatorConfig::default());

    let _server = client(&handle, Registration::server("classifier"), Some(Arc::new(Doubler))).await;
    let consumer = client(&handle, Registration::consumer("classifier"), None).await;

    let result = consumer.evaluate(json!({"z": 1}), None).await;
    match result {
        Err(BrokerError::EvaluationFailed(message)) => assert!(message.contains("input has no x")),
        other => panic!("Expected evaluation failure, got {:?}", other),
    }

    stop(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_server_waits_for_model_loader() {
    let (handle, task) = start(CoordinatorConfig::default());

    let (_, end) = handle.connect().await.unwrap();
    let _server = BrokerClient::connect(
        end,
        Registration::server("classifier"),
        Some(Arc::new(Doubler)),
        Some(Arc::new(SlowLoader(Duration::from_secs(3)))),
    )
    .await
    .unwrap();
    let consumer = client(&handle, Registration::consumer("classifier"), None).await;

    let started = Instant::now();
    let output = consumer.evaluate(json!({"x": 4}), None).await.unwrap();
    assert_eq!(output, json!({"y": 8}));
    assert!(started.elapsed() >= Duration::from_secs(3));

    stop(handle, task).await;
}

#[tokio::test]
async fn test_loader_failure_fails_evaluation() {
    let (handle, task) = start(CoordinatorConfig::default());

    let (_, end) = handle.connect().await.unwrap();
    let _server = BrokerClient::connect(
        end,
        Registration::server("classifier"),
        Some(Arc::new(Doubler)),
        Some(Arc::new(BrokenLoader)),
    )
    .await
    .unwrap();
    let consumer = client(&handle, Registration::consumer("classifier"), None).await;

    assert_eq!(
        consumer.evaluate(json!({"x": 1}), None).await,
        Err(BrokerError::EvaluationFailed("weights missing".to_string()))
    );

    stop(handle, task).await;
}

// =============================================================================
// No Server and Failover
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pending_call_served_after_late_server_registration() {
    let (handle, task) = start(CoordinatorConfig::default());

    let consumer = client(&handle, Registration::consumer("classifier"), None).await;
    let pending = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.evaluate(json!({"x": 1}), None).await })
    };

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!pending.is_finished());
    assert!(handle.metrics().await.unwrap().no_server_retries >= 2);

    let registered_at = Instant::now();
    let _server = client(&handle, Registration::server("classifier"), Some(Arc::new(Doubler))).await;

    assert_eq!(pending.await.unwrap(), Ok(json!({"y": 2})));
    assert!(registered_at.elapsed() <= Duration::from_millis(1000));

    stop(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_failover_to_next_candidate_requeues_task() {
    let (handle, task) = start(CoordinatorConfig::default());

    let (first_id, mut first) = raw_session(&handle, "classifier", true).await;
    let second = client(&handle, Registration::server("classifier"), Some(Arc::new(Tagged("second")))).await;
    let consumer = client(&handle, Registration::consumer("classifier"), None).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.servers.get("classifier"), Some(&first_id));

    let pending = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.evaluate(json!({"x": 1}), None).await })
    };

    // The first server receives the work, then disappears without answering
    next_evaluate(&mut first).await;
    let closed_at = Instant::now();
    drop(first);

    assert_eq!(pending.await.unwrap(), Ok(json!({"served_by": "second"})));
    assert!(closed_at.elapsed() < Duration::from_millis(1000));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.servers.get("classifier"), Some(&second.registered().await.unwrap()));
    assert!(snapshot.session(first_id).is_none());

    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.evaluations_requeued, 1);

    stop(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_server_closed_after_heartbeat_timeout() {
    let (handle, task) = start(CoordinatorConfig::default());

    let (id, mut silent) = raw_session(&handle, "classifier", true).await;
    assert_eq!(handle.snapshot().await.unwrap().servers.get("classifier"), Some(&id));

    assert!(matches!(silent.recv().await, Some(BrokerMessage::Ping { .. })));
    let pinged_at = Instant::now();

    // Never answer; the broker drops the channel once the ping times out
    assert_eq!(silent.recv().await, None);
    let elapsed = pinged_at.elapsed();
    assert!(elapsed >= Duration::from_millis(5000));
    assert!(elapsed < Duration::from_millis(5100));

    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.servers.is_empty());
    assert!(snapshot.session(id).is_none());

    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.heartbeat_failures, 1);
    assert_eq!(metrics.request_timeouts, 1);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_session_that_stops_reading_is_closed_alone() {
    let (handle, task) = start(CoordinatorConfig::default());

    let (broker_end, mut stuck) = channel::pair(4);
    let stuck_id = handle.add_session(broker_end).await.unwrap();

    // Each rejection goes into a channel nobody drains
    for _ in 0..8 {
        let sent = stuck
            .send(ClientMessage::Register {
                resource_name: "classifier".to_string(),
                kind: "recurrent".to_string(),
                can_serve: true,
            })
            .await;
        if sent.is_err() {
            break;
        }
    }

    tokio::time::timeout(Duration::from_secs(10), handle.metrics())
        .await
        .expect("coordinator stopped answering")
        .unwrap();

    // The broker gave up on the stuck session once its buffer was full
    let mut rejections = 0;
    while let Some(msg) = tokio::time::timeout(Duration::from_secs(10), stuck.recv())
        .await
        .expect("stuck session never closed")
    {
        assert!(matches!(msg, BrokerMessage::RegisterRejected { .. }));
        rejections += 1;
    }
    assert_eq!(rejections, 4);
    assert!(handle.snapshot().await.unwrap().session(stuck_id).is_none());
    assert_eq!(handle.metrics().await.unwrap().messages_sent, 4);

    // Everyone else is still served
    let _server = client(&handle, Registration::server("classifier"), Some(Arc::new(Doubler))).await;
    let consumer = client(&handle, Registration::consumer("classifier"), None).await;
    assert_eq!(consumer.evaluate(json!({"x": 4}), None).await, Ok(json!({"y": 8})));

    stop(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_responsive_session_stays_active() {
    let (handle, task) = start(CoordinatorConfig::default());

    let server = client(&handle, Registration::server("classifier"), Some(Arc::new(Doubler))).await;
    let id = server.registered().await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;

    let snapshot = handle.snapshot().await.unwrap();
    let info = snapshot.session(id).unwrap();
    assert_eq!(info.state, SessionState::Active);
    assert!(info.since_heartbeat.unwrap() < Duration::from_millis(1100));
    assert_eq!(snapshot.servers.get("classifier"), Some(&id));
    assert_eq!(handle.metrics().await.unwrap().heartbeat_failures, 0);

    stop(handle, task).await;
}

// =============================================================================
// Queue Ordering
// =============================================================================

#[tokio::test]
async fn test_evaluations_start_in_call_order() {
    let coordinator = Coordinator::new(CoordinatorConfig::default());
    let sender = coordinator.sender();
    let handle = coordinator.handle();
    let task = tokio::spawn(coordinator.run());

    let (_, mut server) = raw_session(&handle, "classifier", true).await;
    let mut consumers = Vec::new();
    for _ in 0..3 {
        consumers.push(raw_session(&handle, "classifier", false).await);
    }

    let mut replies = Vec::new();
    for (i, (id, _)) in consumers.iter().enumerate() {
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(CoordRequest::Evaluate {
                session_id: *id,
                input: json!(i),
                reply_tx,
            })
            .await
            .unwrap();
        replies.push(reply_rx);
    }

    let key = QueueKey::Resource("classifier".to_string());
    for i in 0..3usize {
        let (correlation_id, input) = next_evaluate(&mut server).await;
        assert_eq!(input, json!(i));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.in_service.len(), 1);
        assert_eq!(snapshot.queued.get(&key), Some(&(2 - i)));

        server
            .send(ClientMessage::Evaluated {
                correlation_id,
                output: json!(i * 10),
            })
            .await
            .unwrap();
    }

    for (i, reply_rx) in replies.into_iter().enumerate() {
        assert_eq!(reply_rx.await.unwrap(), Ok(json!(i * 10)));
    }

    stop(handle, task).await;
}

#[tokio::test]
async fn test_per_resource_queues_run_side_by_side() {
    let (handle, task) = start(CoordinatorConfig::default());

    let (_, mut classifier) = raw_session(&handle, "classifier", true).await;
    let (_, mut detector) = raw_session(&handle, "detector", true).await;
    let (c_id, _c) = raw_session(&handle, "classifier", false).await;
    let (d_id, _d) = raw_session(&handle, "detector", false).await;

    let h1 = handle.clone();
    let first = tokio::spawn(async move { h1.evaluate(c_id, json!("c")).await });
    let h2 = handle.clone();
    let second = tokio::spawn(async move { h2.evaluate(d_id, json!("d")).await });

    // Both are forwarded before either replies
    let (c_corr, _) = next_evaluate(&mut classifier).await;
    let (d_corr, _) = next_evaluate(&mut detector).await;
    assert_eq!(handle.snapshot().await.unwrap().in_service.len(), 2);

    detector
        .send(ClientMessage::Evaluated {
            correlation_id: d_corr,
            output: json!("D"),
        })
        .await
        .unwrap();
    classifier
        .send(ClientMessage::Evaluated {
            correlation_id: c_corr,
            output: json!("C"),
        })
        .await
        .unwrap();

    assert_eq!(second.await.unwrap(), Ok(json!("D")));
    assert_eq!(first.await.unwrap(), Ok(json!("C")));

    stop(handle, task).await;
}

#[tokio::test]
async fn test_global_scope_serializes_across_resources() {
    let config = CoordinatorConfig {
        queue_scope: QueueScope::Global,
        ..Default::default()
    };
    let (handle, task) = start(config);

    let (_, mut classifier) = raw_session(&handle, "classifier", true).await;
    let (_, mut detector) = raw_session(&handle, "detector", true).await;
    let (c_id, _c) = raw_session(&handle, "classifier", false).await;
    let (d_id, _d) = raw_session(&handle, "detector", false).await;

    let h1 = handle.clone();
    let first = tokio::spawn(async move { h1.evaluate(c_id, json!("c")).await });
    let (c_corr, _) = next_evaluate(&mut classifier).await;

    let h2 = handle.clone();
    let second = tokio::spawn(async move { h2.evaluate(d_id, json!("d")).await });
    wait_queued(&handle, 2).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.queued.get(&QueueKey::Global), Some(&1));

    classifier
        .send(ClientMessage::Evaluated {
            correlation_id: c_corr,
            output: json!("C"),
        })
        .await
        .unwrap();
    assert_eq!(first.await.unwrap(), Ok(json!("C")));

    let (d_corr, input) = next_evaluate(&mut detector).await;
    assert_eq!(input, json!("d"));
    detector
        .send(ClientMessage::Evaluated {
            correlation_id: d_corr,
            output: json!("D"),
        })
        .await
        .unwrap();
    assert_eq!(second.await.unwrap(), Ok(json!("D")));

    stop(handle, task).await;
}

// =============================================================================
// Requester Closure and Registration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_requester_close_rejects_queued_task() {
    let (handle, task) = start(CoordinatorConfig::default());

    let (id, requester) = raw_session(&handle, "classifier", false).await;
    let pending = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.evaluate(id, json!(1)).await })
    };
    wait_queued(&handle, 1).await;

    drop(requester);
    assert_eq!(pending.await.unwrap(), Err(BrokerError::ChannelClosed));
    assert_eq!(handle.metrics().await.unwrap().queued_tasks, 0);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_requester_close_in_service_starts_next() {
    let (handle, task) = start(CoordinatorConfig::default());

    let (_, mut server) = raw_session(&handle, "classifier", true).await;
    let (first_id, first) = raw_session(&handle, "classifier", false).await;
    let (second_id, _second) = raw_session(&handle, "classifier", false).await;

    let h1 = handle.clone();
    let first_call = tokio::spawn(async move { h1.evaluate(first_id, json!("first")).await });
    let (late_corr, _) = next_evaluate(&mut server).await;

    let h2 = handle.clone();
    let second_call = tokio::spawn(async move { h2.evaluate(second_id, json!("second")).await });
    wait_queued(&handle, 2).await;

    drop(first);
    assert_eq!(first_call.await.unwrap(), Err(BrokerError::ChannelClosed));

    let (corr, input) = next_evaluate(&mut server).await;
    assert_eq!(input, json!("second"));

    // The abandoned task's reply is discarded
    server
        .send(ClientMessage::Evaluated {
            correlation_id: late_corr,
            output: json!("stale"),
        })
        .await
        .unwrap();
    server
        .send(ClientMessage::Evaluated {
            correlation_id: corr,
            output: json!("fresh"),
        })
        .await
        .unwrap();

    assert_eq!(second_call.await.unwrap(), Ok(json!("fresh")));

    stop(handle, task).await;
}

#[tokio::test]
async fn test_unknown_kind_leaves_session_unregistered() {
    let (handle, task) = start(CoordinatorConfig::default());

    let (id, end) = handle.connect().await.unwrap();
    let client = BrokerClient::connect(
        end,
        Registration::server("classifier").with_kind("recurrent"),
        Some(Arc::new(Doubler)),
        None,
    )
    .await
    .unwrap();

    assert_eq!(
        client.registered().await,
        Err(BrokerError::UnknownResourceKind("recurrent".to_string()))
    );

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(
        snapshot.session(id).map(|s| s.state),
        Some(SessionState::AwaitingRegistration)
    );
    assert!(snapshot.servers.is_empty());
    assert_eq!(handle.evaluate(id, json!(1)).await, Err(BrokerError::NotRegistered(id)));

    stop(handle, task).await;
}

#[tokio::test]
async fn test_convolutional_kind_accepted() {
    let (handle, task) = start(CoordinatorConfig::default());

    let server = client(
        &handle,
        Registration::server("segmenter").with_kind("convolutional"),
        Some(Arc::new(Tagged("conv"))),
    )
    .await;
    assert!(server.registered().await.is_ok());

    stop(handle, task).await;
}

#[tokio::test]
async fn test_unregister_releases_server() {
    let (handle, task) = start(CoordinatorConfig::default());

    let server = client(&handle, Registration::server("classifier"), Some(Arc::new(Doubler))).await;
    assert_eq!(handle.metrics().await.unwrap().assigned_servers, 1);

    server.unregister().await.unwrap();
    server.closed().await;

    while handle.metrics().await.unwrap().registered_sessions != 0 {
        tokio::task::yield_now().await;
    }
    assert!(handle.snapshot().await.unwrap().servers.is_empty());

    stop(handle, task).await;
}

// =============================================================================
// Socket Transport
// =============================================================================

#[tokio::test]
async fn test_end_to_end_over_socket() {
    let temp = TempDir::new().unwrap();
    let socket_path = temp.path().join("broker.sock");
    let config = CoordinatorConfig::default();

    let listener = ipc::bind_socket(&socket_path).unwrap();
    let (handle, task) = start(config.clone());
    let accept_task = tokio::spawn(ipc::serve(
        listener,
        handle.clone(),
        config.session_channel_buffer,
        config.max_message_size,
    ));

    let server_end = ipc::connect(&socket_path, 16, config.max_message_size).await.unwrap();
    let server = BrokerClient::connect(server_end, Registration::server("classifier"), Some(Arc::new(Doubler)), None)
        .await
        .unwrap();
    let server_id = server.registered().await.unwrap();

    let consumer_end = ipc::connect(&socket_path, 16, config.max_message_size).await.unwrap();
    let consumer = BrokerClient::connect(consumer_end, Registration::consumer("classifier"), None, None)
        .await
        .unwrap();
    consumer.registered().await.unwrap();

    let output = consumer
        .evaluate(json!({"x": 21}), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(output, json!({"y": 42}));
    assert_eq!(handle.snapshot().await.unwrap().servers.get("classifier"), Some(&server_id));

    accept_task.abort();
    stop(handle, task).await;
    ipc::cleanup_socket(&socket_path);
    assert!(!socket_path.exists());
}

#[tokio::test]
async fn test_malformed_socket_line_closes_session() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    let temp = TempDir::new().unwrap();
    let socket_path = temp.path().join("broker.sock");

    let listener = ipc::bind_socket(&socket_path).unwrap();
    let (handle, task) = start(CoordinatorConfig::default());
    let accept_task = tokio::spawn(ipc::serve(listener, handle.clone(), 16, 1024));

    let mut stream = UnixStream::connect(&socket_path).await.unwrap();
    stream.write_all(b"{\"type\":\"no-such-message\"}\n").await.unwrap();

    // The broker hangs up
    let mut reader = BufReader::new(&mut stream);
    let mut line = String::new();
    assert_eq!(reader.read_line(&mut line).await.unwrap(), 0);

    while !handle.snapshot().await.unwrap().sessions.is_empty() {
        tokio::task::yield_now().await;
    }

    accept_task.abort();
    stop(handle, task).await;
}
