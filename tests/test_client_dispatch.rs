//! Client dispatch tests
//!
//! End-to-end delivery through `MqttClient`: configured default topics,
//! wildcard fan-out, handler ordering and failure isolation.

use mqttlink::testing::MockEngine;
use mqttlink::transport::mqtt::{ConnectOutcome, HandlerError, MqttClient, QoS};
use mqttlink::ClientConfig;
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new("mqtt://localhost:1883");
    config.mqtt.client_id = Some("dispatch-test".to_string());
    config.reconnect.connect_grace_ms = 500;
    config
}

async fn connected_client(config: ClientConfig, engine: &MockEngine) -> Arc<MqttClient> {
    let client = Arc::new(MqttClient::with_engine(config, Arc::new(engine.clone())).unwrap());
    let connecting = client.clone();
    let task = tokio::spawn(async move { connecting.connect().await });
    engine.wait_for_open(1).await;
    engine.latest_connection().unwrap().simulate_connect().await;
    assert_eq!(task.await.unwrap(), ConnectOutcome::Connected);
    client
}

fn recorder(
    log: &Log,
    label: &'static str,
) -> impl Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync + 'static {
    let log = log.clone();
    move |topic, payload| {
        log.lock()
            .unwrap()
            .push(format!("{label}:{topic}:{}", String::from_utf8_lossy(payload)));
        Ok(())
    }
}

#[tokio::test]
async fn test_inbound_message_delivered_once() {
    let engine = MockEngine::new();
    let mut config = test_config();
    config.topics.inbound = Some("a/b".to_string());
    let client = connected_client(config, &engine).await;
    let log: Log = Arc::default();

    client
        .subscribe_inbound(recorder(&log, "inbound"))
        .await
        .unwrap();
    let connection = engine.latest_connection().unwrap();
    connection.simulate_message("a/b", b"hello").await;
    connection.simulate_message("a/c", b"ignored").await;

    assert_eq!(*log.lock().unwrap(), vec!["inbound:a/b:hello"]);
    assert_eq!(connection.options().client_id, "dispatch-test");
}

#[tokio::test]
async fn test_exact_handlers_run_before_wildcards() {
    let engine = MockEngine::new();
    let client = connected_client(test_config(), &engine).await;
    let log: Log = Arc::default();

    client.subscribe("home/#", recorder(&log, "all"), None).await;
    client
        .subscribe("home/+/temp", recorder(&log, "any-room"), None)
        .await;
    client
        .subscribe("home/kitchen/temp", recorder(&log, "kitchen"), None)
        .await;
    client
        .subscribe("home/kitchen/temp", recorder(&log, "kitchen-2"), None)
        .await;

    engine
        .latest_connection()
        .unwrap()
        .simulate_message("home/kitchen/temp", b"21")
        .await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "kitchen:home/kitchen/temp:21",
            "kitchen-2:home/kitchen/temp:21",
            "all:home/kitchen/temp:21",
            "any-room:home/kitchen/temp:21",
        ]
    );
}

#[tokio::test]
async fn test_failing_handler_does_not_block_others() {
    let engine = MockEngine::new();
    let client = connected_client(test_config(), &engine).await;
    let log: Log = Arc::default();

    client.subscribe("jobs/#", recorder(&log, "first"), None).await;
    client
        .subscribe(
            "jobs/#",
            |_, _| Err(HandlerError::new("rejected payload")),
            None,
        )
        .await;
    client
        .subscribe("jobs/#", |_, _| panic!("handler bug"), None)
        .await;
    client.subscribe("jobs/#", recorder(&log, "last"), None).await;

    let connection = engine.latest_connection().unwrap();
    connection.simulate_message("jobs/42", b"run").await;
    connection.simulate_message("jobs/43", b"run").await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "first:jobs/42:run",
            "last:jobs/42:run",
            "first:jobs/43:run",
            "last:jobs/43:run",
        ]
    );
    let metrics = client.health_metrics();
    assert_eq!(metrics.messages_dispatched, 8);
    assert_eq!(metrics.handler_failures, 4);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_unmatched_topic_is_dropped() {
    let engine = MockEngine::new();
    let client = connected_client(test_config(), &engine).await;
    let log: Log = Arc::default();

    client
        .subscribe("sport/tennis/+", recorder(&log, "tennis"), None)
        .await;
    let connection = engine.latest_connection().unwrap();
    connection
        .simulate_message("sport/tennis/player1/ranking", b"1")
        .await;
    connection.simulate_message("sport/golf/player1", b"2").await;

    assert!(log.lock().unwrap().is_empty());
    assert_eq!(client.health_metrics().messages_dispatched, 0);
}

#[tokio::test]
async fn test_repeated_pattern_subscribes_with_highest_qos() {
    let engine = MockEngine::new();
    let client = connected_client(test_config(), &engine).await;

    client
        .subscribe("metrics/#", |_, _| Ok(()), Some(QoS::AtMostOnce))
        .await;
    client
        .subscribe("metrics/#", |_, _| Ok(()), Some(QoS::ExactlyOnce))
        .await;

    assert_eq!(
        client.session().registered_patterns(),
        vec![("metrics/#".to_string(), QoS::ExactlyOnce)]
    );
}

#[tokio::test]
async fn test_publish_reaches_connection_with_payload() {
    let engine = MockEngine::new();
    let mut config = test_config();
    config.topics.outbound = Some("reports/out".to_string());
    let client = connected_client(config, &engine).await;

    client
        .publish("reports/daily", vec![1u8, 2, 3], Some(QoS::AtMostOnce))
        .await
        .unwrap();
    client.publish_outbound("done").await.unwrap();

    let published = engine.latest_connection().unwrap().published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].topic, "reports/daily");
    assert_eq!(&published[0].payload[..], &[1u8, 2, 3]);
    assert_eq!(published[1].topic, "reports/out");
    assert_eq!(&published[1].payload[..], b"done");
    assert_eq!(published[1].qos, QoS::AtLeastOnce);
}
