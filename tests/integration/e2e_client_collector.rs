//! End-to-end client <-> collector tests.
//!
//! Covers the connect/handshake flow against a live mock collector, framed
//! delivery of accepted messages, and the send-queue switch.
//!
//! Harness helpers are duplicated across the e2e suites to keep each test
//! file self-contained and independently runnable.

use std::time::Duration;

use beacon::uve::UveTypeDesc;
use beacon::{Generator, GeneratorConfig, Level, MessageKind};
use beacon_protocol::xml::XmlElement;
use beacon_protocol::{CTRL_CLIENT_TO_SERVER, CtrlClientToServer, HINT_CONTROL};
use beacon_test_utils::{MockCollector, MockCollectorConfig};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn test_config(endpoint: &str) -> GeneratorConfig {
    let mut config = GeneratorConfig::new("e2e-client", "host-e2e");
    config.node_type = "test".to_owned();
    config.collectors = vec![endpoint.to_owned()];
    config.http_port = None;
    config.idle_hold_time = Duration::from_millis(20);
    config.connect_time = Duration::from_secs(2);
    config
}

async fn wait_established(generator: &Generator) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if generator.collector_info().1 == "Established" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client should reach Established");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_carries_registered_uve_types() {
    let collector = MockCollector::start(MockCollectorConfig::default())
        .await
        .unwrap();
    let generator = Generator::init(
        test_config(&collector.endpoint()),
        vec![UveTypeDesc::new("UVETest")],
    )
    .await;

    let handshake = collector
        .wait_for_message(CTRL_CLIENT_TO_SERVER, Duration::from_secs(5))
        .await
        .expect("collector should receive the control handshake");
    assert_ne!(handshake.header.hints & HINT_CONTROL, 0);

    let ctrl = CtrlClientToServer::from_payload(&handshake.payload).unwrap();
    assert_eq!(ctrl.source, "host-e2e");
    assert_eq!(ctrl.module, "e2e-client");
    assert_eq!(ctrl.connect_count, 1);
    assert!(ctrl.uve_type_names.contains(&"UVETest".to_owned()));

    wait_established(&generator).await;
    let (name, state, connects) = generator.collector_info();
    assert_eq!(state, "Established");
    assert_eq!(name, "mock-collector");
    assert_eq!(connects, 1);
    generator.uninit();
}

#[tokio::test]
async fn accepted_messages_reach_the_collector_in_order() {
    let collector = MockCollector::start(MockCollectorConfig::default())
        .await
        .unwrap();
    let generator = Generator::init(test_config(&collector.endpoint()), vec![]).await;
    wait_established(&generator).await;

    for i in 0..3 {
        let msg = generator.message(
            MessageKind::AsyncSystem,
            "SystemLogTest",
            Level::Info,
            XmlElement::new("SystemLogTest").child(XmlElement::leaf("what", format!("msg-{i}"))),
        );
        assert_eq!(generator.send(msg), 0);
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while collector.received_named("SystemLogTest").len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all three messages should arrive");

    let received = collector.received_named("SystemLogTest");
    let bodies: Vec<String> = received
        .iter()
        .map(|m| m.payload.child_text("what").to_owned())
        .collect();
    assert_eq!(bodies, vec!["msg-0", "msg-1", "msg-2"]);

    // Program order on the wire: sequence numbers are monotonic.
    let seqs: Vec<u64> = received.iter().map(|m| m.header.sequence).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs not monotonic: {seqs:?}");
    generator.uninit();
}

#[tokio::test]
async fn send_queue_switch_pauses_and_resumes_transmission() {
    let collector = MockCollector::start(MockCollectorConfig::default())
        .await
        .unwrap();
    let generator = Generator::init(test_config(&collector.endpoint()), vec![]).await;
    wait_established(&generator).await;

    generator.set_send_queue(false);
    let msg = generator.message(
        MessageKind::AsyncObject,
        "ObjectLogTest",
        Level::Info,
        XmlElement::new("ObjectLogTest"),
    );
    assert_eq!(generator.send(msg), 0, "paused queue still accepts");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        collector.received_named("ObjectLogTest").is_empty(),
        "message must not be transmitted while the send queue is disabled"
    );

    generator.set_send_queue(true);
    assert!(
        collector
            .wait_for_message("ObjectLogTest", Duration::from_secs(5))
            .await
            .is_some(),
        "message should flow after re-enabling the send queue"
    );
    generator.uninit();
}
