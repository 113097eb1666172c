//! Failover and reconnect tests.
//!
//! The state machine tries the primary collector first, fails over to the
//! backup, reconnects after a collector restart, and follows collector
//! reconfiguration starting from the new primary.
//!
//! Harness helpers are duplicated across the e2e suites to keep each test
//! file self-contained and independently runnable.

use std::time::Duration;

use beacon::{Generator, GeneratorConfig};
use beacon_protocol::{CTRL_CLIENT_TO_SERVER, CtrlClientToServer};
use beacon_test_utils::{MockCollector, MockCollectorConfig};

/// Nothing listens on port 1; connects fail fast with ECONNREFUSED.
const DEAD_COLLECTOR: &str = "127.0.0.1:1";

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn test_config(collectors: Vec<String>) -> GeneratorConfig {
    let mut config = GeneratorConfig::new("e2e-failover", "host-failover");
    config.collectors = collectors;
    config.http_port = None;
    config.idle_hold_time = Duration::from_millis(20);
    config.connect_time = Duration::from_secs(2);
    config
}

async fn wait_established(generator: &Generator, within: Duration) {
    tokio::time::timeout(within, async {
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
async fn dead_primary_fails_over_to_backup() {
    let backup = MockCollector::start(MockCollectorConfig::default())
        .await
        .unwrap();
    let generator = Generator::init(
        test_config(vec![DEAD_COLLECTOR.to_owned(), backup.endpoint()]),
        vec![],
    )
    .await;

    wait_established(&generator, Duration::from_secs(10)).await;
    assert_eq!(
        generator.active_collector().as_deref(),
        Some(backup.endpoint().as_str()),
        "the backup must be the active collector after failover"
    );
    assert!(
        backup
            .wait_for_message(CTRL_CLIENT_TO_SERVER, Duration::from_secs(5))
            .await
            .is_some()
    );
    generator.uninit();
}

#[tokio::test]
async fn collector_restart_triggers_a_fresh_handshake() {
    let collector = MockCollector::start(MockCollectorConfig::default())
        .await
        .unwrap();
    let generator =
        Generator::init(test_config(vec![collector.endpoint()]), vec![]).await;
    wait_established(&generator, Duration::from_secs(5)).await;
    assert_eq!(collector.connection_count(), 1);

    // Kill the live connection; the client must notice and reconnect
    // (no backup: ConnectToBackup falls through Idle back to the primary).
    collector.drop_connections();
    tokio::time::timeout(Duration::from_secs(10), async {
        while collector.connection_count() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client should reconnect after the collector drops it");

    wait_established(&generator, Duration::from_secs(10)).await;
    let handshakes = collector.received_named(CTRL_CLIENT_TO_SERVER);
    assert!(handshakes.len() >= 2);
    let last = CtrlClientToServer::from_payload(&handshakes.last().unwrap().payload).unwrap();
    assert_eq!(last.connect_count, 2, "connect count grows across sessions");
    generator.uninit();
}

#[tokio::test]
async fn reconfigured_collectors_are_tried_new_primary_first() {
    let first = MockCollector::start(MockCollectorConfig::default())
        .await
        .unwrap();
    let second = MockCollector::start(MockCollectorConfig::default())
        .await
        .unwrap();

    let generator = Generator::init(test_config(vec![first.endpoint()]), vec![]).await;
    wait_established(&generator, Duration::from_secs(5)).await;

    generator.reconfig_collectors(vec![second.endpoint(), first.endpoint()]);
    tokio::time::timeout(Duration::from_secs(10), async {
        while second.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("the new primary should be attempted");

    wait_established(&generator, Duration::from_secs(10)).await;
    assert_eq!(
        generator.active_collector().as_deref(),
        Some(second.endpoint().as_str())
    );
    generator.uninit();
}

#[tokio::test]
async fn reconfig_with_same_primary_is_ignored() {
    let collector = MockCollector::start(MockCollectorConfig::default())
        .await
        .unwrap();
    let generator =
        Generator::init(test_config(vec![collector.endpoint()]), vec![]).await;
    wait_established(&generator, Duration::from_secs(5)).await;
    let connections_before = collector.connection_count();

    // Same primary, added backup: no reconnect churn.
    generator.reconfig_collectors(vec![collector.endpoint(), DEAD_COLLECTOR.to_owned()]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(collector.connection_count(), connections_before);
    assert_eq!(generator.collector_info().1, "Established");
    generator.uninit();
}
