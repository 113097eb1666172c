//! UVE cache synchronization tests.
//!
//! The client caches UVE submissions while disconnected and replays
//! everything newer than the collector's per-type baseline once a session
//! is established. Replays carry the sync hint and their original
//! sequence numbers.
//!
//! Harness helpers are duplicated across the e2e suites to keep each test
//! file self-contained and independently runnable.

use std::time::Duration;

use beacon::uve::UveTypeDesc;
use beacon::{Generator, GeneratorConfig, UveData, UvePayload};
use beacon_test_utils::{MockCollector, MockCollectorConfig};
use beacon_protocol::{HINT_SYNC_REPLAY, Message};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn test_config(endpoint: &str, idle_hold: Duration) -> GeneratorConfig {
    let mut config = GeneratorConfig::new("e2e-uve", "host-uve");
    config.collectors = vec![endpoint.to_owned()];
    config.http_port = None;
    config.idle_hold_time = idle_hold;
    config.connect_time = Duration::from_secs(2);
    config
}

fn uve(name: &str, attrs: &[(&str, &str)], deleted: bool) -> UvePayload {
    let mut data = UveData::new(name);
    data.deleted = deleted;
    for (key, value) in attrs {
        data.attrs.insert((*key).to_owned(), (*value).to_owned());
    }
    UvePayload::Data(data)
}

async fn wait_replays(collector: &MockCollector, at_least: usize) -> Vec<Message> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let replays: Vec<Message> = collector
                .received_named("UVETest")
                .into_iter()
                .filter(|m| m.header.hints & HINT_SYNC_REPLAY != 0)
                .collect();
            if replays.len() >= at_least {
                return replays;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sync replays should arrive")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_replays_cached_entries_with_original_seqnos() {
    let collector = MockCollector::start(MockCollectorConfig {
        baselines: vec![("UVETest".to_owned(), 0)],
        ..MockCollectorConfig::default()
    })
    .await
    .unwrap();

    // A long idle hold keeps the machine parked while we fill the cache.
    let generator = Generator::init(
        test_config(&collector.endpoint(), Duration::from_millis(300)),
        vec![UveTypeDesc::new("UVETest")],
    )
    .await;

    assert_eq!(generator.send_uve("UVETest", uve("uve1", &[], false)), 0);
    assert_eq!(
        generator.send_uve("UVETest", uve("uve1", &[("xyz", "345")], false)),
        0
    );
    assert_eq!(
        generator.send_uve("UVETest", uve("uve2", &[("xyz", "12")], false)),
        0
    );
    assert_eq!(generator.send_uve("UVETest", uve("uve2", &[], true)), 0);

    let replays = wait_replays(&collector, 2).await;
    let mut summary: Vec<(String, u64, bool)> = replays
        .iter()
        .map(|m| {
            (
                m.payload.attribute("name").unwrap_or("").to_owned(),
                m.header.sequence,
                m.payload.attribute("deleted") == Some("true"),
            )
        })
        .collect();
    summary.sort();
    assert_eq!(
        summary,
        vec![
            ("uve1".to_owned(), 2, false),
            ("uve2".to_owned(), 4, true),
        ]
    );

    // The merged value, not the original submission, is replayed.
    let uve1 = replays
        .iter()
        .find(|m| m.payload.attribute("name") == Some("uve1"))
        .unwrap();
    let xyz = uve1
        .payload
        .children
        .iter()
        .find(|c| c.attribute("name") == Some("xyz"))
        .expect("merged attribute present");
    assert_eq!(xyz.text, "345");
    generator.uninit();
}

#[tokio::test]
async fn baseline_filters_entries_the_collector_already_has() {
    let collector = MockCollector::start(MockCollectorConfig {
        baselines: vec![("UVETest".to_owned(), 2)],
        ..MockCollectorConfig::default()
    })
    .await
    .unwrap();
    let generator = Generator::init(
        test_config(&collector.endpoint(), Duration::from_millis(300)),
        vec![UveTypeDesc::new("UVETest")],
    )
    .await;

    generator.send_uve("UVETest", uve("uve1", &[], false)); // seqno 1
    generator.send_uve("UVETest", uve("uve1", &[("xyz", "345")], false)); // seqno 2
    generator.send_uve("UVETest", uve("uve2", &[("xyz", "12")], false)); // seqno 3
    generator.send_uve("UVETest", uve("uve2", &[], true)); // seqno 4

    let replays = wait_replays(&collector, 1).await;
    assert_eq!(replays.len(), 1, "only the entry newer than baseline 2");
    assert_eq!(replays[0].payload.attribute("name"), Some("uve2"));
    assert_eq!(replays[0].header.sequence, 4);
    generator.uninit();
}

#[tokio::test]
async fn failed_negotiation_drops_the_session_and_retries() {
    let collector = MockCollector::start(MockCollectorConfig {
        reply_success: false,
        ..MockCollectorConfig::default()
    })
    .await
    .unwrap();
    let generator = Generator::init(
        test_config(&collector.endpoint(), Duration::from_millis(20)),
        vec![],
    )
    .await;

    // The client must never settle in Established; it reconnects instead.
    tokio::time::timeout(Duration::from_secs(10), async {
        while collector.connection_count() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client should retry after a rejected negotiation");
    assert_ne!(generator.collector_info().1, "Established");
    generator.uninit();
}
