/// End-to-end tests: emulated modem and memory broker wired through a
/// running gateway.
///
/// Every wait is bounded so a stuck pipeline fails the test instead of
/// hanging it.
use chrono::{DateTime, FixedOffset};
use sms_gateway::broker::memory::MemoryBroker;
use sms_gateway::broker::pipeline::BrokerTiming;
use sms_gateway::device::RawSmsRecord;
use sms_gateway::device::emulator::{EmulatedModem, ModemStorage};
use sms_gateway::device::pipeline::DeviceTiming;
use sms_gateway::gateway::{Gateway, GatewayHandle};
use sms_protocol::Envelope;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn at(s: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(s).expect("valid timestamp")
}

fn start(storage: &ModemStorage, broker: &MemoryBroker) -> GatewayHandle {
    let modem = EmulatedModem::new("at", "/dev/ttyUSB0", storage.clone());
    Gateway::new("m1", Box::new(modem), Box::new(broker.client()))
        .with_timing(
            DeviceTiming {
                reconnect: Duration::from_millis(20),
                poll: Duration::from_millis(10),
                idle: Duration::from_millis(5),
            },
            BrokerTiming {
                reconnect: Duration::from_millis(20),
                pump: Duration::from_millis(5),
                idle: Duration::from_millis(5),
            },
        )
        .start()
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

fn published_texts(broker: &MemoryBroker) -> Vec<String> {
    broker
        .published_to("m1.incoming")
        .iter()
        .map(|p| {
            serde_json::from_slice::<Envelope>(&p.payload)
                .expect("published payload is an envelope")
                .text
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stored_sms_is_published_once_then_deleted() {
    let storage = ModemStorage::new();
    storage.store(RawSmsRecord::single("+1555", "hi", at("2026-03-01T12:00:00Z")));
    let broker = MemoryBroker::new();
    let gateway = start(&storage, &broker);

    wait_until("publish", || !broker.published_to("m1.incoming").is_empty()).await;
    wait_until("eviction", || storage.stored_count() == 0).await;

    // Give the pipelines a few more cycles to prove nothing is repeated.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(published_texts(&broker), vec!["hi".to_owned()]);

    gateway.shutdown().await;
}

#[tokio::test]
async fn concatenated_sms_is_published_as_one_message() {
    let storage = ModemStorage::new();
    storage.store(RawSmsRecord::part("+1555", "lo", at("2026-03-01T12:00:01Z"), 7, 2, 2));
    storage.store(RawSmsRecord::part("+1555", "Hel", at("2026-03-01T12:00:00Z"), 7, 1, 2));
    let broker = MemoryBroker::new();
    let gateway = start(&storage, &broker);

    wait_until("eviction", || storage.stored_count() == 0).await;
    assert_eq!(published_texts(&broker), vec!["Hello".to_owned()]);
    assert_eq!(storage.deleted().len(), 2);

    gateway.shutdown().await;
}

#[tokio::test]
async fn connection_lost_mid_poll_recovers_without_partial_ingest() {
    let storage = ModemStorage::new();
    for text in ["one", "two", "three"] {
        storage.store(RawSmsRecord::single("+1555", text, at("2026-03-01T12:00:00Z")));
    }
    // The first poll breaks after reading one record.
    storage.drop_connection_after(1);
    let broker = MemoryBroker::new();
    let gateway = start(&storage, &broker);

    wait_until("all three published", || published_texts(&broker).len() == 3).await;
    wait_until("eviction", || storage.stored_count() == 0).await;

    let mut texts = published_texts(&broker);
    texts.sort();
    assert_eq!(texts, vec!["one", "three", "two"]);
    assert!(storage.connect_attempts() >= 2);

    gateway.shutdown().await;
}

#[tokio::test]
async fn offline_broker_delays_but_does_not_lose_inbound_sms() {
    let storage = ModemStorage::new();
    storage.store(RawSmsRecord::single("+1555", "late", at("2026-03-01T12:00:00Z")));
    let broker = MemoryBroker::new();
    broker.set_online(false);
    let gateway = start(&storage, &broker);

    wait_until("hand-off", || gateway.links().incoming.is_occupied()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(storage.stored_count(), 1, "not deleted before publish");

    broker.set_online(true);
    wait_until("eviction", || storage.stored_count() == 0).await;
    assert_eq!(published_texts(&broker), vec!["late".to_owned()]);

    gateway.shutdown().await;
}

// ---------------------------------------------------------------------------
// Outbound and pause
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outgoing_message_reaches_device_and_is_acknowledged() {
    let storage = ModemStorage::new();
    let broker = MemoryBroker::new();
    let payload = br#"{"type":"message","identity":"+1555","text":"pong"}"#;
    broker.enqueue("m1.outgoing", payload);
    let gateway = start(&storage, &broker);

    wait_until("ack", || !broker.acked().is_empty()).await;
    assert_eq!(storage.sent().len(), 1);
    assert_eq!(storage.sent()[0].text(), Some("pong"));
    assert_eq!(broker.acked(), vec![payload.to_vec()]);

    gateway.shutdown().await;
}

#[tokio::test]
async fn paused_gateway_holds_traffic_until_resumed() {
    let storage = ModemStorage::new();
    let broker = MemoryBroker::new();
    let gateway = start(&storage, &broker);
    wait_until("broker attach", || broker.has_exchange("messages")).await;

    gateway.pause();
    assert!(!gateway.is_active());
    let payload = br#"{"type":"message","identity":"+1555","text":"later"}"#;
    broker.enqueue("m1.outgoing", payload);
    storage.store(RawSmsRecord::single("+1555", "waiting", at("2026-03-01T12:00:00Z")));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(storage.sent().is_empty());
    assert!(broker.acked().is_empty());
    assert!(broker.published_to("m1.incoming").is_empty());
    assert_eq!(storage.stored_count(), 1);

    gateway.resume();
    wait_until("ack after resume", || !broker.acked().is_empty()).await;
    wait_until("publish after resume", || !published_texts(&broker).is_empty()).await;
    assert_eq!(storage.sent().len(), 1);
    assert_eq!(published_texts(&broker), vec!["waiting".to_owned()]);

    gateway.shutdown().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_stops_both_pipelines_and_clears_active() {
    let storage = ModemStorage::new();
    let broker = MemoryBroker::new();
    let gateway = start(&storage, &broker);
    wait_until("broker attach", || broker.has_exchange("messages")).await;

    let links = gateway.links().clone();
    tokio::time::timeout(Duration::from_secs(5), gateway.shutdown())
        .await
        .expect("shutdown completes");
    assert!(!links.active.is_active());
}
