//! Property-based tests for the engine's core round-trip and isolation
//! guarantees.

use proptest::collection::vec;
use proptest::prelude::*;

use qdiskmq::{open_engine, EngineConfig};

fn tiny_ring_config(dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::new(dir.to_path_buf());
    // Small enough that most payload sequences below cross into the
    // overflow tier at least once, exercising both tiers per run.
    config.default_ring_capacity = 32;
    config
}

proptest! {
    #[test]
    fn round_trip_single_channel_is_fifo(payloads in vec(vec(any::<u8>(), 0..64), 0..50)) {
        let dir = tempdir::TempDir::new("props").unwrap();
        let mut engine = open_engine(tiny_ring_config(dir.path())).unwrap();
        let mut channel = engine.get_channel("ch");
        for payload in &payloads {
            channel.push(payload).unwrap();
        }
        let mut buf = Vec::new();
        for payload in &payloads {
            prop_assert!(channel.pop(&mut buf).unwrap());
            prop_assert_eq!(&buf, payload);
        }
        prop_assert!(!channel.pop(&mut buf).unwrap());
    }

    #[test]
    fn cross_channel_pushes_stay_independent(
        a in vec(vec(any::<u8>(), 0..32), 0..20),
        b in vec(vec(any::<u8>(), 0..32), 0..20),
    ) {
        let dir = tempdir::TempDir::new("props").unwrap();
        let mut engine = open_engine(tiny_ring_config(dir.path())).unwrap();
        {
            let mut ch_a = engine.get_channel("a");
            for payload in &a {
                ch_a.push(payload).unwrap();
            }
        }
        {
            let mut ch_b = engine.get_channel("b");
            for payload in &b {
                ch_b.push(payload).unwrap();
            }
        }

        let mut buf = Vec::new();
        let mut ch_a = engine.get_channel("a");
        for payload in &a {
            prop_assert!(ch_a.pop(&mut buf).unwrap());
            prop_assert_eq!(&buf, payload);
        }
        prop_assert!(!ch_a.pop(&mut buf).unwrap());
        drop(ch_a);

        let mut ch_b = engine.get_channel("b");
        for payload in &b {
            prop_assert!(ch_b.pop(&mut buf).unwrap());
            prop_assert_eq!(&buf, payload);
        }
        prop_assert!(!ch_b.pop(&mut buf).unwrap());
    }
}

#[test]
fn promotion_without_copy_preserves_buffered_records() {
    let dir = tempdir::TempDir::new("props").unwrap();
    let mut engine = open_engine(tiny_ring_config(dir.path())).unwrap();
    let mut channel = engine.get_channel("c");
    channel.push(b"buffered-1").unwrap();
    channel.push(b"buffered-2").unwrap();
    channel.subscribe("a").unwrap();

    let mut buf = Vec::new();
    assert!(channel.pop_subscriber("a", &mut buf).unwrap());
    assert_eq!(buf, b"buffered-1");
    assert!(channel.pop_subscriber("a", &mut buf).unwrap());
    assert_eq!(buf, b"buffered-2");
    assert!(!channel.pop_subscriber("a", &mut buf).unwrap());
}

#[test]
fn subscribe_fan_out_yields_two_independent_empty_storages() {
    let dir = tempdir::TempDir::new("props").unwrap();
    let mut engine = open_engine(tiny_ring_config(dir.path())).unwrap();
    let mut channel = engine.get_channel("c");
    channel.subscribe("a").unwrap();
    channel.subscribe("b").unwrap();

    let mut buf = Vec::new();
    assert!(!channel.pop_subscriber("a", &mut buf).unwrap());
    assert!(!channel.pop_subscriber("b", &mut buf).unwrap());

    channel.push(b"after-both-subscribed").unwrap();
    assert!(channel.pop_subscriber("a", &mut buf).unwrap());
    assert_eq!(buf, b"after-both-subscribed");
    assert!(channel.pop_subscriber("b", &mut buf).unwrap());
    assert_eq!(buf, b"after-both-subscribed");
}
