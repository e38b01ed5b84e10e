//! End-to-end scenarios against the public `qdiskmq` API.

use std::cell::RefCell;
use std::rc::Rc;

use qdiskmq::config::RingSizeRule;
use qdiskmq::{open_engine, ConsumerEvent, EngineConfig};

fn config(dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::new(dir.to_path_buf());
    config.default_ring_capacity = 64; // force overflow quickly in these tests
    config
}

#[test]
fn basic_recovery_round_trip() {
    let dir = tempdir::TempDir::new("scenario").unwrap();
    {
        let mut engine = open_engine(config(dir.path())).unwrap();
        let mut channel = engine.get_channel("ch");
        channel.push(b"hello").unwrap();
        channel.push(b"world").unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
    }

    let mut engine = open_engine(config(dir.path())).unwrap();
    let mut channel = engine.get_channel("ch");
    let mut buf = Vec::new();
    assert!(channel.pop(&mut buf).unwrap());
    assert_eq!(buf, b"hello");
    assert!(channel.pop(&mut buf).unwrap());
    assert_eq!(buf, b"world");
    assert!(!channel.pop(&mut buf).unwrap());
}

#[test]
fn subscriber_isolation() {
    let dir = tempdir::TempDir::new("scenario").unwrap();
    let mut engine = open_engine(config(dir.path())).unwrap();
    let mut channel = engine.get_channel("c");
    channel.subscribe("").unwrap();
    channel.subscribe("s1").unwrap();
    channel.subscribe("s2").unwrap();
    channel.push(b"r1").unwrap();

    let mut buf = Vec::new();
    for subscriber in ["", "s1", "s2"] {
        assert!(channel.pop_subscriber(subscriber, &mut buf).unwrap());
        assert_eq!(buf, b"r1");
        assert!(!channel.pop_subscriber(subscriber, &mut buf).unwrap());
    }

    channel.push(b"r2").unwrap();
    for subscriber in ["", "s1", "s2"] {
        assert!(channel.pop_subscriber(subscriber, &mut buf).unwrap());
        assert_eq!(buf, b"r2");
        assert!(!channel.pop_subscriber(subscriber, &mut buf).unwrap());
    }
}

#[test]
fn corrupted_parity_raises_consistency_error() {
    let dir = tempdir::TempDir::new("scenario").unwrap();
    {
        let mut engine = open_engine(config(dir.path())).unwrap();
        let mut channel = engine.get_channel("ch");
        // Bigger than the ring so this lands on disk, where the parity
        // check actually runs.
        channel.push(&vec![b'x'; 1024]).unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
    }

    let data_path = dir.path().join("overflow.dat");
    let mut bytes = std::fs::read(&data_path).unwrap();
    // Offset 8 is the first byte of the first record's header
    // (channel_id), right after the 8-byte file magic.
    bytes[8] ^= 0xFF;
    std::fs::write(&data_path, bytes).unwrap();

    let mut engine = open_engine(config(dir.path())).unwrap();
    let mut channel = engine.get_channel("ch");
    let mut buf = Vec::new();
    assert!(channel.pop(&mut buf).is_err());
}

#[test]
fn restart_preserves_multi_channel_topology() {
    let dir = tempdir::TempDir::new("scenario").unwrap();
    {
        let mut engine = open_engine(config(dir.path())).unwrap();

        let mut ch1 = engine.get_channel("ch1");
        ch1.subscribe("").unwrap();
        ch1.subscribe("sub1").unwrap();
        ch1.push(b"one").unwrap();
        ch1.push(b"two").unwrap();
        drop(ch1);

        let mut ch2 = engine.get_channel("ch2");
        ch2.push(b"anon").unwrap();
        drop(ch2);

        engine.flush().unwrap();
        engine.close().unwrap();
    }

    let mut engine = open_engine(config(dir.path())).unwrap();

    let mut buf = Vec::new();
    let mut ch1 = engine.get_channel("ch1");
    assert!(ch1.pop_subscriber("", &mut buf).unwrap());
    assert_eq!(buf, b"one");
    assert!(ch1.pop_subscriber("sub1", &mut buf).unwrap());
    assert_eq!(buf, b"one");
    drop(ch1);

    let mut ch2 = engine.get_channel("ch2");
    assert!(ch2.pop(&mut buf).unwrap());
    assert_eq!(buf, b"anon");
}

#[test]
fn consumer_wake_up_round_robins_and_broadcasts() {
    let dir = tempdir::TempDir::new("scenario").unwrap();
    let mut engine = open_engine(config(dir.path())).unwrap();
    let mut channel = engine.get_channel("c");
    let storage = channel.subscribe("s1").unwrap();

    let hits: Rc<RefCell<Vec<(u8, ConsumerEvent)>>> = Rc::new(RefCell::new(Vec::new()));
    for listener_id in 1u8..=3 {
        let hits = hits.clone();
        storage.register_consumer(Box::new(move |event| {
            hits.borrow_mut().push((listener_id, event));
        }));
    }
    drop(channel);

    // Pushing to the channel fans out to every storage, including the
    // subscriber's, which is what actually drives its DataReady listeners.
    let mut channel = engine.get_channel("c");
    for _ in 0..6 {
        channel.push(b"x").unwrap();
    }
    let data_ready: Vec<u8> = hits
        .borrow()
        .iter()
        .filter(|(_, e)| *e == ConsumerEvent::DataReady)
        .map(|(id, _)| *id)
        .collect();
    assert_eq!(data_ready, vec![1, 2, 3, 1, 2, 3]);

    hits.borrow_mut().clear();
    drop(channel);
    engine.flush().unwrap();
    assert_eq!(hits.borrow().len(), 3);
    assert!(hits.borrow().iter().all(|(_, e)| *e == ConsumerEvent::Flush));
}

#[test]
fn head_minimize_drops_exactly_eleven_mib() {
    let dir = tempdir::TempDir::new("scenario").unwrap();
    let mut engine = open_engine(config(dir.path())).unwrap();
    if !engine.supports_head_truncation() {
        // collapse_range isn't available on this filesystem; flush() is a
        // no-op truncation-wise and the exact-byte-count assertion below
        // would not hold.
        return;
    }

    let payload = vec![b'x'; 20_000];
    for _ in 0..500 {
        engine.get_channel("ch1").push(&payload).unwrap();
        engine.get_channel("ch2").push(&payload).unwrap();
    }
    let mut buf = Vec::new();
    for _ in 0..300 {
        engine.get_channel("ch1").pop(&mut buf).unwrap();
        engine.get_channel("ch2").pop(&mut buf).unwrap();
    }

    let data_path = dir.path().join("overflow.dat");
    let before = std::fs::metadata(&data_path).unwrap().len();
    engine.flush().unwrap();
    let after = std::fs::metadata(&data_path).unwrap().len();
    assert_eq!(before - after, 11 * 1024 * 1024);

    for _ in 0..200 {
        assert!(engine.get_channel("ch1").pop(&mut buf).unwrap());
        assert_eq!(buf, payload);
        assert!(engine.get_channel("ch2").pop(&mut buf).unwrap());
        assert_eq!(buf, payload);
    }
}

/// Reproduces the mixed-layout directory of Scenario 5: some storages carry
/// an on-disk `.rq` ring dump plus extra records spilled to the shared
/// overflow file, others live purely in the overflow file with no dump at
/// all, and startup has to stitch both kinds back into the right channel
/// topology.
#[test]
fn loads_topology_from_prepared_files() {
    let dir = tempdir::TempDir::new("scenario").unwrap();
    let mut config = EngineConfig::new(dir.path().to_path_buf());
    // "Hello chN!" is 10 bytes, framed to 18 in the ring; sized so the
    // first push of a pair lands in the ring and the second spills to disk.
    config.ring_sizes = vec![
        RingSizeRule { prefix: "ch1".to_string(), capacity_bytes: 18 },
        RingSizeRule { prefix: "ch2".to_string(), capacity_bytes: 18 },
    ];
    // ch3/ch4/ch5 fall back to this: too small for anything, so every push
    // spills straight to the overflow file and no `.rq` dump is ever written.
    config.default_ring_capacity = 0;

    {
        let mut engine = open_engine(config.clone()).unwrap();

        let mut ch1 = engine.get_channel("ch1");
        ch1.subscribe("").unwrap();
        ch1.subscribe("sub1").unwrap();
        ch1.subscribe("sub2").unwrap();
        ch1.push(b"Hello ch1!").unwrap();
        ch1.push(b"Hello ch1!").unwrap();
        drop(ch1);

        engine.get_channel("ch2").push(b"Hello ch2!").unwrap();
        engine.get_channel("ch2").push(b"Hello ch2!").unwrap();

        let mut ch3 = engine.get_channel("ch3");
        ch3.subscribe("").unwrap();
        ch3.subscribe("sub1").unwrap();
        ch3.push(b"Hello ch3!").unwrap();
        drop(ch3);

        engine.get_channel("ch4").push(b"Hello ch4!").unwrap();

        let mut ch5 = engine.get_channel("ch5");
        ch5.subscribe("").unwrap();
        ch5.push(b"Hello ch5!").unwrap();
        drop(ch5);

        engine.close().unwrap();
    }

    assert!(dir.path().join("@ch1.rq").exists());
    assert!(dir.path().join("sub1@ch1.rq").exists());
    assert!(dir.path().join("sub2@ch1.rq").exists());
    assert!(dir.path().join("ch2.rq").exists());
    assert!(!dir.path().join("sub1@ch3.rq").exists());
    assert!(!dir.path().join("@ch5.rq").exists());
    assert!(!dir.path().join("ch4.rq").exists());

    let mut engine = open_engine(config).unwrap();
    let mut buf = Vec::new();

    let mut ch1 = engine.get_channel("ch1");
    for subscriber in ["", "sub1", "sub2"] {
        for _ in 0..2 {
            assert!(ch1.pop_subscriber(subscriber, &mut buf).unwrap());
            assert_eq!(buf, b"Hello ch1!");
        }
        assert!(!ch1.pop_subscriber(subscriber, &mut buf).unwrap());
    }
    drop(ch1);

    let mut ch2 = engine.get_channel("ch2");
    for _ in 0..2 {
        assert!(ch2.pop(&mut buf).unwrap());
        assert_eq!(buf, b"Hello ch2!");
    }
    assert!(!ch2.pop(&mut buf).unwrap());
    drop(ch2);

    let mut ch3 = engine.get_channel("ch3");
    for subscriber in ["", "sub1"] {
        assert!(ch3.pop_subscriber(subscriber, &mut buf).unwrap());
        assert_eq!(buf, b"Hello ch3!");
        assert!(!ch3.pop_subscriber(subscriber, &mut buf).unwrap());
    }
    drop(ch3);

    let mut ch4 = engine.get_channel("ch4");
    assert!(ch4.pop(&mut buf).unwrap());
    assert_eq!(buf, b"Hello ch4!");
    assert!(!ch4.pop(&mut buf).unwrap());
    drop(ch4);

    let mut ch5 = engine.get_channel("ch5");
    assert!(ch5.pop_subscriber("", &mut buf).unwrap());
    assert_eq!(buf, b"Hello ch5!");
    assert!(!ch5.pop_subscriber("", &mut buf).unwrap());
}
