mod common;

use common::{frame, link, settings, unplugged, MemorySink, Scripted};
use deauth_collector::config::Protocol;
use deauth_collector::metrics::Metrics;
use deauth_collector::persistence::SqliteStore;
use deauth_collector::serial::{Link, SerialTransport};
use deauth_collector::service::{Collector, CollectorState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn transport(connector: Scripted) -> SerialTransport<Scripted> {
    SerialTransport::with_connector(connector, Duration::from_millis(100))
        .await
        .expect("open transport")
}

#[tokio::test]
async fn persists_events_in_arrival_order() {
    let tmp = tempdir().expect("temp dir");
    let db = tmp.path().join("events.db");
    let store = SqliteStore::open(&db).expect("store");

    let a = frame(0xB0, -60);
    let b = frame(0xB1, -55);
    let c = frame(0xB2, -70);
    // Frames arrive split across arbitrary read boundaries.
    let mock = tokio_test::io::Builder::new()
        .read(&a[..4])
        .read(&[&a[4..], &b[..10]].concat())
        .read(&[&b[10..], &c[..]].concat())
        .build();
    let transport = transport(Scripted::new(vec![link(mock)])).await;

    let metrics = Arc::new(Metrics::new());
    let collector = Collector::new(
        settings(Protocol::Binary),
        transport,
        Box::new(store),
        metrics.clone(),
    );
    let mut stats = collector.subscribe_stats();
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let handle = tokio::spawn(collector.run(shutdown_rx));

    timeout(WAIT, stats.wait_for(|s| s.map(|s| s.samples) == Some(3)))
        .await
        .expect("three events ingested")
        .expect("stats channel open");
    let live = stats.borrow().expect("snapshot");
    assert_eq!(live.current, -70);
    assert_eq!(live.min, -70);
    assert_eq!(live.max, -55);

    shutdown_tx.send(()).unwrap();
    let health = timeout(WAIT, handle)
        .await
        .expect("collector stops")
        .expect("join")
        .expect("clean shutdown");
    assert_eq!(health.frames, 3);
    assert_eq!(health.persisted, 3);
    assert_eq!(health.dropped_events, 0);

    let rows = SqliteStore::open(&db).unwrap().events().unwrap();
    let macs: Vec<String> = rows.iter().map(|r| r.attacker_mac.to_string()).collect();
    assert_eq!(
        macs,
        vec!["00:4B:12:3C:04:B0", "00:4B:12:3C:04:B1", "00:4B:12:3C:04:B2"]
    );
    assert_eq!(rows.iter().map(|r| r.rssi).collect::<Vec<_>>(), vec![-60, -55, -70]);
    assert!(rows.iter().all(|r| r.sensor_mac.to_string() == "78:1C:3C:2D:15:D4"));
}

#[tokio::test]
async fn resumes_after_link_fault_without_misalignment() {
    let before = frame(0x01, -40);
    let after = frame(0x02, -45);
    let first = tokio_test::io::Builder::new()
        .read(&before)
        // Half a frame, then the cable is pulled.
        .read(&frame(0xEE, -1)[..6])
        .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"))
        .build();
    let second = tokio_test::io::Builder::new().read(&after).build();
    let connector = Scripted::new(vec![
        link(first),
        Err(unplugged()),
        link(second),
    ]);

    let sink = MemorySink::default();
    let metrics = Arc::new(Metrics::new());
    let collector = Collector::new(
        settings(Protocol::Binary),
        transport(connector).await,
        Box::new(sink.clone()),
        metrics.clone(),
    );
    let mut stats = collector.subscribe_stats();
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let handle = tokio::spawn(collector.run(shutdown_rx));

    timeout(WAIT, stats.wait_for(|s| s.map(|s| s.samples) == Some(2)))
        .await
        .expect("both events ingested")
        .expect("stats channel open");
    shutdown_tx.send(()).unwrap();
    let health = timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

    assert_eq!(sink.stored_rssi(), vec![-40, -45]);
    assert!(health.transport_faults >= 2);
    assert!(health.reconnects >= 2);
    assert_eq!(health.frames, 2);
}

#[tokio::test]
async fn persistence_fault_drops_event_but_keeps_ingesting() {
    let mut bytes = Vec::new();
    for (i, rssi) in [-50i8, -51, -52].into_iter().enumerate() {
        bytes.extend_from_slice(&frame(i as u8, rssi));
    }
    let mock = tokio_test::io::Builder::new().read(&bytes).build();
    let sink = MemorySink::failing_on(&[1]);
    let metrics = Arc::new(Metrics::new());
    let collector = Collector::new(
        settings(Protocol::Binary),
        transport(Scripted::new(vec![link(mock)])).await,
        Box::new(sink.clone()),
        metrics.clone(),
    );
    let mut stats = collector.subscribe_stats();
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let handle = tokio::spawn(collector.run(shutdown_rx));

    timeout(WAIT, stats.wait_for(|s| s.map(|s| s.samples) == Some(3)))
        .await
        .unwrap()
        .unwrap();
    shutdown_tx.send(()).unwrap();
    let health = timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

    // Every event reached the statistics and was offered to the sink in order.
    let offered: Vec<i8> = sink.offered.lock().unwrap().iter().map(|e| e.rssi()).collect();
    assert_eq!(offered, vec![-50, -51, -52]);
    assert_eq!(sink.stored_rssi(), vec![-50, -52]);
    assert_eq!(health.dropped_events, 1);
    assert_eq!(health.persisted, 2);
    assert_eq!(metrics.snapshot().dropped_events, 1);
}

#[tokio::test]
async fn cancellation_stops_an_idle_collector() {
    let (_writer, reader) = tokio::io::duplex(64);
    let connector = Scripted::new(vec![Ok(Box::new(reader) as Link)]);
    let transport = SerialTransport::with_connector(connector, Duration::from_millis(20))
        .await
        .unwrap();
    let collector = Collector::new(
        settings(Protocol::Binary),
        transport,
        Box::new(MemorySink::default()),
        Arc::new(Metrics::new()),
    );
    assert_eq!(collector.state(), CollectorState::Starting);
    let mut state = collector.subscribe_state();
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let handle = tokio::spawn(collector.run(shutdown_rx));

    timeout(WAIT, state.wait_for(|s| *s == CollectorState::Running))
        .await
        .unwrap()
        .unwrap();
    shutdown_tx.send(()).unwrap();
    let health = timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(*state.borrow(), CollectorState::Stopped);
    assert_eq!(health.frames, 0);
    assert!(health.empty_polls >= 1);
}

#[tokio::test]
async fn dropped_shutdown_sender_stops_the_loop() {
    let (_writer, reader) = tokio::io::duplex(64);
    let connector = Scripted::new(vec![Ok(Box::new(reader) as Link)]);
    let transport = SerialTransport::with_connector(connector, Duration::from_millis(20))
        .await
        .unwrap();
    let collector = Collector::new(
        settings(Protocol::Binary),
        transport,
        Box::new(MemorySink::default()),
        Arc::new(Metrics::new()),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    drop(shutdown_tx);
    timeout(WAIT, collector.run(shutdown_rx))
        .await
        .expect("collector stops")
        .expect("clean shutdown");
}

#[tokio::test]
async fn legacy_lines_feed_statistics_and_skip_garbage() {
    let mock = tokio_test::io::Builder::new()
        .read(b"{\"timestamp\": 1, \"rssi\": -70, \"source_mac\": \"00:11:22:33:44:55\"}\r\n")
        .read(b"garbage{\n\n")
        .read(b"{\"timestamp\": 2, \"rssi\": -60, \"source_mac\": \"00:11:22:33:44:55\"}\n")
        .build();
    let sink = MemorySink::default();
    let metrics = Arc::new(Metrics::new());
    let collector = Collector::new(
        settings(Protocol::JsonLines),
        transport(Scripted::new(vec![link(mock)])).await,
        Box::new(sink.clone()),
        metrics.clone(),
    );
    let mut stats = collector.subscribe_stats();
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let handle = tokio::spawn(collector.run(shutdown_rx));

    timeout(WAIT, stats.wait_for(|s| s.map(|s| s.samples) == Some(2)))
        .await
        .unwrap()
        .unwrap();
    let live = stats.borrow().unwrap();
    assert_eq!(live.mean, -65.0);
    shutdown_tx.send(()).unwrap();
    let health = timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

    assert_eq!(health.malformed_lines, 1);
    assert!(sink.offered.lock().unwrap().is_empty());
}
