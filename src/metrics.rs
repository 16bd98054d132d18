use anyhow::Result;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Counters the operator watches instead of expecting zero loss.
#[derive(Debug, Default)]
pub struct Metrics {
    frames: AtomicU64,
    persisted: AtomicU64,
    persistence_errors: AtomicU64,
    transport_faults: AtomicU64,
    reconnects: AtomicU64,
    empty_polls: AtomicU64,
    malformed_lines: AtomicU64,
    last_frame: Mutex<Option<Instant>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_frame.lock() {
            *guard = Some(Instant::now());
        }
    }

    pub fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    /// An event was decoded but never reached durable storage.
    pub fn record_persistence_error(&self) {
        self.persistence_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_fault(&self) {
        self.transport_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Mirrors the transport's running count of reconnection attempts.
    pub fn set_reconnects(&self, total: u64) {
        self.reconnects.store(total, Ordering::Relaxed);
    }

    pub fn record_empty_poll(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_line(&self) {
        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let last_frame_age = self.last_frame.lock().ok().and_then(|guard| {
            guard.map(|instant| Instant::now().saturating_duration_since(instant))
        });
        HealthSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            dropped_events: self.persistence_errors.load(Ordering::Relaxed),
            transport_faults: self.transport_faults.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            last_frame_age,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub frames: u64,
    pub persisted: u64,
    pub dropped_events: u64,
    pub transport_faults: u64,
    pub reconnects: u64,
    pub empty_polls: u64,
    pub malformed_lines: u64,
    #[serde(skip)]
    pub last_frame_age: Option<Duration>,
}

/// Logs the counters every `period` and warns when the sensor goes quiet.
pub async fn monitor_health(
    service_name: Arc<String>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<()>,
    period: Duration,
    idle_threshold: Duration,
) -> Result<()> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let snapshot = metrics.snapshot();
                tracing::info!(
                    service = %service_name,
                    frames = snapshot.frames,
                    persisted = snapshot.persisted,
                    dropped_events = snapshot.dropped_events,
                    transport_faults = snapshot.transport_faults,
                    reconnects = snapshot.reconnects,
                    malformed_lines = snapshot.malformed_lines,
                    "health heartbeat"
                );
                if let Some(age) = snapshot.last_frame_age {
                    if age > idle_threshold {
                        tracing::warn!(
                            service = %service_name,
                            idle_seconds = ?age.as_secs_f64(),
                            "no frames in the last {} seconds",
                            idle_threshold.as_secs()
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_independent() {
        let metrics = Metrics::new();
        metrics.record_frame();
        metrics.record_frame();
        metrics.record_persisted();
        metrics.record_persistence_error();
        metrics.record_transport_fault();
        metrics.set_reconnects(3);
        metrics.record_empty_poll();
        metrics.record_malformed_line();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames, 2);
        assert_eq!(snap.persisted, 1);
        assert_eq!(snap.dropped_events, 1);
        assert_eq!(snap.transport_faults, 1);
        assert_eq!(snap.reconnects, 3);
        assert_eq!(snap.empty_polls, 1);
        assert_eq!(snap.malformed_lines, 1);
        assert!(snap.last_frame_age.is_some());
    }

    #[test]
    fn no_frame_means_no_age() {
        assert!(Metrics::new().snapshot().last_frame_age.is_none());
    }

    #[tokio::test]
    async fn heartbeat_stops_on_shutdown() {
        let (tx, rx) = watch::channel(());
        let handle = tokio::spawn(monitor_health(
            Arc::new("test".to_string()),
            Arc::new(Metrics::new()),
            rx,
            Duration::from_millis(10),
            Duration::from_secs(30),
        ));
        tokio::time::sleep(Duration::from_millis(35)).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
