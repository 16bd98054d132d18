use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{
    signal,
    sync::watch,
    time::{sleep, Duration},
};

use crate::config::{AppConfig, Protocol, SinkKind};
use crate::metrics::{self, HealthSnapshot, Metrics};
use crate::parser::{DeauthEvent, RssiReport, FRAME_SIZE};
use crate::persistence::{self, EventSink};
use crate::serial::{Connect, DeviceConnector, ReadOutcome, SerialTransport};
use crate::window::{RollingWindow, StatsSnapshot};

/// Longest legacy JSON line accepted before the stream is considered corrupt.
pub const MAX_LINE_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Per-event work shared by the live collector and capture replay:
/// decode, update statistics, offer to the sink, publish the snapshot.
pub struct Pipeline {
    sink: Box<dyn EventSink>,
    window: RollingWindow,
    metrics: Arc<Metrics>,
    stats: watch::Sender<Option<StatsSnapshot>>,
}

impl Pipeline {
    pub fn new(sink: Box<dyn EventSink>, window_size: usize, metrics: Arc<Metrics>) -> Self {
        let (stats, _) = watch::channel(None);
        Self {
            sink,
            window: RollingWindow::new(window_size),
            metrics,
            stats,
        }
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<Option<StatsSnapshot>> {
        self.stats.subscribe()
    }

    /// Runs one binary frame through the pipeline. Persistence faults are
    /// counted and logged; only contract violations come back as errors.
    pub async fn ingest(&mut self, frame: &[u8]) -> Result<StatsSnapshot> {
        let event = DeauthEvent::decode(frame).context("transport delivered a mis-sized frame")?;
        self.metrics.record_frame();
        self.window.push(event.rssi());

        match self.sink.record(&event).await {
            Ok(()) => self.metrics.record_persisted(),
            Err(err) => {
                self.metrics.record_persistence_error();
                tracing::error!(
                    sink = self.sink.name(),
                    error = %err,
                    attacker = %event.attacker_mac(),
                    dropped_events = self.metrics.snapshot().dropped_events,
                    "event dropped from durable storage"
                );
            }
        }

        let snapshot = self.window.snapshot()?;
        tracing::info!(
            attacker = %event.attacker_mac(),
            sensor = %event.sensor_mac(),
            rssi = event.rssi(),
            mean = format_args!("{:.2}", snapshot.mean),
            min = snapshot.min,
            max = snapshot.max,
            stddev = format_args!("{:.2}", snapshot.stddev),
            "deauth event"
        );
        self.stats.send_replace(Some(snapshot));
        Ok(snapshot)
    }

    /// Feeds a legacy line report into the statistics. Reports are not persisted.
    pub fn observe(&mut self, report: &RssiReport) -> Result<StatsSnapshot> {
        self.metrics.record_frame();
        self.window.push(report.rssi);
        let snapshot = self.window.snapshot()?;
        tracing::info!(
            source = %report.source_mac,
            rssi = report.rssi,
            mean = format_args!("{:.2}", snapshot.mean),
            min = snapshot.min,
            max = snapshot.max,
            stddev = format_args!("{:.2}", snapshot.stddev),
            "rssi report"
        );
        self.stats.send_replace(Some(snapshot));
        Ok(snapshot)
    }

    pub async fn close(&mut self) {
        if let Err(err) = self.sink.close().await {
            self.metrics.record_persistence_error();
            tracing::error!(sink = self.sink.name(), error = %err, "sink close failed");
        }
    }
}

/// Exponential retry delay for transport faults.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub service_name: String,
    pub protocol: Protocol,
    pub window_size: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl CollectorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let (initial_backoff, max_backoff) = config.backoff();
        Self {
            service_name: config.service_name.clone(),
            protocol: config.protocol,
            window_size: config.window_size,
            initial_backoff,
            max_backoff,
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// The ingestion loop for one serial link.
pub struct Collector<C: Connect = DeviceConnector> {
    name: Arc<String>,
    protocol: Protocol,
    transport: SerialTransport<C>,
    pipeline: Pipeline,
    metrics: Arc<Metrics>,
    backoff: Backoff,
    state: watch::Sender<CollectorState>,
}

impl<C: Connect> Collector<C> {
    /// Takes ownership of an opened transport and sink.
    pub fn new(
        settings: CollectorSettings,
        transport: SerialTransport<C>,
        sink: Box<dyn EventSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(CollectorState::Starting);
        Self {
            name: Arc::new(settings.service_name),
            protocol: settings.protocol,
            transport,
            pipeline: Pipeline::new(sink, settings.window_size, metrics.clone()),
            metrics,
            backoff: Backoff::new(settings.initial_backoff, settings.max_backoff),
            state,
        }
    }

    pub fn state(&self) -> CollectorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CollectorState> {
        self.state.subscribe()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<Option<StatsSnapshot>> {
        self.pipeline.subscribe_stats()
    }

    /// Ingests until `shutdown` fires (or its sender goes away), then
    /// releases the transport and sink. Cancellation is checked between
    /// reads, so it takes effect within one read timeout.
    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) -> Result<HealthSnapshot> {
        self.set_state(CollectorState::Running);
        let result = loop {
            if shutdown.has_changed().unwrap_or(true) {
                tracing::info!(service = %self.name, "shutdown requested");
                break Ok(());
            }
            match self.step(&mut shutdown).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.set_state(CollectorState::Stopping);
        self.transport.close();
        self.pipeline.close().await;
        self.set_state(CollectorState::Stopped);

        let health = self.metrics.snapshot();
        tracing::info!(
            service = %self.name,
            frames = health.frames,
            persisted = health.persisted,
            dropped_events = health.dropped_events,
            transport_faults = health.transport_faults,
            reconnects = health.reconnects,
            "collector stopped"
        );
        result.map(|()| health)
    }

    async fn step(&mut self, shutdown: &mut watch::Receiver<()>) -> Result<Flow> {
        let outcome = match self.protocol {
            Protocol::Binary => match self.transport.read_frame(FRAME_SIZE).await {
                Ok(ReadOutcome::Ready(frame)) => {
                    self.pipeline.ingest(&frame).await?;
                    Ok(true)
                }
                Ok(ReadOutcome::NoData) => Ok(false),
                Err(err) => Err(err),
            },
            Protocol::JsonLines => match self.transport.read_line(MAX_LINE_LEN).await {
                Ok(ReadOutcome::Ready(line)) => {
                    self.handle_line(&line)?;
                    Ok(true)
                }
                Ok(ReadOutcome::NoData) => Ok(false),
                Err(err) => Err(err),
            },
        };

        self.metrics.set_reconnects(self.transport.reconnects());
        match outcome {
            Ok(true) => {
                self.backoff.reset();
                Ok(Flow::Continue)
            }
            Ok(false) => {
                self.backoff.reset();
                self.metrics.record_empty_poll();
                tokio::task::yield_now().await;
                Ok(Flow::Continue)
            }
            Err(err) => {
                self.metrics.record_transport_fault();
                let delay = self.backoff.next_delay();
                tracing::warn!(
                    service = %self.name,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "serial read failed"
                );
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!(service = %self.name, "shutdown requested during backoff");
                        Ok(Flow::Stop)
                    }
                    _ = sleep(delay) => Ok(Flow::Continue),
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }
        match RssiReport::from_line(line) {
            Ok(report) => {
                self.pipeline.observe(&report)?;
            }
            Err(err) => {
                self.metrics.record_malformed_line();
                tracing::warn!(
                    service = %self.name,
                    error = %err,
                    line = %line,
                    "malformed line skipped"
                );
            }
        }
        Ok(())
    }

    fn set_state(&self, next: CollectorState) {
        self.state.send_replace(next);
        tracing::debug!(service = %self.name, state = ?next, "collector state");
    }
}

/// Process-level wiring: opens resources, runs the collector and the
/// health heartbeat, and turns OS signals into cancellation.
pub struct Service {
    config: AppConfig,
    sink: SinkKind,
}

impl Service {
    pub fn new(config: AppConfig) -> Self {
        let sink = config.sink;
        Self { config, sink }
    }

    pub fn with_sink(mut self, sink: SinkKind) -> Self {
        self.sink = sink;
        self
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let port = config
            .serial_port
            .clone()
            .context("serial_port is not configured")?;

        tracing::info!(
            service = %config.service_name,
            port = %port,
            baud_rate = config.baud_rate,
            protocol = ?config.protocol,
            sink = ?self.sink,
            window = config.window_size,
            "collector starting"
        );
        let transport = SerialTransport::open(&port, config.baud_rate, config.read_timeout())
            .await
            .with_context(|| format!("unable to open serial device {port}"))?;
        let sink = persistence::open_sink(&config, self.sink)
            .await
            .context("prepare persistence backend")?;

        let metrics = Arc::new(Metrics::new());
        let collector = Collector::new(
            CollectorSettings::from_config(&config),
            transport,
            sink,
            metrics.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let service_name = Arc::new(config.service_name.clone());

        let health_handle = tokio::spawn(metrics::monitor_health(
            service_name.clone(),
            metrics,
            shutdown_rx.clone(),
            Duration::from_secs(config.heartbeat_seconds),
            Duration::from_secs(config.idle_threshold_seconds),
        ));

        let signal_handle = {
            let service_name = service_name.clone();
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                wait_for_signal().await;
                tracing::info!(service = %service_name, "signal received, requesting shutdown");
                shutdown_tx.send(()).ok();
            })
        };

        let result = collector.run(shutdown_rx).await;

        signal_handle.abort();
        shutdown_tx.send(()).ok();
        health_handle.await??;

        result.map(|_| ())
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable, using ctrl-c only");
                signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.ok();
    }
}
