use crate::{
    config::SinkKind,
    metrics::{HealthSnapshot, Metrics},
    parser::FRAME_SIZE,
    persistence,
    service::Pipeline,
    AppConfig,
};
use anyhow::{Context, Result};
use std::{path::Path, sync::Arc};
use tokio::fs;

/// Replays a binary capture (back-to-back 13-byte records) through the same
/// decode, statistics and persistence path as the live collector.
pub async fn replay_capture(
    capture_path: impl AsRef<Path>,
    config: &AppConfig,
    sink: SinkKind,
) -> Result<HealthSnapshot> {
    let capture_path = capture_path.as_ref();
    let raw = fs::read(capture_path)
        .await
        .with_context(|| format!("open capture {}", capture_path.display()))?;

    let metrics = Arc::new(Metrics::new());
    let sink = persistence::open_sink(config, sink)
        .await
        .context("prepare persistence backend")?;
    let mut pipeline = Pipeline::new(sink, config.window_size, metrics.clone());

    let (frames, trailing) = split_frames(&raw);
    for frame in frames {
        pipeline.ingest(frame).await?;
    }
    if !trailing.is_empty() {
        tracing::warn!(
            capture = %capture_path.display(),
            trailing_bytes = trailing.len(),
            "capture ends with a partial frame; ignored"
        );
    }
    pipeline.close().await;

    let snapshot = metrics.snapshot();
    tracing::info!(
        capture = %capture_path.display(),
        frames = snapshot.frames,
        persisted = snapshot.persisted,
        dropped_events = snapshot.dropped_events,
        "capture replay completed"
    );
    Ok(snapshot)
}

fn split_frames(raw: &[u8]) -> (std::slice::ChunksExact<'_, u8>, &[u8]) {
    let chunks = raw.chunks_exact(FRAME_SIZE);
    let trailing = chunks.remainder();
    (chunks, trailing)
}
