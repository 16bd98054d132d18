#![allow(dead_code)]

use async_trait::async_trait;
use deauth_collector::config::Protocol;
use deauth_collector::error::PersistenceFault;
use deauth_collector::parser::{DeauthEvent, FRAME_SIZE};
use deauth_collector::persistence::EventSink;
use deauth_collector::serial::{Connect, Link};
use deauth_collector::service::CollectorSettings;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Hands out pre-built links in order; once exhausted every attempt fails.
pub struct Scripted {
    links: VecDeque<std::io::Result<Link>>,
}

impl Scripted {
    pub fn new(links: Vec<std::io::Result<Link>>) -> Self {
        Self {
            links: links.into(),
        }
    }
}

#[async_trait]
impl Connect for Scripted {
    fn describe(&self) -> &str {
        "scripted"
    }

    async fn connect(&mut self) -> std::io::Result<Link> {
        self.links.pop_front().unwrap_or_else(|| Err(unplugged()))
    }
}

pub fn unplugged() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotFound, "device unplugged")
}

pub fn link(mock: tokio_test::io::Mock) -> std::io::Result<Link> {
    Ok(Box::new(mock))
}

pub fn frame(attacker_last: u8, rssi: i8) -> [u8; FRAME_SIZE] {
    let mut frame = [
        0x00, 0x4B, 0x12, 0x3C, 0x04, attacker_last, 0x78, 0x1C, 0x3C, 0x2D, 0x15, 0xD4, 0,
    ];
    frame[12] = rssi.to_ne_bytes()[0];
    frame
}

pub fn settings(protocol: Protocol) -> CollectorSettings {
    CollectorSettings {
        service_name: "it".to_string(),
        protocol,
        window_size: 100,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
    }
}

/// Keeps every offered event in memory and refuses the ones listed in `fail_on`
/// (zero-based offer index).
#[derive(Clone, Default)]
pub struct MemorySink {
    pub offered: Arc<Mutex<Vec<DeauthEvent>>>,
    pub stored: Arc<Mutex<Vec<DeauthEvent>>>,
    fail_on: Arc<HashSet<usize>>,
}

impl MemorySink {
    pub fn failing_on(indices: &[usize]) -> Self {
        Self {
            fail_on: Arc::new(indices.iter().copied().collect()),
            ..Self::default()
        }
    }

    pub fn stored_rssi(&self) -> Vec<i8> {
        self.stored.lock().unwrap().iter().map(|e| e.rssi()).collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn record(&mut self, event: &DeauthEvent) -> Result<(), PersistenceFault> {
        let index = {
            let mut offered = self.offered.lock().unwrap();
            offered.push(event.clone());
            offered.len() - 1
        };
        if self.fail_on.contains(&index) {
            return Err(PersistenceFault("disk full".to_string()));
        }
        self.stored.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub fn write_config(dir: &std::path::Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("deauth-collector.toml");
    let body = format!(
        "service_name = \"e2e\"\nlog_level = \"warn\"\ndatabase_path = \"{}\"\ndata_directory = \"{}\"\n{extra}\n",
        dir.join("events.db").display(),
        dir.join("data").display(),
    );
    std::fs::write(&path, body).expect("write config");
    path
}
