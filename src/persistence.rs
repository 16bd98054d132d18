use crate::config::{AppConfig, SinkKind};
use crate::error::PersistenceFault;
use crate::parser::{DeauthEvent, MacAddr};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::AsyncWriteExt,
};

/// Destination for decoded events. Rows are only ever appended.
#[async_trait]
pub trait EventSink: Send {
    fn name(&self) -> &'static str;

    async fn record(&mut self, event: &DeauthEvent) -> Result<(), PersistenceFault>;

    /// Flushes anything buffered. Called once when the collector stops.
    async fn close(&mut self) -> Result<(), PersistenceFault> {
        Ok(())
    }
}

/// Builds the sink selected in the configuration.
pub async fn open_sink(config: &AppConfig, kind: SinkKind) -> Result<Box<dyn EventSink>> {
    let sink: Box<dyn EventSink> = match kind {
        SinkKind::Sqlite => Box::new(
            SqliteStore::open(&config.database_path)
                .with_context(|| format!("open event store {}", config.database_path))?,
        ),
        SinkKind::Journal => Box::new(
            JournalSink::new(&config.data_directory)
                .await
                .context("prepare journal directory")?,
        ),
        SinkKind::Console => Box::new(ConsoleSink::stdout()),
    };
    Ok(sink)
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL
        DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000000.0 AS INTEGER)),
    attacker_mac TEXT NOT NULL,
    sensor_mac TEXT NOT NULL,
    rssi INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
";

/// A row of the `events` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    /// Reception time assigned by the store, microseconds since the Unix epoch.
    pub timestamp_us: i64,
    pub attacker_mac: MacAddr,
    pub sensor_mac: MacAddr,
    pub rssi: i8,
}

impl StoredEvent {
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.timestamp_us)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp_us: row.get(1)?,
            attacker_mac: mac_column(row, 2)?,
            sensor_mac: mac_column(row, 3)?,
            rssi: row.get(4)?,
        })
    }
}

fn mac_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<MacAddr> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|reason: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            reason.into(),
        )
    })
}

/// SQLite-backed append-only event store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self::with_connection(conn)?)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn count(&self) -> rusqlite::Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Every row in arrival order.
    pub fn events(&self) -> rusqlite::Result<Vec<StoredEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, attacker_mac, sensor_mac, rssi FROM events ORDER BY id",
        )?;
        let rows = stmt.query_map([], StoredEvent::from_row)?;
        rows.collect()
    }

    /// The newest `limit` rows, oldest first.
    pub fn recent(&self, limit: usize) -> rusqlite::Result<Vec<StoredEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, attacker_mac, sensor_mac, rssi FROM events
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], StoredEvent::from_row)?;
        let mut events = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }

    /// Rows whose reception time falls in `[from_us, to_us]`, ordered by
    /// attacker then time.
    pub fn events_between(&self, from_us: i64, to_us: i64) -> rusqlite::Result<Vec<StoredEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, attacker_mac, sensor_mac, rssi FROM events
             WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY attacker_mac, timestamp, id",
        )?;
        let rows = stmt.query_map(params![from_us, to_us], StoredEvent::from_row)?;
        rows.collect()
    }
}

/// Groups rows by attacker, keeping each group's order.
pub fn group_by_attacker(events: Vec<StoredEvent>) -> BTreeMap<MacAddr, Vec<StoredEvent>> {
    let mut grouped: BTreeMap<MacAddr, Vec<StoredEvent>> = BTreeMap::new();
    for event in events {
        grouped.entry(event.attacker_mac).or_default().push(event);
    }
    grouped
}

#[async_trait]
impl EventSink for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn record(&mut self, event: &DeauthEvent) -> Result<(), PersistenceFault> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO events (attacker_mac, sensor_mac, rssi) VALUES (?1, ?2, ?3)",
        )?;
        stmt.execute(params![
            event.attacker_mac().to_string(),
            event.sensor_mac().to_string(),
            i64::from(event.rssi()),
        ])?;
        Ok(())
    }
}

/// Daily rotating JSON-lines journal, one event per line.
pub struct JournalSink {
    base: PathBuf,
    date: Option<NaiveDate>,
    file: Option<File>,
}

impl JournalSink {
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base = base_dir.as_ref().to_path_buf();
        create_dir_all(&base)
            .await
            .with_context(|| format!("failed to create data directory {}", base.display()))?;
        Ok(Self {
            base,
            date: None,
            file: None,
        })
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.base
            .join(format!("deauth-{}.log", date.format("%Y-%m-%d")))
    }

    async fn open_file(&self, date: NaiveDate) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(date))
            .await
    }

    pub fn current_path(&self) -> PathBuf {
        self.path_for(self.date.unwrap_or_else(|| Utc::now().date_naive()))
    }
}

#[async_trait]
impl EventSink for JournalSink {
    fn name(&self) -> &'static str {
        "journal"
    }

    async fn record(&mut self, event: &DeauthEvent) -> Result<(), PersistenceFault> {
        let day = event.timestamp().date_naive();
        if self.date != Some(day) || self.file.is_none() {
            self.file = Some(self.open_file(day).await?);
            self.date = Some(day);
        }
        let mut line = event.to_persistence_line()?;
        line.push('\n');
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = write_line(file, &line).await {
                // Reopen on the next event rather than keep writing to a broken handle.
                self.file = None;
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PersistenceFault> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

async fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

/// Print-only sink: one human-readable line per event.
pub struct ConsoleSink {
    out: Box<dyn Write + Send>,
}

impl ConsoleSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

#[async_trait]
impl EventSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn record(&mut self, event: &DeauthEvent) -> Result<(), PersistenceFault> {
        writeln!(
            self.out,
            "{} attacker={} sensor={} rssi={} dBm",
            event.timestamp().to_rfc3339(),
            event.attacker_mac(),
            event.sensor_mac(),
            event.rssi()
        )?;
        self.out.flush()?;
        Ok(())
    }
}
