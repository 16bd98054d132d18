use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::SerialPortBuilderExt;

#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;

/// A connected byte stream from the sensor gateway.
pub type Link = Box<dyn AsyncRead + Unpin + Send>;

/// Opens the physical link. The transport calls this at startup and again
/// after every fault.
#[async_trait]
pub trait Connect: Send {
    /// Human-readable name of the device, used in logs and errors.
    fn describe(&self) -> &str;

    async fn connect(&mut self) -> std::io::Result<Link>;
}

/// Connects to a serial device, or to a FIFO when the path names one (bench
/// setups bridge a virtual port with `socat`).
pub struct DeviceConnector {
    port: String,
    baud_rate: u32,
}

impl DeviceConnector {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

#[async_trait]
impl Connect for DeviceConnector {
    fn describe(&self) -> &str {
        &self.port
    }

    async fn connect(&mut self) -> std::io::Result<Link> {
        let metadata = tokio::fs::metadata(&self.port).await?;
        if is_fifo(&metadata) {
            return open_fifo(&self.port);
        }
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .open_native_async()
            .map_err(std::io::Error::from)?;
        Ok(Box::new(stream))
    }
}

#[cfg(unix)]
fn is_fifo(metadata: &std::fs::Metadata) -> bool {
    metadata.file_type().is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// Opens the read end without waiting for a writer to appear.
#[cfg(unix)]
fn open_fifo(path: &str) -> std::io::Result<Link> {
    let mut options = tokio::net::unix::pipe::OpenOptions::new();
    // Holding the write side too keeps reads pending instead of hitting EOF
    // while the bridge has no writer attached.
    #[cfg(target_os = "linux")]
    options.read_write(true);
    Ok(Box::new(options.open_receiver(path)?))
}

#[cfg(not(unix))]
fn open_fifo(path: &str) -> std::io::Result<Link> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{path} is a FIFO, which this platform cannot open"),
    ))
}

/// Result of a bounded read: either a complete unit or nothing yet.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    Ready(T),
    /// The read timeout elapsed first; try again.
    NoData,
}

/// Owns the serial link and hands out complete frames or lines.
///
/// Bytes that arrive before a timeout are kept for the next call so stream
/// position is never lost. A fault drops the link together with any partial
/// bytes, and the next read reconnects before reading.
pub struct SerialTransport<C: Connect = DeviceConnector> {
    connector: C,
    link: Option<Link>,
    pending: Vec<u8>,
    scratch: Vec<u8>,
    read_timeout: Duration,
    reconnects: u64,
}

impl SerialTransport<DeviceConnector> {
    pub async fn open(
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        Self::with_connector(DeviceConnector::new(port, baud_rate), read_timeout).await
    }
}

impl<C: Connect> SerialTransport<C> {
    /// Establishes the initial connection. Failure here is not retried.
    pub async fn with_connector(
        mut connector: C,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let attempt = timeout(read_timeout, connector.connect()).await;
        let link = match attempt {
            Ok(Ok(link)) => link,
            Ok(Err(source)) => {
                return Err(TransportError::Unavailable {
                    port: connector.describe().to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::Unavailable {
                    port: connector.describe().to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "timed out opening device",
                    ),
                })
            }
        };
        tracing::info!(port = %connector.describe(), "serial link open");
        Ok(Self {
            connector,
            link: Some(link),
            pending: Vec::with_capacity(256),
            scratch: vec![0u8; 512],
            read_timeout,
            reconnects: 0,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Bytes received but not yet handed out.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Number of reconnection attempts made after faults.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Waits up to the read timeout for `frame_size` bytes and returns exactly that many.
    pub async fn read_frame(
        &mut self,
        frame_size: usize,
    ) -> Result<ReadOutcome<Vec<u8>>, TransportError> {
        self.ensure_link().await?;
        let deadline = Instant::now() + self.read_timeout;
        if !self.fill(deadline, |pending| pending.len() >= frame_size).await? {
            return Ok(ReadOutcome::NoData);
        }
        Ok(ReadOutcome::Ready(self.pending.drain(..frame_size).collect()))
    }

    /// Waits up to the read timeout for one newline-terminated line, CR/LF trimmed.
    pub async fn read_line(
        &mut self,
        max_len: usize,
    ) -> Result<ReadOutcome<String>, TransportError> {
        self.ensure_link().await?;
        let deadline = Instant::now() + self.read_timeout;
        let complete = self
            .fill(deadline, |pending| {
                pending.contains(&b'\n') || pending.len() > max_len
            })
            .await?;
        if !complete {
            return Ok(ReadOutcome::NoData);
        }
        match self.pending.iter().position(|&b| b == b'\n') {
            Some(end) if end <= max_len => {
                let raw: Vec<u8> = self.pending.drain(..=end).collect();
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                Ok(ReadOutcome::Ready(line))
            }
            _ => Err(self.fault(format!("line exceeds {max_len} bytes"))),
        }
    }

    /// Drops the link. Safe to call more than once.
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            tracing::info!(port = %self.connector.describe(), "serial link closed");
        }
        self.pending.clear();
    }

    async fn ensure_link(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Ok(());
        }
        self.reconnects += 1;
        tracing::info!(
            port = %self.connector.describe(),
            attempt = self.reconnects,
            "reconnecting serial link"
        );
        match timeout(self.read_timeout, self.connector.connect()).await {
            Ok(Ok(link)) => {
                self.link = Some(link);
                self.pending.clear();
                tracing::info!(port = %self.connector.describe(), "serial link restored");
                Ok(())
            }
            Ok(Err(err)) => Err(self.fault(format!("reconnect failed: {err}"))),
            Err(_) => Err(self.fault("reconnect timed out")),
        }
    }

    /// Reads until `ready` holds for the pending buffer or the deadline passes.
    async fn fill<F>(&mut self, deadline: Instant, ready: F) -> Result<bool, TransportError>
    where
        F: Fn(&[u8]) -> bool,
    {
        while !ready(&self.pending[..]) {
            let Some(link) = self.link.as_mut() else {
                return Err(self.fault("link not connected"));
            };
            match timeout_at(deadline, link.read(&mut self.scratch[..])).await {
                Err(_) => return Ok(false),
                Ok(Ok(0)) => return Err(self.fault("end of stream")),
                Ok(Ok(n)) => self.pending.extend_from_slice(&self.scratch[..n]),
                Ok(Err(err)) => return Err(self.fault(err.to_string())),
            }
        }
        Ok(true)
    }

    fn fault(&mut self, reason: impl Into<String>) -> TransportError {
        self.link = None;
        self.pending.clear();
        TransportError::Fault {
            port: self.connector.describe().to_string(),
            reason: reason.into(),
        }
    }
}
