use crate::frame::{Extraction, ExtractorConfig, Frame, FrameExtractor};
use crate::pipeline::IngestStats;
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 200;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
const READ_CHUNK_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: serialport::Error,
    },
    #[error("transport read failed: {0}")]
    Io(#[from] io::Error),
    #[error("transport closed")]
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub device: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl TransportConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransportStatus {
    Connected { device: String },
    Disconnected { device: String },
    Fault { device: String, message: String },
}

impl TransportStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, TransportStatus::Connected { .. })
    }
}

/// What the I/O worker hands to the cooperative context.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    Frame(Frame),
    Status(TransportStatus),
}

/// Byte source owned exclusively by the reader thread.
pub trait Transport: Send {
    fn device(&self) -> &str;

    /// Blocks for at most the configured read timeout. `Ok(0)` means nothing arrived.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn close(&mut self);
}

pub trait TransportOpener: Send + Sync {
    fn open(&self, config: &TransportConfig) -> Result<Box<dyn Transport>, TransportError>;
}

pub struct SerialTransport {
    device: String,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    pub fn open(config: &TransportConfig) -> Result<Self, TransportError> {
        let port = serialport::new(&config.device, config.baud_rate)
            .timeout(config.read_timeout)
            .open()
            .map_err(|source| TransportError::Open {
                device: config.device.clone(),
                source,
            })?;
        tracing::info!(device = %config.device, baud = config.baud_rate, "serial port opened");
        Ok(Self {
            device: config.device.clone(),
            port: Some(port),
        })
    }
}

impl Transport for SerialTransport {
    fn device(&self) -> &str {
        &self.device
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::debug!(device = %self.device, "serial port closed");
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SerialOpener;

impl TransportOpener for SerialOpener {
    fn open(&self, config: &TransportConfig) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(SerialTransport::open(config)?))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReaderSettings {
    pub extractor: ExtractorConfig,
    /// Idle pause after a read that returned nothing.
    pub poll_interval: Duration,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            extractor: ExtractorConfig::default(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Blocks until the reader thread has closed the transport and exited.
    pub fn join(self) {
        self.request_stop();
        if self.thread.join().is_err() {
            tracing::error!("transport reader thread panicked");
        }
    }
}

pub fn spawn_reader_thread(
    transport: Box<dyn Transport>,
    settings: ReaderSettings,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    stats: Arc<IngestStats>,
) -> Result<ReaderHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let thread = std::thread::Builder::new()
        .name("transport-reader".to_string())
        .spawn(move || run_reader(transport, settings, events_tx, stats, thread_stop))
        .context("failed to spawn transport reader thread")?;
    Ok(ReaderHandle { stop, thread })
}

fn run_reader(
    mut transport: Box<dyn Transport>,
    settings: ReaderSettings,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    stats: Arc<IngestStats>,
    stop: Arc<AtomicBool>,
) {
    let device = transport.device().to_string();
    let mut extractor = FrameExtractor::new(settings.extractor);
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    let _ = events_tx.send(WorkerEvent::Status(TransportStatus::Connected {
        device: device.clone(),
    }));

    let final_status = loop {
        if stop.load(Ordering::SeqCst) {
            break TransportStatus::Disconnected {
                device: device.clone(),
            };
        }

        let read = match transport.read(&mut buf) {
            Ok(read) => read,
            Err(err) => {
                tracing::error!(device = %device, error = %err, "transport read failed");
                break TransportStatus::Fault {
                    device: device.clone(),
                    message: err.to_string(),
                };
            }
        };
        if read == 0 {
            std::thread::sleep(settings.poll_interval);
            continue;
        }

        stats.record_bytes(read as u64);
        extractor.push(&buf[..read]);
        let mut receiver_gone = false;
        for extraction in extractor.by_ref() {
            match extraction {
                Extraction::Frame(frame) => {
                    stats.record_frame();
                    if events_tx.send(WorkerEvent::Frame(frame)).is_err() {
                        receiver_gone = true;
                        break;
                    }
                }
                Extraction::Discarded(reason) => {
                    stats.record_discard();
                    tracing::debug!(device = %device, ?reason, "discarded frame");
                }
            }
        }
        if receiver_gone {
            tracing::debug!(device = %device, "event receiver dropped; stopping reader");
            break TransportStatus::Disconnected {
                device: device.clone(),
            };
        }
    };

    transport.close();
    let _ = events_tx.send(WorkerEvent::Status(final_status));
}
