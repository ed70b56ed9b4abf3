use crate::pipeline::IngestStats;
use crate::transport::{
    spawn_reader_thread, ReaderHandle, ReaderSettings, TransportConfig, TransportOpener,
    TransportStatus, WorkerEvent,
};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

struct ActiveReader {
    config: TransportConfig,
    handle: ReaderHandle,
}

/// Start/stop surface for the transport worker. Both operations are idempotent; at most one
/// reader thread exists at any time.
pub struct IngestController {
    opener: Arc<dyn TransportOpener>,
    settings: ReaderSettings,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    stats: Arc<IngestStats>,
    active: Mutex<Option<ActiveReader>>,
}

impl IngestController {
    pub fn new(
        opener: Arc<dyn TransportOpener>,
        settings: ReaderSettings,
        events_tx: mpsc::UnboundedSender<WorkerEvent>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            opener,
            settings,
            events_tx,
            stats,
            active: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| !active.handle.is_finished())
            .unwrap_or(false)
    }

    /// Opens the transport and spawns the reader. A no-op when a reader for the same config
    /// is already running; a reader that exited on a fault is reaped and replaced.
    pub async fn start(&self, config: TransportConfig) -> Result<()> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if !current.handle.is_finished() {
                if current.config == config {
                    tracing::debug!(device = %config.device, "ingest already running");
                    return Ok(());
                }
                bail!(
                    "ingest already running on {}; stop it before switching to {}",
                    current.config.device,
                    config.device
                );
            }
        }
        if let Some(finished) = active.take() {
            reap(finished).await;
        }

        let opener = self.opener.clone();
        let open_config = config.clone();
        let opened = tokio::task::spawn_blocking(move || opener.open(&open_config))
            .await
            .context("transport open task failed")?;
        let transport = match opened {
            Ok(transport) => transport,
            Err(err) => {
                let _ = self
                    .events_tx
                    .send(WorkerEvent::Status(TransportStatus::Fault {
                        device: config.device.clone(),
                        message: err.to_string(),
                    }));
                return Err(err).with_context(|| format!("failed to start ingest on {}", config.device));
            }
        };

        let handle = spawn_reader_thread(
            transport,
            self.settings,
            self.events_tx.clone(),
            self.stats.clone(),
        )?;
        tracing::info!(device = %config.device, baud = config.baud_rate, "ingest started");
        *active = Some(ActiveReader { config, handle });
        Ok(())
    }

    /// Signals the reader, waits for it to close the transport, and joins it.
    pub async fn stop(&self) -> Result<()> {
        let Some(current) = self.active.lock().await.take() else {
            return Ok(());
        };
        let device = current.config.device.clone();
        reap(current).await;
        tracing::info!(device = %device, "ingest stopped");
        Ok(())
    }
}

async fn reap(reader: ActiveReader) {
    reader.handle.request_stop();
    let handle = reader.handle;
    if let Err(err) = tokio::task::spawn_blocking(move || handle.join()).await {
        tracing::error!(error = %err, "failed to join transport reader");
    }
}
