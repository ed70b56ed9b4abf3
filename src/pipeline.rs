use crate::ingest::{LivenessSnapshot, Pipeline};
use crate::store::{StoreStatistics, StoredRow};
use crate::transport::WorkerEvent;
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct IngestStats {
    pub bytes_read: AtomicU64,
    pub frames_extracted: AtomicU64,
    pub frames_discarded: AtomicU64,
    pub readings_accepted: AtomicU64,
    pub readings_rejected: AtomicU64,
    pub rows_persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub consumer_failures: AtomicU64,
    pub transport_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_read: u64,
    pub frames_extracted: u64,
    pub frames_discarded: u64,
    pub readings_accepted: u64,
    pub readings_rejected: u64,
    pub rows_persisted: u64,
    pub persist_failures: u64,
    pub consumer_failures: u64,
    pub transport_connected: bool,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            frames_extracted: AtomicU64::new(0),
            frames_discarded: AtomicU64::new(0),
            readings_accepted: AtomicU64::new(0),
            readings_rejected: AtomicU64::new(0),
            rows_persisted: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            consumer_failures: AtomicU64::new(0),
            transport_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_bytes(&self, count: u64) {
        self.bytes_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_frame(&self) {
        self.frames_extracted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.frames_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.readings_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.readings_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, written: u64, failed: u64) {
        if written > 0 {
            self.rows_persisted.fetch_add(written, Ordering::Relaxed);
        }
        if failed > 0 {
            self.persist_failures.fetch_add(failed, Ordering::Relaxed);
        }
    }

    pub fn record_consumer_failures(&self, count: u64) {
        if count > 0 {
            self.consumer_failures.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn set_transport_connected(&self, connected: bool) {
        self.transport_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            frames_extracted: self.frames_extracted.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            readings_accepted: self.readings_accepted.load(Ordering::Relaxed),
            readings_rejected: self.readings_rejected.load(Ordering::Relaxed),
            rows_persisted: self.rows_persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            consumer_failures: self.consumer_failures.load(Ordering::Relaxed),
            transport_connected: self.transport_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only requests served by the cooperative context, which owns the store.
#[derive(Debug)]
pub enum StoreQuery {
    RecentReadings {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<StoredRow>, String>>,
    },
    Statistics {
        reply: oneshot::Sender<Result<StoreStatistics, String>>,
    },
    ExportRows {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<StoredRow>, String>>,
    },
    Liveness {
        reply: oneshot::Sender<LivenessSnapshot>,
    },
}

#[derive(Clone)]
pub struct PipelineHandle {
    query_tx: mpsc::UnboundedSender<StoreQuery>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn recent_readings(&self, limit: usize) -> Result<Vec<StoredRow>> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreQuery::RecentReadings { limit, reply })?;
        rx.await?.map_err(|err| anyhow!(err))
    }

    pub async fn statistics(&self) -> Result<StoreStatistics> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreQuery::Statistics { reply })?;
        rx.await?.map_err(|err| anyhow!(err))
    }

    pub async fn export_rows(&self, limit: usize) -> Result<Vec<StoredRow>> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreQuery::ExportRows { limit, reply })?;
        rx.await?.map_err(|err| anyhow!(err))
    }

    pub async fn liveness(&self) -> Result<LivenessSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreQuery::Liveness { reply })?;
        Ok(rx.await?)
    }

    fn send(&self, query: StoreQuery) -> Result<()> {
        self.query_tx
            .send(query)
            .map_err(|_| anyhow!("ingest pipeline is not running"))
    }
}

/// Spawns the cooperative context. Worker events and store queries are handled in arrival
/// order; the interval drives persistence and watchdog sweeps.
pub fn spawn_pipeline(
    mut pipeline: Pipeline,
    tick_interval: Duration,
    cancel: CancellationToken,
) -> (
    PipelineHandle,
    mpsc::UnboundedSender<WorkerEvent>,
    JoinHandle<()>,
) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let (query_tx, mut query_rx) = mpsc::unbounded_channel::<StoreQuery>();
    let handle = PipelineHandle {
        query_tx,
        stats: pipeline.stats(),
    };

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => pipeline.handle_worker_event(event, Utc::now()),
                    None => break,
                },
                Some(query) = query_rx.recv() => answer(&pipeline, query),
                _ = ticker.tick() => {
                    pipeline.tick(Utc::now());
                }
            }
        }

        events_rx.close();
        let mut discarded = 0usize;
        while events_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::info!(discarded, "discarded queued events at shutdown");
        }
        tracing::debug!("ingest pipeline stopped");
    });

    (handle, events_tx, task)
}

fn answer(pipeline: &Pipeline, query: StoreQuery) {
    match query {
        StoreQuery::RecentReadings { limit, reply } => {
            let _ = reply.send(pipeline.recent_readings(limit).map_err(|err| err.to_string()));
        }
        StoreQuery::Statistics { reply } => {
            let _ = reply.send(pipeline.statistics().map_err(|err| err.to_string()));
        }
        StoreQuery::ExportRows { limit, reply } => {
            let _ = reply.send(pipeline.export_rows(limit).map_err(|err| err.to_string()));
        }
        StoreQuery::Liveness { reply } => {
            let _ = reply.send(pipeline.liveness());
        }
    }
}
