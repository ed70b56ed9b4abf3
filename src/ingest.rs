mod dispatcher;
mod liveness;
mod throttle;
pub mod validate;
mod watchdog;

#[cfg(test)]
mod tests;

pub use dispatcher::{Delivery, Dispatcher};
pub use liveness::{LivenessSnapshot, LivenessTable, SourceLiveness};
pub use throttle::{PersistPolicy, PersistReport, PersistenceThrottler, DEFAULT_THROTTLE_WINDOW_SECS};
pub use validate::{validate_candidate, validate_fields, Rejection};
pub use watchdog::{LivenessWatchdog, DEFAULT_SILENCE_TIMEOUT_SECS};

use crate::consumers::Consumer;
use crate::frame::Frame;
use crate::pipeline::IngestStats;
use crate::store::{ReadingStore, StoreError, StoreStatistics, StoredRow};
use crate::telemetry::{Reading, SourceId};
use crate::transport::{TransportStatus, WorkerEvent};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone, Copy, Debug)]
pub struct PipelineSettings {
    pub throttle_window: ChronoDuration,
    pub silence_timeout: ChronoDuration,
    pub persist_policy: PersistPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            throttle_window: ChronoDuration::seconds(DEFAULT_THROTTLE_WINDOW_SECS),
            silence_timeout: ChronoDuration::seconds(DEFAULT_SILENCE_TIMEOUT_SECS),
            persist_policy: PersistPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub went_offline: Vec<SourceId>,
    pub persist: PersistReport,
}

/// Everything that runs on the single cooperative context: validation, fan-out, throttled
/// persistence and the liveness watchdog. Owns all per-source state, so nothing here is
/// shared across threads except the atomic [`IngestStats`].
pub struct Pipeline {
    dispatcher: Dispatcher,
    liveness: LivenessTable,
    throttler: PersistenceThrottler,
    watchdog: LivenessWatchdog,
    store: Box<dyn ReadingStore>,
    stats: Arc<IngestStats>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        store: Box<dyn ReadingStore>,
        consumers: Vec<Box<dyn Consumer>>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(consumers),
            liveness: LivenessTable::new(),
            throttler: PersistenceThrottler::new(settings.throttle_window, settings.persist_policy),
            watchdog: LivenessWatchdog::new(settings.silence_timeout),
            store,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// `now` is the cooperative context's clock when the event is taken off the queue. It
    /// stamps arrival and drives the persistence cursor, so a backlog cannot make a reading
    /// look older than the tick that follows it.
    pub fn handle_worker_event(&mut self, event: WorkerEvent, now: DateTime<Utc>) {
        match event {
            WorkerEvent::Frame(frame) => {
                self.ingest_frame(frame, now);
            }
            WorkerEvent::Status(status) => self.transport_status(&status),
        }
    }

    pub fn ingest_frame(&mut self, frame: Frame, now: DateTime<Utc>) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();
        for candidate in frame.into_candidates() {
            match self.ingest_candidate(&candidate, now) {
                Ok(_) => outcome.accepted += 1,
                Err(_) => outcome.rejected += 1,
            }
        }
        outcome
    }

    /// Validates one field map and, if it yields a reading, dispatches it and offers it to
    /// the throttler. Rejections are counted, never surfaced.
    pub fn ingest_candidate(
        &mut self,
        candidate: &Value,
        now: DateTime<Utc>,
    ) -> Result<Reading, Rejection> {
        let reading = match validate_candidate(candidate, now) {
            Ok(reading) => reading,
            Err(rejection) => {
                self.stats.record_rejected();
                tracing::debug!(reason = %rejection, "rejected candidate");
                return Err(rejection);
            }
        };
        self.stats.record_accepted();

        let delivery = self.dispatcher.dispatch(&reading, &mut self.liveness);
        self.stats.record_consumer_failures(delivery.failures);

        let report = self.throttler.observe(&reading, now, self.store.as_mut());
        self.record_persist(report);
        Ok(reading)
    }

    /// Periodic tick: watchdog sweep first, then consumer ticks, then the persistence sweep.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let went_offline = self.watchdog.sweep(&mut self.liveness, now);
        for source in &went_offline {
            let failures = self.dispatcher.source_offline(*source);
            self.stats.record_consumer_failures(failures);
        }
        let failures = self.dispatcher.tick(now);
        self.stats.record_consumer_failures(failures);
        let persist = self.throttler.sweep(now, self.store.as_mut());
        self.record_persist(persist);
        TickReport {
            went_offline,
            persist,
        }
    }

    pub fn transport_status(&mut self, status: &TransportStatus) {
        self.stats.set_transport_connected(status.is_connected());
        match status {
            TransportStatus::Fault { message, .. } => self.stats.record_error(message.clone()),
            TransportStatus::Connected { .. } => self.stats.clear_error(),
            TransportStatus::Disconnected { .. } => {}
        }
        let failures = self.dispatcher.transport_status(status);
        self.stats.record_consumer_failures(failures);
    }

    pub fn recent_readings(&self, limit: usize) -> Result<Vec<StoredRow>, StoreError> {
        self.store.recent_readings(limit)
    }

    pub fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        self.store.statistics()
    }

    pub fn export_rows(&self, limit: usize) -> Result<Vec<StoredRow>, StoreError> {
        self.store.export_rows(limit)
    }

    pub fn liveness(&self) -> LivenessSnapshot {
        self.liveness.snapshot()
    }

    pub fn last_persisted_at(&self, source: SourceId) -> Option<DateTime<Utc>> {
        self.throttler.last_persisted_at(source)
    }

    fn record_persist(&self, report: PersistReport) {
        self.stats.record_persisted(report.written, report.failed);
    }
}
