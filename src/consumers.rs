use crate::telemetry::{Field, Reading, SourceId, SOURCE_COUNT};
use crate::transport::TransportStatus;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::watch;

pub const DEFAULT_AGGREGATE_WINDOW_SECS: i64 = 60;
const MAX_AGGREGATE_WINDOW_SECS: i64 = 7 * 24 * 3600;

/// A downstream sink notified by the dispatcher. Consumers run on the cooperative context
/// and must not block; a failing consumer never affects its siblings.
pub trait Consumer: Send {
    fn name(&self) -> &str;

    fn on_reading(&mut self, reading: &Reading) -> Result<()>;

    fn on_source_online(&mut self, source: SourceId) -> Result<()>;

    fn on_source_offline(&mut self, source: SourceId) -> Result<()>;

    fn on_transport_status(&mut self, _status: &TransportStatus) -> Result<()> {
        Ok(())
    }

    /// Called on every pipeline tick with the pipeline clock.
    fn on_tick(&mut self, _now: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

/// Logs liveness and transport transitions.
#[derive(Debug, Default)]
pub struct StatusLog {
    readings: u64,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Consumer for StatusLog {
    fn name(&self) -> &str {
        "status-log"
    }

    fn on_reading(&mut self, reading: &Reading) -> Result<()> {
        self.readings += 1;
        tracing::debug!(
            source = %reading.source(),
            source_type = reading.source_type(),
            fields = reading.present().count(),
            total = self.readings,
            "reading"
        );
        Ok(())
    }

    fn on_source_online(&mut self, source: SourceId) -> Result<()> {
        tracing::info!(source = %source, "source online");
        Ok(())
    }

    fn on_source_offline(&mut self, source: SourceId) -> Result<()> {
        tracing::warn!(source = %source, "source offline");
        Ok(())
    }

    fn on_transport_status(&mut self, status: &TransportStatus) -> Result<()> {
        match status {
            TransportStatus::Fault { device, message } => {
                tracing::error!(device = %device, error = %message, "transport fault")
            }
            other => tracing::info!(status = ?other, "transport status"),
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldSummary {
    pub field: Field,
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregateSummary {
    pub window_secs: i64,
    pub updated_at: Option<DateTime<Utc>>,
    pub online: Vec<SourceId>,
    pub latest: Vec<Reading>,
    pub fields: Vec<FieldSummary>,
}

impl AggregateSummary {
    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    pub fn field(&self, field: Field) -> Option<&FieldSummary> {
        self.fields.iter().find(|summary| summary.field == field)
    }
}

/// Keeps a rolling window of readings and publishes a fresh [`AggregateSummary`] on every
/// change. Readers subscribe through the watch channel.
#[derive(Debug)]
pub struct RollingAggregate {
    window: ChronoDuration,
    buffer: VecDeque<Reading>,
    latest: [Option<Reading>; SOURCE_COUNT],
    online: [bool; SOURCE_COUNT],
    tx: watch::Sender<AggregateSummary>,
}

impl RollingAggregate {
    pub fn new(window_secs: i64) -> (Self, watch::Receiver<AggregateSummary>) {
        let window_secs = window_secs.clamp(1, MAX_AGGREGATE_WINDOW_SECS);
        let (tx, rx) = watch::channel(AggregateSummary {
            window_secs,
            ..AggregateSummary::default()
        });
        (
            Self {
                window: ChronoDuration::seconds(window_secs),
                buffer: VecDeque::new(),
                latest: Default::default(),
                online: [false; SOURCE_COUNT],
                tx,
            },
            rx,
        )
    }

    fn prune(&mut self, newest: DateTime<Utc>) {
        let window_start = newest - self.window;
        while let Some(front) = self.buffer.front() {
            if front.arrival_time() <= window_start {
                self.buffer.pop_front();
            } else {
                break;
            }
        }
    }

    fn summarize(&self) -> AggregateSummary {
        let mut fields = Vec::new();
        for field in Field::ALL {
            let mut count = 0u64;
            let mut total = 0.0;
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for value in self.buffer.iter().filter_map(|reading| reading.value(field)) {
                count += 1;
                total += value;
                min = min.min(value);
                max = max.max(value);
            }
            if count > 0 {
                fields.push(FieldSummary {
                    field,
                    count,
                    mean: total / count as f64,
                    min,
                    max,
                });
            }
        }

        AggregateSummary {
            window_secs: self.window.num_seconds(),
            updated_at: self.buffer.back().map(Reading::arrival_time),
            online: SourceId::ALL
                .into_iter()
                .filter(|source| self.online[source.index()])
                .collect(),
            latest: self.latest.iter().flatten().cloned().collect(),
            fields,
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.summarize());
    }
}

impl Consumer for RollingAggregate {
    fn name(&self) -> &str {
        "rolling-aggregate"
    }

    fn on_reading(&mut self, reading: &Reading) -> Result<()> {
        self.buffer.push_back(reading.clone());
        self.latest[reading.source().index()] = Some(reading.clone());
        self.prune(reading.arrival_time());
        self.publish();
        Ok(())
    }

    fn on_source_online(&mut self, source: SourceId) -> Result<()> {
        self.online[source.index()] = true;
        self.publish();
        Ok(())
    }

    fn on_source_offline(&mut self, source: SourceId) -> Result<()> {
        self.online[source.index()] = false;
        self.publish();
        Ok(())
    }

    /// Ages readings out of the window even when every source has gone quiet.
    fn on_tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let before = self.buffer.len();
        self.prune(now);
        if self.buffer.len() != before {
            self.publish();
        }
        Ok(())
    }
}
