use super::liveness::LivenessTable;
use crate::consumers::Consumer;
use crate::telemetry::{Reading, SourceId};
use crate::transport::TransportStatus;
use chrono::{DateTime, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub came_online: bool,
    pub failures: u64,
}

/// Fans validated readings and liveness transitions out to the registered consumers, in
/// registration order.
#[derive(Default)]
pub struct Dispatcher {
    consumers: Vec<Box<dyn Consumer>>,
}

impl Dispatcher {
    pub fn new(consumers: Vec<Box<dyn Consumer>>) -> Self {
        Self { consumers }
    }

    /// Refreshes liveness for the reading's source and delivers it. A source that was offline
    /// is announced online before the reading reaches anyone.
    pub(in crate::ingest) fn dispatch(
        &mut self,
        reading: &Reading,
        liveness: &mut LivenessTable,
    ) -> Delivery {
        let source = reading.source();
        let came_online = liveness.mark_seen(source, reading.arrival_time());
        let mut failures = 0;
        if came_online {
            failures += self.notify("source_online", |consumer| consumer.on_source_online(source));
        }
        failures += self.notify("reading", |consumer| consumer.on_reading(reading));
        Delivery {
            came_online,
            failures,
        }
    }

    pub(in crate::ingest) fn source_offline(&mut self, source: SourceId) -> u64 {
        self.notify("source_offline", |consumer| consumer.on_source_offline(source))
    }

    pub(in crate::ingest) fn transport_status(&mut self, status: &TransportStatus) -> u64 {
        self.notify("transport_status", |consumer| {
            consumer.on_transport_status(status)
        })
    }

    pub(in crate::ingest) fn tick(&mut self, now: DateTime<Utc>) -> u64 {
        self.notify("tick", |consumer| consumer.on_tick(now))
    }

    fn notify<F>(&mut self, event: &'static str, mut call: F) -> u64
    where
        F: FnMut(&mut dyn Consumer) -> anyhow::Result<()>,
    {
        let mut failures = 0;
        for consumer in self.consumers.iter_mut() {
            let outcome = catch_unwind(AssertUnwindSafe(|| call(consumer.as_mut())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    tracing::warn!(consumer = consumer.name(), event, error = %err, "consumer failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::error!(consumer = consumer.name(), event, "consumer panicked");
                }
            }
        }
        failures
    }
}
