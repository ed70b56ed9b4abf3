use crate::store::ReadingStore;
use crate::telemetry::{Reading, SourceId, SOURCE_COUNT};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::str::FromStr;

pub const DEFAULT_THROTTLE_WINDOW_SECS: i64 = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PersistPolicy {
    /// Re-persist the latest known reading every window, even if nothing new arrived.
    #[default]
    Heartbeat,
    /// Persist only readings that have not been written yet.
    OnChange,
}

impl FromStr for PersistPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "heartbeat" => Ok(PersistPolicy::Heartbeat),
            "on_change" | "onchange" => Ok(PersistPolicy::OnChange),
            other => Err(format!("unknown persist policy {other:?}")),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SourceSlot {
    latest: Option<Reading>,
    last_persisted_at: Option<DateTime<Utc>>,
    dirty: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub written: u64,
    pub failed: u64,
}

impl PersistReport {
    fn absorb(&mut self, other: PersistReport) {
        self.written += other.written;
        self.failed += other.failed;
    }
}

/// Limits store writes to at most one per source per window. Keeps the latest reading per
/// source so the value written is never older than what has been observed.
#[derive(Debug)]
pub struct PersistenceThrottler {
    window: ChronoDuration,
    policy: PersistPolicy,
    slots: [SourceSlot; SOURCE_COUNT],
}

impl PersistenceThrottler {
    pub fn new(window: ChronoDuration, policy: PersistPolicy) -> Self {
        Self {
            window,
            policy,
            slots: Default::default(),
        }
    }

    pub fn last_persisted_at(&self, source: SourceId) -> Option<DateTime<Utc>> {
        self.slots[source.index()].last_persisted_at
    }

    /// Buffers the reading and writes it right away when its source is eligible.
    pub(in crate::ingest) fn observe(
        &mut self,
        reading: &Reading,
        now: DateTime<Utc>,
        store: &mut dyn ReadingStore,
    ) -> PersistReport {
        let source = reading.source();
        let slot = &mut self.slots[source.index()];
        slot.latest = Some(reading.clone());
        slot.dirty = true;
        self.try_persist(source, now, store)
    }

    /// Periodic pass over every source.
    pub(in crate::ingest) fn sweep(
        &mut self,
        now: DateTime<Utc>,
        store: &mut dyn ReadingStore,
    ) -> PersistReport {
        let mut report = PersistReport::default();
        for source in SourceId::ALL {
            report.absorb(self.try_persist(source, now, store));
        }
        report
    }

    fn try_persist(
        &mut self,
        source: SourceId,
        now: DateTime<Utc>,
        store: &mut dyn ReadingStore,
    ) -> PersistReport {
        let window = self.window;
        let policy = self.policy;
        let slot = &mut self.slots[source.index()];
        let Some(reading) = slot.latest.as_ref() else {
            return PersistReport::default();
        };
        if policy == PersistPolicy::OnChange && !slot.dirty {
            return PersistReport::default();
        }
        let eligible = slot
            .last_persisted_at
            .map(|last| now - last >= window)
            .unwrap_or(true);
        if !eligible {
            return PersistReport::default();
        }

        match store.insert(reading, now) {
            Ok(id) => {
                tracing::debug!(source = %source, row_id = id, "persisted reading");
                slot.last_persisted_at = Some(now);
                slot.dirty = false;
                PersistReport {
                    written: 1,
                    failed: 0,
                }
            }
            Err(err) => {
                tracing::warn!(source = %source, error = %err, "persist failed; will retry");
                PersistReport {
                    written: 0,
                    failed: 1,
                }
            }
        }
    }
}

impl Default for PersistenceThrottler {
    fn default() -> Self {
        Self::new(
            ChronoDuration::seconds(DEFAULT_THROTTLE_WINDOW_SECS),
            PersistPolicy::default(),
        )
    }
}
