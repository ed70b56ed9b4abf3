use crate::telemetry::{SourceId, SOURCE_COUNT};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SourceLiveness {
    pub last_seen: Option<DateTime<Utc>>,
    pub online: bool,
}

/// Per-source liveness, owned by the cooperative context. Every source starts unknown/offline.
#[derive(Clone, Debug, Default)]
pub struct LivenessTable {
    entries: [SourceLiveness; SOURCE_COUNT],
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: SourceId) -> SourceLiveness {
        self.entries[source.index()]
    }

    /// Records a reading. Returns `true` when the source just came online.
    pub(in crate::ingest) fn mark_seen(&mut self, source: SourceId, at: DateTime<Utc>) -> bool {
        let entry = &mut self.entries[source.index()];
        if entry.last_seen.map(|prev| at > prev).unwrap_or(true) {
            entry.last_seen = Some(at);
        }
        let came_online = !entry.online;
        entry.online = true;
        came_online
    }

    /// Flips online sources that have been silent for longer than `timeout`.
    pub(in crate::ingest) fn expire(
        &mut self,
        now: DateTime<Utc>,
        timeout: ChronoDuration,
    ) -> Vec<SourceId> {
        let mut expired = Vec::new();
        for source in SourceId::ALL {
            let entry = &mut self.entries[source.index()];
            if !entry.online {
                continue;
            }
            let silent_for = entry.last_seen.map(|seen| now - seen);
            if silent_for.map(|gap| gap > timeout).unwrap_or(true) {
                entry.online = false;
                expired.push(source);
            }
        }
        expired
    }

    pub fn snapshot(&self) -> LivenessSnapshot {
        LivenessSnapshot {
            sources: SourceId::ALL.map(|source| (source, self.get(source))),
        }
    }

    pub fn online_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.online).count()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LivenessSnapshot {
    pub sources: [(SourceId, SourceLiveness); SOURCE_COUNT],
}

impl LivenessSnapshot {
    pub fn is_online(&self, source: SourceId) -> bool {
        self.sources[source.index()].1.online
    }
}
