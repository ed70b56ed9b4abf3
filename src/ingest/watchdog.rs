use super::liveness::LivenessTable;
use crate::telemetry::SourceId;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

pub const DEFAULT_SILENCE_TIMEOUT_SECS: i64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatchdogState {
    Idle,
    Sweeping,
}

/// Marks silent sources offline. It only ever produces offline transitions; coming back
/// online requires an actual reading.
#[derive(Debug)]
pub struct LivenessWatchdog {
    state: WatchdogState,
    silence_timeout: ChronoDuration,
    sweeps: u64,
}

impl LivenessWatchdog {
    pub fn new(silence_timeout: ChronoDuration) -> Self {
        Self {
            state: WatchdogState::Idle,
            silence_timeout,
            sweeps: 0,
        }
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps
    }

    pub(in crate::ingest) fn sweep(
        &mut self,
        liveness: &mut LivenessTable,
        now: DateTime<Utc>,
    ) -> Vec<SourceId> {
        if self.state == WatchdogState::Sweeping {
            debug_assert!(false, "liveness sweep re-entered");
            return Vec::new();
        }
        self.state = WatchdogState::Sweeping;
        let expired = liveness.expire(now, self.silence_timeout);
        self.sweeps += 1;
        self.state = WatchdogState::Idle;

        for source in &expired {
            tracing::info!(
                source = %source,
                timeout_secs = self.silence_timeout.num_seconds(),
                "source went silent; marking offline"
            );
        }
        expired
    }
}

impl Default for LivenessWatchdog {
    fn default() -> Self {
        Self::new(ChronoDuration::seconds(DEFAULT_SILENCE_TIMEOUT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn offline_transition_is_emitted_once() {
        let source = SourceId::new(3).unwrap();
        let mut table = LivenessTable::new();
        let mut watchdog = LivenessWatchdog::default();
        table.mark_seen(source, t(0));

        let mut transitions = Vec::new();
        for second in 1..=120 {
            transitions.extend(watchdog.sweep(&mut table, t(second)));
        }
        assert_eq!(transitions, vec![source]);
        assert_eq!(watchdog.sweeps(), 120);
    }

    #[test]
    fn unknown_sources_are_never_reported() {
        let mut table = LivenessTable::new();
        let mut watchdog = LivenessWatchdog::default();
        assert!(watchdog.sweep(&mut table, t(1_000)).is_empty());
    }
}
