use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::ChatStoreError;

/// Time source for store deadlines and record timestamps.
pub trait Clock: Send + Sync {
    /// Monotonic time used for flush and checkpoint deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock time used for persisted timestamps.
    fn now_utc(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(Instant, OffsetDateTime)>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_utc: OffsetDateTime) -> Self {
        Self {
            state: Mutex::new((Instant::now(), start_utc)),
        }
    }

    /// Moves both the monotonic and the wall clock forward.
    pub fn advance(&self, by: Duration) {
        let mut state = lock_unpoisoned(&self.state);
        state.0 += by;
        state.1 += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH + Duration::from_secs(1_767_225_600))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        lock_unpoisoned(&self.state).0
    }

    fn now_utc(&self) -> OffsetDateTime {
        lock_unpoisoned(&self.state).1
    }
}

pub(crate) fn format_timestamp(value: OffsetDateTime) -> Result<String, ChatStoreError> {
    value.format(&Rfc3339).map_err(ChatStoreError::ClockFormat)
}

pub(crate) fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{format_timestamp, parse_timestamp, Clock, ManualClock};

    #[test]
    fn manual_clock_moves_both_clocks_together() {
        let clock = ManualClock::default();
        let instant = clock.now();
        let wall = clock.now_utc();

        clock.advance(Duration::from_millis(1500));

        assert_eq!(clock.now() - instant, Duration::from_millis(1500));
        assert_eq!(clock.now_utc() - wall, time::Duration::milliseconds(1500));
    }

    #[test]
    fn timestamps_round_trip_through_rfc3339() {
        let clock = ManualClock::default();
        let text = format_timestamp(clock.now_utc()).expect("timestamp should format");
        assert_eq!(text, "2026-01-01T00:00:00Z");
        assert_eq!(parse_timestamp(&text), Some(clock.now_utc()));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
