use chrono::{DateTime, Duration, Utc};

/// Injected time source so slot checks are pure functions of
/// `(cron job, clock)` instead of ad hoc wall-clock reads.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests.
pub struct FixedClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: std::sync::Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A slot is due once `now` is within `window_mins` before it, and stays
/// due indefinitely after: an overdue slot still fires on the next tick.
pub fn is_slot_due(slot: DateTime<Utc>, now: DateTime<Utc>, window_mins: i64) -> bool {
    slot <= now + Duration::minutes(window_mins)
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn slot_due_inside_window() {
        // Slot 3 minutes in the future, 5 minute window: due.
        assert!(is_slot_due(t(180), t(0), 5));
    }

    #[test]
    fn slot_not_due_outside_window() {
        assert!(!is_slot_due(t(600), t(0), 5));
    }

    #[test]
    fn overdue_slot_still_fires() {
        assert!(is_slot_due(t(-7200), t(0), 5));
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(t(0));
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), t(30));
    }
}
