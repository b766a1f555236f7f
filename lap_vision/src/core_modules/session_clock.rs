//! Monotonic elapsed-time source for a timing session.
//!
//! The clock never reads the system time itself; every call receives the
//! `Instant` it should consider "now", which keeps lap logic testable.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionClock {
    origin: Option<Instant>,
    elapsed: Duration,
    running: bool,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroes the clock and starts counting from `now`.
    pub fn start(&mut self, now: Instant) {
        self.origin = Some(now);
        self.elapsed = Duration::ZERO;
        self.running = true;
    }

    /// Advances the elapsed time to `now` while running. Returns the elapsed time.
    pub fn tick(&mut self, now: Instant) -> Duration {
        if self.running {
            if let Some(origin) = self.origin {
                // Instants taken out of order never move the clock backwards.
                self.elapsed = self.elapsed.max(now.saturating_duration_since(origin));
            }
        }
        self.elapsed
    }

    /// Advances to `now` one last time and freezes the clock.
    pub fn halt(&mut self, now: Instant) -> Duration {
        let elapsed = self.tick(now);
        self.running = false;
        elapsed
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Time from the start of the clock to `now`, whether running or not.
    pub fn offset(&self, now: Instant) -> Duration {
        self.origin
            .map(|origin| now.saturating_duration_since(origin))
            .unwrap_or_default()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_only_while_running() {
        let t0 = Instant::now();
        let mut clock = SessionClock::new();
        assert_eq!(clock.tick(t0 + Duration::from_secs(5)), Duration::ZERO);

        clock.start(t0);
        assert_eq!(clock.tick(t0 + Duration::from_millis(250)), Duration::from_millis(250));
        assert_eq!(clock.halt(t0 + Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(clock.tick(t0 + Duration::from_secs(9)), Duration::from_secs(1));
        assert!(!clock.is_running());
    }

    #[test]
    fn never_runs_backwards() {
        let t0 = Instant::now();
        let mut clock = SessionClock::new();
        clock.start(t0 + Duration::from_secs(1));
        clock.tick(t0 + Duration::from_secs(3));
        assert_eq!(clock.tick(t0 + Duration::from_secs(2)), Duration::from_secs(2));
        assert_eq!(clock.tick(t0), Duration::from_secs(2));
    }

    #[test]
    fn restart_zeroes_and_reset_clears() {
        let t0 = Instant::now();
        let mut clock = SessionClock::new();
        clock.start(t0);
        clock.halt(t0 + Duration::from_secs(4));
        clock.start(t0 + Duration::from_secs(10));
        assert_eq!(clock.elapsed(), Duration::ZERO);

        assert_eq!(clock.offset(t0 + Duration::from_secs(12)), Duration::from_secs(2));

        clock.reset();
        assert_eq!(clock, SessionClock::default());
        assert_eq!(clock.offset(t0), Duration::ZERO);
    }
}
