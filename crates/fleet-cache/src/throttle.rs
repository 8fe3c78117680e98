use std::time::{Duration, Instant};

/// Rate limiter for repetitive log lines, owned by the component doing the logging.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Starts the interval now, so the first `ready` is one interval away.
    pub fn started_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last: Some(now),
        }
    }

    /// `true` (and the interval restarts) if at least one interval has passed since the
    /// last time this returned `true`.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
