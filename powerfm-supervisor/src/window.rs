use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling record of restart attempts for one station.
///
/// An attempt is admitted only while fewer than `max_restarts` attempts lie
/// inside the trailing `window`. Admitted attempts are recorded immediately,
/// whatever the outcome of the spawn that follows.
#[derive(Debug, Clone)]
pub struct RestartWindow {
    max_restarts: usize,
    window: Duration,
    attempts: VecDeque<Instant>,
}

impl RestartWindow {
    pub fn new(max_restarts: usize, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            attempts: VecDeque::with_capacity(max_restarts),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.attempts.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Attempts still inside the window
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.attempts.len()
    }

    pub fn max_restarts(&self) -> usize {
        self.max_restarts
    }

    /// Record an attempt if the budget allows; `false` means suppressed
    pub fn try_record(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.attempts.len() >= self.max_restarts {
            return false;
        }
        self.attempts.push_back(now);
        true
    }
}
