use std::time::{Duration, Instant};

/// Caller-supplied time budget for one query. `timeout_ms == 0` means no deadline.
#[derive(Debug, Clone, Copy)]
pub struct QueryDeadline {
    started: Instant,
    timeout_ms: u64,
}

impl QueryDeadline {
    pub fn new(timeout_ms: u64) -> Option<Self> {
        if timeout_ms == 0 {
            return None;
        }
        Some(Self {
            started: Instant::now(),
            timeout_ms,
        })
    }

    pub fn elapsed_ms(self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    pub fn timeout_ms(self) -> u64 {
        self.timeout_ms
    }

    pub fn remaining(self) -> Duration {
        Duration::from_millis(self.timeout_ms).saturating_sub(self.started.elapsed())
    }

    pub fn is_expired(self) -> bool {
        self.remaining().is_zero()
    }
}

pub fn deadline_expired(deadline: Option<QueryDeadline>) -> bool {
    deadline.is_some_and(QueryDeadline::is_expired)
}

/// Shortest of a backend's own timeout and whatever is left of the query budget.
pub fn request_timeout(deadline: Option<QueryDeadline>, backend_timeout: Duration) -> Duration {
    match deadline {
        Some(deadline) => backend_timeout.min(deadline.remaining()),
        None => backend_timeout,
    }
}
