//! Deadline bookkeeping for the in-flight slot
//!
//! The guard does not own a timer. The event loop sleeps until
//! `deadline()` and then asks `expired(now)`; keeping it on
//! `tokio::time::Instant` lets tests drive it with a paused clock.

use std::time::Duration;
use tokio::time::Instant;

use super::operation::OperationId;

/// Longest timeout the guard will arm; larger values are clamped
pub const MAX_OPERATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// `now + timeout`, clamped to `MAX_OPERATION_TIMEOUT` and never overflowing
pub fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    let timeout = timeout.min(MAX_OPERATION_TIMEOUT);
    now.checked_add(timeout).unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Armed {
    operation_id: OperationId,
    deadline: Instant,
}

/// At most one armed deadline, bound to the in-flight operation
#[derive(Debug, Clone)]
pub struct TimeoutGuard {
    default_timeout: Duration,
    armed: Option<Armed>,
}

impl TimeoutGuard {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            armed: None,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Timeout that applies to an operation with the given override
    pub fn effective(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.default_timeout).min(MAX_OPERATION_TIMEOUT)
    }

    /// Arm for `operation_id`, replacing any earlier deadline
    pub fn arm(&mut self, operation_id: OperationId, timeout: Option<Duration>, now: Instant) -> Instant {
        let deadline = deadline_after(now, self.effective(timeout));
        self.armed = Some(Armed {
            operation_id,
            deadline,
        });
        deadline
    }

    /// Disarm if the guard belongs to `operation_id`
    pub fn disarm(&mut self, operation_id: OperationId) {
        if self.armed.map(|a| a.operation_id) == Some(operation_id) {
            self.armed = None;
        }
    }

    pub fn clear(&mut self) {
        self.armed = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed.map(|a| a.deadline)
    }

    /// The armed operation, if its deadline has passed
    pub fn expired(&self, now: Instant) -> Option<OperationId> {
        self.armed
            .filter(|a| now >= a.deadline)
            .map(|a| a.operation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_and_override() {
        let mut guard = TimeoutGuard::new(Duration::from_millis(500));
        let now = Instant::now();

        let deadline = guard.arm(OperationId(1), None, now);
        assert_eq!(deadline, now + Duration::from_millis(500));

        let deadline = guard.arm(OperationId(2), Some(Duration::from_secs(3)), now);
        assert_eq!(deadline, now + Duration::from_secs(3));
        assert_eq!(guard.deadline(), Some(deadline));
    }

    #[test]
    fn test_expiry() {
        let mut guard = TimeoutGuard::new(Duration::from_millis(100));
        let now = Instant::now();
        guard.arm(OperationId(5), None, now);

        assert_eq!(guard.expired(now), None);
        assert_eq!(guard.expired(now + Duration::from_millis(100)), Some(OperationId(5)));
    }

    #[test]
    fn test_huge_timeouts_are_clamped() {
        let mut guard = TimeoutGuard::new(Duration::from_millis(100));
        let now = Instant::now();

        let deadline = guard.arm(OperationId(1), Some(Duration::MAX), now);
        assert_eq!(deadline, now + MAX_OPERATION_TIMEOUT);
        assert_eq!(guard.expired(now + Duration::from_secs(60)), None);

        let guard = TimeoutGuard::new(Duration::MAX);
        assert_eq!(guard.effective(None), MAX_OPERATION_TIMEOUT);
        assert_eq!(guard.effective(Some(Duration::from_secs(2))), Duration::from_secs(2));
    }

    #[test]
    fn test_disarm_only_matching() {
        let mut guard = TimeoutGuard::new(Duration::from_millis(100));
        guard.arm(OperationId(5), None, Instant::now());

        guard.disarm(OperationId(4));
        assert!(guard.deadline().is_some());

        guard.disarm(OperationId(5));
        assert!(guard.deadline().is_none());
    }
}
