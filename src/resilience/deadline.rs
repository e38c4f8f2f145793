//! Absolute deadlines that shrink as they are passed down a call chain.
//!
//! # Responsibilities
//! - Represent the budget of a whole call tree as one absolute instant
//! - Derive child deadlines that can never outlive their parent
//! - Answer "how much time is left" without blocking
//!
//! # Design Decisions
//! - Immutable `Copy` value; nothing ever extends a deadline
//! - Built on `tokio::time::Instant` so it agrees with tokio timers
//! - Expiry is advisory here; the timeout manager is where it is enforced

use std::time::Duration;
use tokio::time::Instant;

use crate::resilience::error::DeadlineExceeded;

/// An absolute point in time by which work (and all of its sub-work) must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    /// Deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self::at(Instant::now() + budget)
    }

    /// Deadline at an absolute instant.
    pub fn at(expires_at: Instant) -> Self {
        Self { expires_at }
    }

    /// Derive a deadline for a sub-operation that wants at most `max` of the budget.
    ///
    /// The result is `min(self, now + max)`.
    pub fn child(&self, max: Duration) -> Self {
        let candidate = Instant::now() + max;
        Self {
            expires_at: self.expires_at.min(candidate),
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left before expiry, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Fail immediately if the deadline has already passed.
    pub fn check(&self) -> Result<(), DeadlineExceeded> {
        if self.is_expired() {
            Err(DeadlineExceeded { operation_id: None })
        } else {
            Ok(())
        }
    }

    /// Like [`check`](Self::check), tagging the error with the operation that hit it.
    pub fn check_for(&self, operation_id: &str) -> Result<(), DeadlineExceeded> {
        self.check().map_err(|_| DeadlineExceeded {
            operation_id: Some(operation_id.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_never_outlives_parent() {
        let parent = Deadline::after(Duration::from_millis(1000));
        let child = parent.child(Duration::from_millis(5000));
        assert!(child.remaining() <= Duration::from_millis(1000));
        assert_eq!(child.expires_at(), parent.expires_at());
    }

    #[test]
    fn test_child_can_shrink() {
        let parent = Deadline::after(Duration::from_secs(10));
        let child = parent.child(Duration::from_millis(100));
        assert!(child < parent);
        assert!(child.remaining() <= Duration::from_millis(100));
    }

    #[test]
    fn test_expired_deadline() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
        assert!(deadline.check().is_err());

        let err = deadline.check_for("fetch-quote").unwrap_err();
        assert_eq!(err.operation_id.as_deref(), Some("fetch-quote"));
    }

    #[test]
    fn test_live_deadline_passes_check() {
        let deadline = Deadline::after(Duration::from_secs(30));
        assert!(deadline.check().is_ok());
        assert!(!deadline.is_expired());
    }

    #[tokio::test]
    async fn test_remaining_shrinks_over_time() {
        let deadline = Deadline::after(Duration::from_millis(200));
        let before = deadline.remaining();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(deadline.remaining() < before);
    }
}
