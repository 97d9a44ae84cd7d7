//! Retrying work that failed for a transient reason.
//!
//! Only the closed set in [`Transient`] is ever retried. An attempt can also
//! mark a failure [`AttemptError::Fatal`] to bypass classification, which the
//! reclaim loop uses for transaction join failures.

use gcfs_error::GcfsError;
use serde::{Deserialize, Serialize};

/// Failures worth another attempt in a fresh transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transient {
    /// The bound reservation ran dry.
    NoSpace,
    /// Partial progress; the rest needs a new transaction.
    Again,
}

impl Transient {
    #[must_use]
    pub fn classify(err: &GcfsError) -> Option<Self> {
        match err {
            GcfsError::NoSpace => Some(Self::NoSpace),
            GcfsError::Again => Some(Self::Again),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum AttemptError {
    /// Never retried, whatever the error.
    Fatal(GcfsError),
    /// Retried if it classifies as [`Transient`].
    Failed(GcfsError),
}

impl From<GcfsError> for AttemptError {
    fn from(err: GcfsError) -> Self {
        Self::Failed(err)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed; `None` keeps going while failures are transient.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    #[must_use]
    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    #[must_use]
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    fn allows(self, attempts_made: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts_made < max)
    }
}

/// Run `attempt` until it succeeds or fails non-transiently.
///
/// `attempt` receives the 1-based attempt number; `on_retry` is told why
/// each retry happened. When the policy runs out the last transient error is
/// returned.
pub fn retry_transient<T>(
    policy: RetryPolicy,
    mut attempt: impl FnMut(u32) -> Result<T, AttemptError>,
    mut on_retry: impl FnMut(Transient, u32),
) -> Result<T, GcfsError> {
    let mut n = 1_u32;
    loop {
        match attempt(n) {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(err)) => return Err(err),
            Err(AttemptError::Failed(err)) => match Transient::classify(&err) {
                Some(kind) if policy.allows(n) => {
                    on_retry(kind, n);
                    n = n.saturating_add(1);
                }
                _ => return Err(err),
            },
        }
    }
}
