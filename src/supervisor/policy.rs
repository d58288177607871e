//! Retry policy and budget

use std::time::Duration;

/// Default wait between connect attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on consecutive failed attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaxRetries {
    /// Give up after this many retries
    Limited(u32),
    /// Retry forever
    #[default]
    Unlimited,
}

impl MaxRetries {
    /// Map a signed count where any negative value means "unlimited"
    pub fn from_sentinel(value: i64) -> Self {
        if value < 0 {
            Self::Unlimited
        } else {
            Self::Limited(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }
}

impl std::fmt::Display for MaxRetries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{}", n),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// How the reconnect loop backs off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up
    pub max_retries: MaxRetries,
    /// Fixed wait between attempts
    pub retry_interval: Duration,
}

impl RetryPolicy {
    /// Retry forever with the given interval
    pub fn unlimited(retry_interval: Duration) -> Self {
        Self {
            max_retries: MaxRetries::Unlimited,
            retry_interval,
        }
    }

    /// Retry at most `max_retries` times in a row
    pub fn limited(max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            max_retries: MaxRetries::Limited(max_retries),
            retry_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unlimited(DEFAULT_RETRY_INTERVAL)
    }
}

/// Remaining retries for the current failure streak
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryBudget {
    max: MaxRetries,
    remaining: u32,
}

impl RetryBudget {
    pub(crate) fn new(max: MaxRetries) -> Self {
        let remaining = match max {
            MaxRetries::Limited(n) => n,
            MaxRetries::Unlimited => 0,
        };
        Self { max, remaining }
    }

    /// Back to the configured maximum after a successful connect
    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.max);
    }

    /// Take one retry; false when the budget is spent
    pub(crate) fn try_consume(&mut self) -> bool {
        match self.max {
            MaxRetries::Unlimited => true,
            MaxRetries::Limited(_) if self.remaining == 0 => false,
            MaxRetries::Limited(_) => {
                self.remaining -= 1;
                true
            }
        }
    }
}
