//! Error types for rates, stores, and acquisition.
use crate::rate::Rate;
use std::fmt;
use std::time::Duration;

/// Errors produced while constructing or composing rates.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateError {
    /// A rate must allow at least one use per period.
    #[error("rate uses must be at least 1")]
    ZeroUses,
    /// A rate period must be longer than zero.
    #[error("rate period must be greater than zero")]
    ZeroPeriod,
    /// Scale factors must be finite, positive, and yield a representable period.
    #[error("invalid period scale factor {0}")]
    InvalidScale(f64),
    /// Adding two periods overflowed `Duration`.
    #[error("rate period overflowed while adding")]
    PeriodOverflow,
    /// Rates can only be added when both sides allow exactly one use.
    #[error("cannot add {left} and {right}: both rates must have exactly one use")]
    InvalidRateComposition {
        /// Left operand.
        left: Rate,
        /// Right operand.
        right: Rate,
    },
    /// The argument cannot be used to configure a rate limit.
    #[error("invalid argument: {0}")]
    InvalidArgumentType(&'static str),
}

/// Errors reported by a [`Store`](crate::Store) or [`AsyncStore`](crate::AsyncStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store was used before being bound to a rate limit via `setup`.
    #[error("store used before setup bound it to a rate limit")]
    NotBound,
    /// The storage backend failed.
    #[error("store backend failed: {0}")]
    Backend(String),
}

/// Failure to acquire a usage token.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AcquireError {
    /// No token is available; retry after `retry_after`.
    #[error("rate limit {rate} exceeded, retry after {retry_after:?}")]
    RateLimited {
        /// Time until the violated rate's window resets.
        retry_after: Duration,
        /// The rate whose window is furthest from resetting.
        rate: Rate,
    },
    /// The store could not produce a decision.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The concurrency gate was closed while waiting for a slot.
    #[error("concurrency gate closed")]
    GateClosed,
}

impl AcquireError {
    /// Check if this error is a rate limit denial.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error came from the store.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Time to wait before retrying, for denials.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// The violated rate, for denials.
    pub fn rate(&self) -> Option<Rate> {
        match self {
            Self::RateLimited { rate, .. } => Some(*rate),
            _ => None,
        }
    }
}

/// Errors produced while building a [`Bucket`](crate::Bucket).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    /// The configured rates are invalid.
    #[error(transparent)]
    Rate(#[from] RateError),
    /// The concurrency limit exceeds what the slot pool can hold.
    #[error("concurrency must be <= {max} (got {requested})")]
    ConcurrencyTooLarge {
        /// Value provided by caller.
        requested: usize,
        /// Largest supported value.
        max: usize,
    },
}

/// Error returned by rate limited tower services.
#[derive(Debug, Clone)]
pub enum LimitError<E> {
    /// The request was denied by the rate limit.
    RateLimited {
        /// Time until the violated rate's window resets.
        retry_after: Duration,
        /// The rate whose window is furthest from resetting.
        rate: Rate,
    },
    /// The store failed while deciding.
    Store(StoreError),
    /// The bucket's concurrency gate was closed.
    GateClosed,
    /// The inner service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for LimitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after, rate } => {
                write!(f, "rate limit {} exceeded, retry after {:?}", rate, retry_after)
            }
            Self::Store(e) => write!(f, "{}", e),
            Self::GateClosed => write!(f, "concurrency gate closed"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for LimitError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<AcquireError> for LimitError<E> {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::RateLimited { retry_after, rate } => {
                Self::RateLimited { retry_after, rate }
            }
            AcquireError::Store(e) => Self::Store(e),
            AcquireError::GateClosed => Self::GateClosed,
        }
    }
}

impl<E> LimitError<E> {
    /// Check if this error is a rate limit denial.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Time to wait before retrying, for denials.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
