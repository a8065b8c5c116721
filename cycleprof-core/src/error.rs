//! Error type for profiler operations.

use std::fmt;
use std::io;

use crate::record_builder::RecordTooLarge;
use crate::ring_buffer::RingError;

/// Result type for profiler operations.
pub type ProfilerResult<T = ()> = Result<T, ProfilerError>;

#[derive(Debug)]
pub enum ProfilerError {
    /// A record did not fit the scratch buffer and was dropped.
    RecordTooLarge { size: usize, limit: usize },
    /// The ring had no room for a record and it was dropped.
    RingOverflow { filled: u32, needed: usize },
    /// A flush batch could not be delivered to some subscribers.
    FlushDeliveryFailure { failed: usize, delivered: usize },
    /// The resource layer could not allocate a subscriber.
    ResourceAllocationFailed(String),
    /// The flush loop could not be created.
    TimerResourceUnavailable(io::Error),
    InvalidConfig(String),
    /// The profiler was shut down.
    ShutDown,
}

impl fmt::Display for ProfilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecordTooLarge { size, limit } => {
                write!(f, "record too large: {} > {} bytes", size, limit)
            }
            Self::RingOverflow { filled, needed } => {
                write!(f, "queue full: {} bytes queued, {} needed", filled, needed)
            }
            Self::FlushDeliveryFailure { failed, delivered } => write!(
                f,
                "flush delivery failed for {} subscriber(s), {} delivered",
                failed, delivered
            ),
            Self::ResourceAllocationFailed(reason) => {
                write!(f, "cannot allocate subscriber: {}", reason)
            }
            Self::TimerResourceUnavailable(e) => write!(f, "cannot create flush timer: {}", e),
            Self::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            Self::ShutDown => write!(f, "profiler is shut down"),
        }
    }
}

impl std::error::Error for ProfilerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TimerResourceUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RecordTooLarge> for ProfilerError {
    fn from(e: RecordTooLarge) -> Self {
        Self::RecordTooLarge {
            size: e.size,
            limit: e.limit,
        }
    }
}

impl From<RingError> for ProfilerError {
    fn from(e: RingError) -> Self {
        match e {
            RingError::Full { filled, needed } => Self::RingOverflow { filled, needed },
            RingError::Xrun { filled } => Self::RingOverflow { filled, needed: 0 },
        }
    }
}
