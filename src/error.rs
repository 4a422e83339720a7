//! Error types for AP235 operations.
//!
//! Every fallible operation in this crate returns [`Ap235Error`]. Argument
//! and state validation happens before any register is touched, so an
//! `InvalidArgument` or `InvalidState` error guarantees the board was left
//! alone. Hardware faults carry the carrier-library status code together
//! with the name of the operation that produced it.

use std::fmt;

use thiserror::Error;

use crate::calibration::OutputRange;

/// Result type alias for AP235 operations.
pub type Result<T> = std::result::Result<T, Ap235Error>;

/// Which end of an output range a value fell off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Below the low voltage endpoint or the low DN clip.
    TooLow,
    /// Above the high voltage endpoint or the high DN clip.
    TooHigh,
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLow => write!(f, "too low"),
            Self::TooHigh => write!(f, "too high"),
        }
    }
}

/// Non-OK status codes reported by the AP carrier library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApStatus {
    /// 0x8000, generic failure
    Error,
    /// 0x8001
    OutOfMemory,
    /// 0x8002, no free carrier slots
    OutOfAps,
    /// 0x8003
    InvalidHandle,
    /// 0x8006, board opened but not initialized
    NotInitialized,
    /// 0x8007
    NotImplemented,
    /// 0x8008, interrupt line unavailable
    NoInterrupts,
    /// Any code not in the table above
    Unknown(u32),
}

impl ApStatus {
    /// The status word the carrier library uses for success.
    pub const OK: u32 = 0;

    /// Decode a raw status word. Returns `None` for [`ApStatus::OK`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            Self::OK => None,
            0x8000 => Some(Self::Error),
            0x8001 => Some(Self::OutOfMemory),
            0x8002 => Some(Self::OutOfAps),
            0x8003 => Some(Self::InvalidHandle),
            0x8006 => Some(Self::NotInitialized),
            0x8007 => Some(Self::NotImplemented),
            0x8008 => Some(Self::NoInterrupts),
            other => Some(Self::Unknown(other)),
        }
    }

    /// Raw status word.
    pub fn code(self) -> u32 {
        match self {
            Self::Error => 0x8000,
            Self::OutOfMemory => 0x8001,
            Self::OutOfAps => 0x8002,
            Self::InvalidHandle => 0x8003,
            Self::NotInitialized => 0x8006,
            Self::NotImplemented => 0x8007,
            Self::NoInterrupts => 0x8008,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ApStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "ERROR"),
            Self::OutOfMemory => write!(f, "OUT OF MEMORY"),
            Self::OutOfAps => write!(f, "OUT OF APs"),
            Self::InvalidHandle => write!(f, "INVALID HANDLE"),
            Self::NotInitialized => write!(f, "NOT INITIALIZED"),
            Self::NotImplemented => write!(f, "NOT IMPLEMENTED"),
            Self::NoInterrupts => write!(f, "NO INTERRUPTS"),
            Self::Unknown(_) => write!(f, "UNKNOWN"),
        }
    }
}

/// Errors that can occur when driving an AP235 board.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Ap235Error {
    /// Bad channel index, unknown enum string, oversized buffer and similar
    /// caller mistakes. No register was written.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A voltage could not be represented in the channel's output range.
    #[error("Value {value} is {bound} for output range {range}{}", channel_suffix(.channel))]
    OutOfRange {
        /// Channel the value was destined for, when known.
        channel: Option<usize>,
        value: f64,
        bound: Bound,
        range: OutputRange,
    },

    /// The operation is not valid in the current engine or channel state.
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// A bounded register poll ran out of attempts.
    #[error("Timed out waiting for {operation} after {attempts} attempts")]
    Timeout { operation: String, attempts: u32 },

    /// A register operation reported a non-OK status.
    #[error("Hardware fault {status} (0x{:04X}) during {operation}", .status.code())]
    HardwareFault { status: ApStatus, operation: String },

    /// The timer divider was programmed, but the period is shorter than the
    /// DAC needs to settle to 1 LSB.
    #[error("Timer period {period_ns} ns (divider {divider}) is below the DAC settling limit; value applied")]
    TimerTooFast { period_ns: u32, divider: u32 },
}

fn channel_suffix(channel: &Option<usize>) -> String {
    match channel {
        Some(ch) => format!(" on channel {}", ch),
        None => String::new(),
    }
}

impl Ap235Error {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Convert a carrier-library status word into a result, tagging failures
    /// with the operation that produced them.
    pub fn check_status(code: u32, operation: &str) -> Result<()> {
        match ApStatus::from_code(code) {
            None => Ok(()),
            Some(status) => Err(Self::HardwareFault {
                status,
                operation: operation.to_string(),
            }),
        }
    }

    /// Attach a channel to an out-of-range error. Other variants pass through.
    #[must_use]
    pub fn on_channel(self, ch: usize) -> Self {
        match self {
            Self::OutOfRange {
                value, bound, range, ..
            } => Self::OutOfRange {
                channel: Some(ch),
                value,
                bound,
                range,
            },
            other => other,
        }
    }

    /// Check if this is a bounded-poll timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the operation took effect despite the error.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::TimerTooFast { .. })
    }

    /// Check if this is a conversion failure.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Self::OutOfRange { .. })
    }

    /// Check if this is a state-machine rejection.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        assert_eq!(ApStatus::from_code(0), None);
        assert_eq!(ApStatus::from_code(0x8003), Some(ApStatus::InvalidHandle));
        assert_eq!(ApStatus::from_code(0x8008), Some(ApStatus::NoInterrupts));
        assert_eq!(ApStatus::from_code(0x8004), Some(ApStatus::Unknown(0x8004)));
        assert_eq!(ApStatus::OutOfAps.code(), 0x8002);
    }

    #[test]
    fn test_check_status_names_operation() {
        assert!(Ap235Error::check_status(0, "APOpen").is_ok());
        let err = Ap235Error::check_status(0x8006, "APOpen").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("NOT INITIALIZED"));
        assert!(text.contains("0x8006"));
        assert!(text.contains("APOpen"));
    }

    #[test]
    fn test_out_of_range_display() {
        let err = Ap235Error::OutOfRange {
            channel: None,
            value: 10.5,
            bound: Bound::TooHigh,
            range: OutputRange::Bipolar10V,
        };
        assert_eq!(err.to_string(), "Value 10.5 is too high for output range -10,10");

        let err = err.on_channel(3);
        assert!(err.to_string().ends_with("on channel 3"));
        assert!(err.is_out_of_range());
    }

    #[test]
    fn test_timer_too_fast_is_warning() {
        let err = Ap235Error::TimerTooFast {
            period_ns: 9600,
            divider: 300,
        };
        assert!(err.is_warning());
        assert!(!err.is_timeout());
    }
}
