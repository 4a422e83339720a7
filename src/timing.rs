//! Board timer and trigger line.
//!
//! The internal timer divides a 32 ns tick. Below a divider of 310 the DAC
//! cannot settle to 1 LSB before the next update; such periods are still
//! programmed and reported with [`Ap235Error::TimerTooFast`]. Below 620 the
//! DMA engine cannot keep all sixteen channels fed, which is logged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Ap235Error, Result};

/// Nanoseconds per timer tick.
pub const TIMER_TICK_NS: u32 = 32;

/// Smallest divider at which the DAC settles to 1 LSB between updates.
pub const MIN_SETTLED_DIVIDER: u32 = 310;

/// Smallest divider at which all sixteen channels can be streamed at once.
pub const MIN_FULL_LOAD_DIVIDER: u32 = 2 * MIN_SETTLED_DIVIDER;

/// Direction of the external trigger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerDirection {
    /// The board listens on the trigger line.
    #[default]
    Input,
    /// The board drives its timer onto the trigger line.
    Output,
}

impl fmt::Display for TriggerDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

impl FromStr for TriggerDirection {
    type Err = Ap235Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "input" | "in" => Ok(Self::Input),
            "output" | "out" => Ok(Self::Output),
            other => Err(Ap235Error::invalid_argument(format!(
                "unknown trigger direction '{}', expected input or output",
                other
            ))),
        }
    }
}

/// Divider for a requested period, truncating to whole ticks.
pub fn divider_for_period(period_ns: u32) -> u32 {
    period_ns / TIMER_TICK_NS
}

/// Period produced by a divider.
pub fn period_for_divider(divider: u32) -> u32 {
    divider.saturating_mul(TIMER_TICK_NS)
}

/// Classify a divider that has already been programmed.
///
/// Returns `Ok` for settled dividers and `TimerTooFast` otherwise; in both
/// cases the caller has applied the value.
pub fn check_divider(period_ns: u32, divider: u32) -> Result<()> {
    if divider < MIN_SETTLED_DIVIDER {
        warn!(
            period_ns,
            divider,
            minimum = MIN_SETTLED_DIVIDER,
            "Timer period shorter than DAC settling time; applied anyway"
        );
        return Err(Ap235Error::TimerTooFast { period_ns, divider });
    }
    if divider < MIN_FULL_LOAD_DIVIDER {
        warn!(
            period_ns,
            divider, "Timer period too short to stream all sixteen channels at once"
        );
    } else {
        info!(period_ns, divider, "Timer period set");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divider_truncates() {
        assert_eq!(divider_for_period(9600), 300);
        assert_eq!(divider_for_period(9631), 300);
        assert_eq!(period_for_divider(300), 9600);
    }

    #[test]
    fn test_settling_threshold() {
        assert!(matches!(
            check_divider(9600, 300),
            Err(Ap235Error::TimerTooFast {
                period_ns: 9600,
                divider: 300
            })
        ));
        assert!(check_divider(9920, 310).is_ok());
        assert!(check_divider(100_000, 3125).is_ok());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_partial_load_warning_logged() {
        assert!(check_divider(12_800, 400).is_ok());
        assert!(logs_contain("too short to stream all sixteen channels"));
    }

    #[test]
    fn test_direction_strings() {
        assert_eq!("output".parse::<TriggerDirection>().unwrap(), TriggerDirection::Output);
        assert_eq!(TriggerDirection::Input.to_string(), "input");
        assert!("sideways".parse::<TriggerDirection>().is_err());
    }
}
