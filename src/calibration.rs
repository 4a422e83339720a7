//! Output ranges and the voltage/DN calibration.
//!
//! Each [`OutputRange`] selects one row of a static table of ideal
//! calibration constants. Conversions are affine in each range:
//!
//! ```text
//! dn = round(volts * slope + zero)          (two's complement DN)
//! volts = (dn - zero) / slope
//! ```
//!
//! Range checks are made in both voltage space and DN space. Quantization
//! can push a nominally in-range voltage past the DN clip at the top of a
//! range (for example +10 V on the ±10 V range rounds to code 32768), and
//! such values are rejected the same way as out-of-range voltages.
//!
//! The board stores samples as straight binary; [`encode_straight_binary`]
//! and [`decode_straight_binary`] convert between the two representations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Ap235Error, Bound, Result};
use crate::registers::CHANNEL_COUNT;

/// DAC output range. The discriminant is the range code written to the
/// channel's control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputRange {
    /// -10 V to +10 V
    #[default]
    Bipolar10V = 0,
    /// 0 V to +10 V
    Unipolar10V = 1,
    /// -5 V to +5 V
    Bipolar5V = 2,
    /// 0 V to +5 V
    Unipolar5V = 3,
    /// -2.5 V to +7.5 V
    Offset2_5To7_5V = 4,
    /// -3 V to +3 V
    Bipolar3V = 5,
    /// 0 V to +16 V, needs an external supply
    Unipolar16V = 6,
    /// 0 V to +20 V, needs an external supply
    Unipolar20V = 7,
}

impl OutputRange {
    /// All ranges in table order.
    pub const ALL: [OutputRange; 8] = [
        Self::Bipolar10V,
        Self::Unipolar10V,
        Self::Bipolar5V,
        Self::Unipolar5V,
        Self::Offset2_5To7_5V,
        Self::Bipolar3V,
        Self::Unipolar16V,
        Self::Unipolar20V,
    ];

    /// Row index into [`CALIBRATION_TABLE`], also the hardware range code.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Decode a hardware range code (the low three bits).
    pub fn from_code(code: u32) -> Self {
        Self::ALL[(code & 0x7) as usize]
    }

    /// Calibration constants for this range.
    pub fn calibration(self) -> &'static CalibrationRow {
        &CALIBRATION_TABLE[self.index()]
    }

    /// Nominal (low, high) voltage endpoints.
    pub fn min_max(self) -> (f64, f64) {
        let row = self.calibration();
        (row.voltage_low, row.voltage_high)
    }

    /// Volts per DN.
    pub fn lsb(self) -> f64 {
        1.0 / self.calibration().slope
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Bipolar10V => "-10,10",
            Self::Unipolar10V => "0,10",
            Self::Bipolar5V => "-5,5",
            Self::Unipolar5V => "0,5",
            Self::Offset2_5To7_5V => "-2.5,7.5",
            Self::Bipolar3V => "-3,3",
            Self::Unipolar16V => "0,16",
            Self::Unipolar20V => "0,20",
        }
    }
}

impl fmt::Display for OutputRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputRange {
    type Err = Ap235Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s.trim())
            .ok_or_else(|| {
                Ap235Error::invalid_argument(format!(
                    "unknown output range '{}', expected one of -10,10 0,10 -5,5 0,5 -2.5,7.5 -3,3 0,16 0,20",
                    s
                ))
            })
    }
}

impl Serialize for OutputRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OutputRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Ideal calibration constants for one output range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationRow {
    /// Zero-volt code in straight binary.
    pub zero_straight_binary: f64,
    /// Zero-volt code in two's complement.
    pub zero_twos_complement: f64,
    /// DN per volt.
    pub slope: f64,
    /// Low voltage endpoint.
    pub voltage_low: f64,
    /// High voltage endpoint.
    pub voltage_high: f64,
    /// Lowest representable DN.
    pub clip_low: f64,
    /// Highest representable DN.
    pub clip_high: f64,
}

const fn row(zero_sb: f64, zero_btc: f64, slope: f64, lo: f64, hi: f64) -> CalibrationRow {
    CalibrationRow {
        zero_straight_binary: zero_sb,
        zero_twos_complement: zero_btc,
        slope,
        voltage_low: lo,
        voltage_high: hi,
        clip_low: -32768.0,
        clip_high: 32767.0,
    }
}

/// Ideal zero, slope, endpoint and clip constants, indexed by [`OutputRange::index`].
pub static CALIBRATION_TABLE: [CalibrationRow; 8] = [
    row(32768.0, 0.0, 3276.8, -10.0, 10.0),
    row(0.0, -32768.0, 6553.6, 0.0, 10.0),
    row(32768.0, 0.0, 6553.6, -5.0, 5.0),
    row(0.0, -32768.0, 13107.2, 0.0, 5.0),
    row(16384.0, -16384.0, 6553.6, -2.5, 7.5),
    row(32768.0, 0.0, 10922.67, -3.0, 3.0),
    row(0.0, -32768.0, 4095.9, 0.0, 16.0),
    row(0.0, -32768.0, 3276.8, 0.0, 20.0),
];

/// Per-channel, per-range offset and gain correction.
///
/// Offset is in 1/16 LSB, gain in parts of 2^20.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Correction {
    /// Offset correction, 1/16 LSB units.
    pub offset: i16,
    /// Gain correction, 2^-20 units.
    pub gain: i16,
}

impl Correction {
    /// No correction; conversions reduce to the ideal table.
    pub const IDEAL: Correction = Correction { offset: 0, gain: 0 };

    fn effective_slope(self, row: &CalibrationRow) -> f64 {
        (1.0 + f64::from(self.gain) / 1_048_576.0) * row.slope
    }

    fn effective_zero(self, row: &CalibrationRow) -> f64 {
        row.zero_twos_complement + f64::from(self.offset) / 16.0
    }
}

/// Correction coefficients for every channel and range of one board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionTable {
    entries: [[Correction; 8]; CHANNEL_COUNT],
}

impl Default for CorrectionTable {
    fn default() -> Self {
        Self {
            entries: [[Correction::IDEAL; 8]; CHANNEL_COUNT],
        }
    }
}

impl CorrectionTable {
    /// Coefficients for `channel` in `range`. Channels past the board's
    /// last channel read as ideal.
    pub fn get(&self, channel: usize, range: OutputRange) -> Correction {
        self.entries
            .get(channel)
            .map(|ranges| ranges[range.index()])
            .unwrap_or(Correction::IDEAL)
    }

    /// Replace the coefficients for `channel` in `range`.
    pub fn set(&mut self, channel: usize, range: OutputRange, correction: Correction) -> Result<()> {
        let slot = self.entries.get_mut(channel).ok_or_else(|| {
            Ap235Error::invalid_argument(format!(
                "channel {} out of range (board has {} channels)",
                channel, CHANNEL_COUNT
            ))
        })?;
        slot[range.index()] = correction;
        Ok(())
    }
}

/// Convert volts to a two's-complement DN using the ideal calibration.
pub fn voltage_to_dn(range: OutputRange, volts: f64) -> Result<i16> {
    voltage_to_dn_corrected(range, volts, Correction::IDEAL)
}

/// Convert volts to a two's-complement DN, applying offset/gain correction.
///
/// Fails with `OutOfRange` when the voltage lies outside the range's
/// endpoints or the rounded code lies outside the DN clip bounds.
pub fn voltage_to_dn_corrected(range: OutputRange, volts: f64, correction: Correction) -> Result<i16> {
    if !volts.is_finite() {
        return Err(Ap235Error::invalid_argument(format!(
            "voltage must be finite, got {}",
            volts
        )));
    }

    let row = range.calibration();
    let dn = (correction.effective_slope(row) * volts + correction.effective_zero(row)).round();

    let bound = if volts < row.voltage_low || dn < row.clip_low {
        Some(Bound::TooLow)
    } else if volts > row.voltage_high || dn > row.clip_high {
        Some(Bound::TooHigh)
    } else {
        None
    };

    match bound {
        Some(bound) => Err(Ap235Error::OutOfRange {
            channel: None,
            value: volts,
            bound,
            range,
        }),
        None => Ok(dn as i16),
    }
}

/// Convert a two's-complement DN back to volts using the ideal calibration.
///
/// Always succeeds; codes outside the nominal endpoints map to voltages
/// outside them.
pub fn dn_to_voltage(range: OutputRange, dn: i16) -> f64 {
    let row = range.calibration();
    (f64::from(dn) - row.zero_twos_complement) / row.slope
}

/// Two's complement DN to the straight-binary code the DAC consumes.
pub fn encode_straight_binary(dn: i16) -> u16 {
    (dn as u16) ^ 0x8000
}

/// Straight-binary DAC code back to a two's-complement DN.
pub fn decode_straight_binary(code: u16) -> i16 {
    (code ^ 0x8000) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep(range: OutputRange, steps: usize) -> impl Iterator<Item = f64> {
        let (lo, hi) = range.min_max();
        (0..=steps).map(move |i| lo + (hi - lo) * i as f64 / steps as f64)
    }

    #[test]
    fn test_round_trip_within_one_lsb() {
        for range in OutputRange::ALL {
            let lsb = range.lsb();
            for v in sweep(range, 997) {
                // The top endpoint may quantize past the clip; those are
                // covered by the boundary test below.
                if let Ok(dn) = voltage_to_dn(range, v) {
                    let back = dn_to_voltage(range, dn);
                    assert!(
                        (back - v).abs() <= lsb,
                        "{}: {} -> {} -> {}",
                        range,
                        v,
                        dn,
                        back
                    );
                }
            }
        }
    }

    #[test]
    fn test_endpoints_outside_are_rejected() {
        for range in OutputRange::ALL {
            let (lo, hi) = range.min_max();
            for eps in [1e-9, 1e-3, 0.5, 100.0] {
                match voltage_to_dn(range, lo - eps) {
                    Err(Ap235Error::OutOfRange { bound, .. }) => assert_eq!(bound, Bound::TooLow),
                    other => panic!("{} at {}: {:?}", range, lo - eps, other),
                }
                match voltage_to_dn(range, hi + eps) {
                    Err(Ap235Error::OutOfRange { bound, .. }) => assert_eq!(bound, Bound::TooHigh),
                    other => panic!("{} at {}: {:?}", range, hi + eps, other),
                }
            }
        }
    }

    #[test]
    fn test_top_endpoint_clips_in_dn_space() {
        // +10 V rounds to 32768 on the ±10 V range.
        let err = voltage_to_dn(OutputRange::Bipolar10V, 10.0).unwrap_err();
        assert!(matches!(err, Ap235Error::OutOfRange { bound: Bound::TooHigh, .. }));
        // +3 V rounds to 32768 as well because of the truncated slope.
        assert!(voltage_to_dn(OutputRange::Bipolar3V, 3.0).is_err());
        // One LSB below the top is fine.
        assert_eq!(voltage_to_dn(OutputRange::Bipolar10V, 10.0 - 1.0 / 3276.8).unwrap(), 32767);
    }

    #[test]
    fn test_known_codes() {
        assert_eq!(voltage_to_dn(OutputRange::Bipolar10V, 0.0).unwrap(), 0);
        assert_eq!(voltage_to_dn(OutputRange::Bipolar10V, -10.0).unwrap(), -32768);
        assert_eq!(voltage_to_dn(OutputRange::Bipolar10V, 1.0).unwrap(), 3277);
        assert_eq!(voltage_to_dn(OutputRange::Unipolar10V, 0.0).unwrap(), -32768);
        assert_eq!(voltage_to_dn(OutputRange::Unipolar10V, 5.0).unwrap(), 0);
        assert_eq!(voltage_to_dn(OutputRange::Offset2_5To7_5V, 0.0).unwrap(), -16384);
    }

    #[test]
    fn test_non_finite_voltage() {
        assert!(matches!(
            voltage_to_dn(OutputRange::Bipolar5V, f64::NAN),
            Err(Ap235Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_correction_shifts_code() {
        let offset = Correction { offset: 32, gain: 0 };
        assert_eq!(voltage_to_dn_corrected(OutputRange::Bipolar10V, 0.0, offset).unwrap(), 2);

        let gain = Correction {
            offset: 0,
            gain: 1024,
        };
        // slope * (1 + 1024/2^20) at 5 V: 16384 * 1.0009765625 = 16400
        assert_eq!(voltage_to_dn_corrected(OutputRange::Bipolar10V, 5.0, gain).unwrap(), 16400);
        assert_eq!(
            voltage_to_dn_corrected(OutputRange::Bipolar10V, 1.0, Correction::IDEAL).unwrap(),
            voltage_to_dn(OutputRange::Bipolar10V, 1.0).unwrap()
        );
    }

    #[test]
    fn test_straight_binary() {
        assert_eq!(encode_straight_binary(0), 0x8000);
        assert_eq!(encode_straight_binary(-32768), 0x0000);
        assert_eq!(encode_straight_binary(32767), 0xFFFF);
        assert_eq!(decode_straight_binary(0x8000), 0);
        assert_eq!(decode_straight_binary(encode_straight_binary(-1234)), -1234);
    }

    #[test]
    fn test_range_strings() {
        for range in OutputRange::ALL {
            assert_eq!(range.to_string().parse::<OutputRange>().unwrap(), range);
            assert_eq!(OutputRange::from_code(range as u32), range);
        }
        assert_eq!(OutputRange::Offset2_5To7_5V.min_max(), (-2.5, 7.5));
        assert!("1,2".parse::<OutputRange>().is_err());
    }

    #[test]
    fn test_correction_table_bounds() {
        let mut table = CorrectionTable::default();
        let c = Correction { offset: -4, gain: 9 };
        table.set(15, OutputRange::Unipolar5V, c).unwrap();
        assert_eq!(table.get(15, OutputRange::Unipolar5V), c);
        assert_eq!(table.get(15, OutputRange::Bipolar5V), Correction::IDEAL);
        assert!(table.set(16, OutputRange::Unipolar5V, c).is_err());
    }
}
