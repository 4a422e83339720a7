//! Per-channel configuration with write-through to the board.
//!
//! [`ChannelBank`] holds the in-memory mirror of every channel's
//! configuration. Its setters are the only way to change a
//! [`ChannelConfig`], and each one pushes the complete channel
//! configuration to the board before returning, so the mirror always
//! matches the hardware and getters never need a register read.
//!
//! A full push follows the board's channel configuration sequence:
//!
//! 1. mask the channel's interrupt
//! 2. issue the full-reset and data-reset commands if requested
//! 3. write the DAC control word (range, power-up and clear scale, thermal
//!    shutdown, over-range)
//! 4. write underflow-clear to the channel status register
//! 5. write the board timer divider and trigger direction
//! 6. write operating mode and trigger source to the channel control register

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::OutputRange;
use crate::error::{Ap235Error, Result};
use crate::io::RegisterIo;
use crate::registers::{
    channel_register, ChannelRegister, ChannelStatusBits, CommonControl, DacCommand, CHANNEL_COUNT,
    COMMON_CONTROL, INTERRUPT_CLEAR_ENABLE, TIMER_DIVIDER,
};
use crate::timing::TriggerDirection;

/// Output level a channel takes at power-up or on clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputScale {
    /// Bottom of the range.
    #[default]
    Zero = 0,
    /// Middle of the range.
    Mid = 1,
    /// Top of the range.
    Full = 2,
}

/// What advances a channel to its next sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerSource {
    /// A write to the software trigger register.
    #[default]
    Software = 0,
    /// The board's internal timer.
    Timer = 1,
    /// The external trigger input.
    External = 2,
}

/// Whether a channel is written one sample at a time or fed from its FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatingMode {
    /// Direct access, one sample per write.
    #[default]
    Single,
    /// FIFO fed by scatter-gather DMA.
    Waveform,
}

impl OperatingMode {
    /// Mode code for the channel control register. DMA-fed FIFO mode is
    /// plain FIFO mode as far as the channel is concerned.
    fn register_code(self) -> u32 {
        match self {
            Self::Single => 0,
            Self::Waveform => 2,
        }
    }
}

macro_rules! string_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Self::$variant => f.write_str($text),)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = Ap235Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Ap235Error::invalid_argument(format!(
                        concat!("unknown ", $what, " '{}', expected one of", $(" ", $text),+),
                        other
                    ))),
                }
            }
        }

        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_enum!(OutputScale, "output scale", { Zero => "zero", Mid => "mid", Full => "full" });
string_enum!(TriggerSource, "trigger source", { Software => "software", Timer => "timer", External => "external" });
string_enum!(OperatingMode, "operating mode", { Single => "single", Waveform => "waveform" });

/// Configuration of one DAC channel.
///
/// Read-only outside this module; change it through [`ChannelBank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChannelConfig {
    range: OutputRange,
    power_up_scale: OutputScale,
    clear_scale: OutputScale,
    thermal_shutdown: bool,
    over_range_allowed: bool,
    trigger_source: TriggerSource,
    simultaneous_update: bool,
    underflow_clear: bool,
    operating_mode: OperatingMode,
}

impl ChannelConfig {
    /// Output range.
    pub fn range(&self) -> OutputRange {
        self.range
    }

    /// Output level at power-up.
    pub fn power_up_scale(&self) -> OutputScale {
        self.power_up_scale
    }

    /// Output level on clear.
    pub fn clear_scale(&self) -> OutputScale {
        self.clear_scale
    }

    /// Shut the output down on over-temperature.
    pub fn thermal_shutdown(&self) -> bool {
        self.thermal_shutdown
    }

    /// Allow the 5% over-range band.
    pub fn over_range_allowed(&self) -> bool {
        self.over_range_allowed
    }

    /// Trigger source.
    pub fn trigger_source(&self) -> TriggerSource {
        self.trigger_source
    }

    /// Latch writes on the next software trigger instead of immediately.
    pub fn simultaneous_update(&self) -> bool {
        self.simultaneous_update
    }

    /// Drive the clear level when the FIFO underflows.
    pub fn underflow_clear(&self) -> bool {
        self.underflow_clear
    }

    /// Direct access or FIFO waveform mode.
    pub fn operating_mode(&self) -> OperatingMode {
        self.operating_mode
    }

    /// DAC control word payload for the `WriteControl` command.
    fn control_word(&self) -> u32 {
        (self.clear_scale as u32) << 9
            | u32::from(self.over_range_allowed) << 8
            | u32::from(self.thermal_shutdown) << 6
            | (self.power_up_scale as u32) << 3
            | self.range as u32
    }

    /// Channel control register value.
    fn channel_control(&self) -> u32 {
        self.operating_mode.register_code() | (self.trigger_source as u32) << 2
    }

    /// Direct-access command used for single-sample writes.
    pub(crate) fn write_command(&self) -> DacCommand {
        if self.simultaneous_update {
            DacCommand::SimultaneousWrite
        } else {
            DacCommand::TransparentWrite
        }
    }
}

/// Reset commands to issue ahead of a configuration push.
#[derive(Debug, Clone, Copy, Default)]
struct Pulse {
    data_reset: bool,
    full_reset: bool,
}

/// Mirrors of all sixteen channel configurations plus the board-wide
/// settings that travel with every push.
#[derive(Debug, Clone)]
pub struct ChannelBank {
    configs: [ChannelConfig; CHANNEL_COUNT],
    timer_divider: u32,
    trigger_direction: TriggerDirection,
    locked: u32,
}

impl Default for ChannelBank {
    fn default() -> Self {
        Self {
            configs: [ChannelConfig::default(); CHANNEL_COUNT],
            timer_divider: 0,
            trigger_direction: TriggerDirection::default(),
            locked: 0,
        }
    }
}

fn write_trigger_direction(io: &dyn RegisterIo, direction: TriggerDirection) -> Result<()> {
    let mut common = CommonControl::from_bits_retain(io.read_register(COMMON_CONTROL)?);
    common.set(CommonControl::TRIGGER_DIRECTION, direction == TriggerDirection::Output);
    io.write_register(COMMON_CONTROL, common.bits())
}

/// Reject channel indices the board does not have.
pub fn validate_channel(channel: usize) -> Result<()> {
    if channel >= CHANNEL_COUNT {
        return Err(Ap235Error::invalid_argument(format!(
            "channel {} out of range (board has {} channels)",
            channel, CHANNEL_COUNT
        )));
    }
    Ok(())
}

macro_rules! setter {
    ($(#[$doc:meta])* $name:ident, $field:ident: $ty:ty) => {
        $(#[$doc])*
        pub fn $name(&mut self, io: &dyn RegisterIo, channel: usize, value: $ty) -> Result<()> {
            self.update(io, channel, |cfg| cfg.$field = value)
        }
    };
}

impl ChannelBank {
    /// Snapshot of one channel's configuration.
    pub fn config(&self, channel: usize) -> Result<ChannelConfig> {
        validate_channel(channel)?;
        Ok(self.configs[channel])
    }

    /// Timer divider pushed with every configuration write.
    pub fn timer_divider(&self) -> u32 {
        self.timer_divider
    }

    /// Trigger line direction pushed with every configuration write.
    pub fn trigger_direction(&self) -> TriggerDirection {
        self.trigger_direction
    }

    /// Channels whose configuration is frozen, one bit per channel.
    pub fn locked_mask(&self) -> u32 {
        self.locked
    }

    /// Freeze (or release) channel configuration while the waveform engine
    /// owns the channels.
    pub(crate) fn set_locked(&mut self, mask: u32) {
        self.locked = mask;
    }

    fn check_unlocked(&self, channel: usize) -> Result<()> {
        if self.locked & (1 << channel) != 0 {
            return Err(Ap235Error::invalid_state(format!(
                "channel {} is held by the waveform engine; halt or reset the waveform before reconfiguring it",
                channel
            )));
        }
        Ok(())
    }

    /// Apply `f` to a copy of the mirror and push it. The mirror only
    /// changes once every register write has gone through.
    fn update(&mut self, io: &dyn RegisterIo, channel: usize, f: impl FnOnce(&mut ChannelConfig)) -> Result<()> {
        validate_channel(channel)?;
        self.check_unlocked(channel)?;
        let mut cfg = self.configs[channel];
        f(&mut cfg);
        self.push(io, channel, &cfg, Pulse::default())?;
        self.configs[channel] = cfg;
        Ok(())
    }

    setter!(
        /// Select the output range.
        set_range, range: OutputRange
    );
    setter!(
        /// Select the power-up output level.
        set_power_up_scale, power_up_scale: OutputScale
    );
    setter!(
        /// Select the clear output level.
        set_clear_scale, clear_scale: OutputScale
    );
    setter!(
        /// Enable or disable thermal shutdown.
        set_thermal_shutdown, thermal_shutdown: bool
    );
    setter!(
        /// Allow or forbid the over-range band.
        set_over_range_allowed, over_range_allowed: bool
    );
    setter!(
        /// Select the trigger source.
        set_trigger_source, trigger_source: TriggerSource
    );
    setter!(
        /// Choose simultaneous (latched on flush) or immediate update.
        set_simultaneous_update, simultaneous_update: bool
    );
    setter!(
        /// Enable or disable clear-on-underflow.
        set_underflow_clear, underflow_clear: bool
    );
    setter!(
        /// Switch between direct access and FIFO waveform mode.
        set_operating_mode, operating_mode: OperatingMode
    );

    /// Clear the channel's output data, keeping its configuration.
    pub fn clear(&mut self, io: &dyn RegisterIo, channel: usize) -> Result<()> {
        validate_channel(channel)?;
        self.check_unlocked(channel)?;
        self.push(
            io,
            channel,
            &self.configs[channel],
            Pulse {
                data_reset: true,
                full_reset: false,
            },
        )
    }

    /// Return the channel's data and configuration to power-on defaults.
    pub fn reset(&mut self, io: &dyn RegisterIo, channel: usize) -> Result<()> {
        validate_channel(channel)?;
        self.check_unlocked(channel)?;
        let cfg = ChannelConfig::default();
        self.push(
            io,
            channel,
            &cfg,
            Pulse {
                data_reset: false,
                full_reset: true,
            },
        )?;
        self.configs[channel] = cfg;
        Ok(())
    }

    /// Program the timer divider. It is also rewritten by every later push.
    pub(crate) fn set_timer_divider(&mut self, io: &dyn RegisterIo, divider: u32) -> Result<()> {
        io.write_register(TIMER_DIVIDER, divider)?;
        self.timer_divider = divider;
        Ok(())
    }

    /// Program the trigger line direction. It is also rewritten by every later push.
    pub(crate) fn set_trigger_direction(&mut self, io: &dyn RegisterIo, direction: TriggerDirection) -> Result<()> {
        write_trigger_direction(io, direction)?;
        self.trigger_direction = direction;
        Ok(())
    }

    /// Switch a channel's operating mode and trigger source in one push.
    pub(crate) fn set_stream_mode(
        &mut self,
        io: &dyn RegisterIo,
        channel: usize,
        mode: OperatingMode,
        trigger: TriggerSource,
    ) -> Result<()> {
        self.update(io, channel, |cfg| {
            cfg.operating_mode = mode;
            cfg.trigger_source = trigger;
        })
    }

    /// Rewrite one channel's configuration unchanged.
    pub(crate) fn push_channel(&self, io: &dyn RegisterIo, channel: usize) -> Result<()> {
        validate_channel(channel)?;
        self.push(io, channel, &self.configs[channel], Pulse::default())
    }

    /// Push every channel's configuration, e.g. after opening the board.
    pub fn push_all(&self, io: &dyn RegisterIo) -> Result<()> {
        for channel in 0..CHANNEL_COUNT {
            self.push(io, channel, &self.configs[channel], Pulse::default())?;
        }
        Ok(())
    }

    /// Write the full configuration of one channel.
    fn push(&self, io: &dyn RegisterIo, channel: usize, cfg: &ChannelConfig, pulse: Pulse) -> Result<()> {
        let direct = channel_register(channel, ChannelRegister::DirectAccess);

        io.write_register(INTERRUPT_CLEAR_ENABLE, 1 << channel)?;
        if pulse.full_reset {
            io.write_register(direct, DacCommand::FullReset.word(0))?;
        }
        if pulse.data_reset {
            io.write_register(direct, DacCommand::DataReset.word(0))?;
        }
        io.write_register(direct, DacCommand::WriteControl.word(cfg.control_word()))?;

        let underflow = if cfg.underflow_clear {
            ChannelStatusBits::FIFO_UNDERFLOW.bits()
        } else {
            0
        };
        io.write_register(channel_register(channel, ChannelRegister::Status), underflow)?;
        io.write_register(TIMER_DIVIDER, self.timer_divider)?;

        write_trigger_direction(io, self.trigger_direction)?;

        io.write_register(channel_register(channel, ChannelRegister::Control), cfg.channel_control())?;

        debug!(
            channel,
            range = %cfg.range,
            trigger = %cfg.trigger_source,
            mode = %cfg.operating_mode,
            simultaneous = cfg.simultaneous_update,
            data_reset = pulse.data_reset,
            full_reset = pulse.full_reset,
            "Pushed channel configuration"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApStatus;
    use crate::sim::SimulatedBoard;

    fn direct(ch: usize) -> u32 {
        channel_register(ch, ChannelRegister::DirectAccess)
    }

    #[test]
    fn test_every_setter_pushes_control_word() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();

        bank.set_range(&board, 3, OutputRange::Unipolar5V).unwrap();
        assert_eq!(board.last_write(direct(3)), Some(0x0004_0003));

        bank.set_power_up_scale(&board, 3, OutputScale::Mid).unwrap();
        assert_eq!(board.last_write(direct(3)), Some(0x0004_000B));

        bank.set_clear_scale(&board, 3, OutputScale::Full).unwrap();
        bank.set_over_range_allowed(&board, 3, true).unwrap();
        bank.set_thermal_shutdown(&board, 3, true).unwrap();
        assert_eq!(board.last_write(direct(3)), Some(0x0004_054B));
        assert_eq!(board.writes_to(direct(3)), 5);

        let cfg = bank.config(3).unwrap();
        assert_eq!(cfg.range(), OutputRange::Unipolar5V);
        assert_eq!(cfg.clear_scale(), OutputScale::Full);
        assert!(cfg.thermal_shutdown());
        assert!(cfg.over_range_allowed());
    }

    #[test]
    fn test_channel_control_and_status_words() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        bank.set_trigger_source(&board, 1, TriggerSource::External).unwrap();
        assert_eq!(board.last_write(channel_register(1, ChannelRegister::Control)), Some(0b1000));

        bank.set_operating_mode(&board, 1, OperatingMode::Waveform).unwrap();
        assert_eq!(board.last_write(channel_register(1, ChannelRegister::Control)), Some(0b1010));

        bank.set_underflow_clear(&board, 1, true).unwrap();
        assert_eq!(board.last_write(channel_register(1, ChannelRegister::Status)), Some(0b1000));
    }

    #[test]
    fn test_invalid_channel_writes_nothing() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let err = bank.set_range(&board, 16, OutputRange::Bipolar5V).unwrap_err();
        assert!(matches!(err, Ap235Error::InvalidArgument { .. }));
        assert!(board.write_log().is_empty());
    }

    #[test]
    fn test_clear_pulses_data_reset_only() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        bank.set_range(&board, 0, OutputRange::Bipolar3V).unwrap();
        board.clear_log();

        bank.clear(&board, 0).unwrap();
        let words: Vec<u32> = board
            .write_log()
            .iter()
            .filter(|w| w.offset == direct(0))
            .map(|w| w.value)
            .collect();
        assert_eq!(words, vec![0x0007_0000, 0x0004_0005]);
        assert_eq!(bank.config(0).unwrap().range(), OutputRange::Bipolar3V);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        bank.set_range(&board, 2, OutputRange::Unipolar20V).unwrap();
        bank.set_simultaneous_update(&board, 2, true).unwrap();
        board.clear_log();

        bank.reset(&board, 2).unwrap();
        let words: Vec<u32> = board
            .write_log()
            .iter()
            .filter(|w| w.offset == direct(2))
            .map(|w| w.value)
            .collect();
        assert_eq!(words, vec![0x000F_0000, 0x0004_0000]);
        assert_eq!(bank.config(2).unwrap(), ChannelConfig::default());
    }

    #[test]
    fn test_locked_channel_rejects_changes() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        bank.set_locked(1 << 4);
        let err = bank.set_range(&board, 4, OutputRange::Bipolar5V).unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(bank.config(4).unwrap().range(), OutputRange::Bipolar10V);
        assert!(board.write_log().is_empty());
        assert!(bank.set_range(&board, 5, OutputRange::Bipolar5V).is_ok());
    }

    #[test]
    fn test_failed_push_leaves_mirror_untouched() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        bank.set_range(&board, 6, OutputRange::Bipolar5V).unwrap();
        board.fail_on(channel_register(6, ChannelRegister::Control), ApStatus::Error);

        assert!(bank.set_range(&board, 6, OutputRange::Unipolar10V).is_err());
        assert_eq!(bank.config(6).unwrap().range(), OutputRange::Bipolar5V);
        assert!(bank.reset(&board, 6).is_err());
        assert_eq!(bank.config(6).unwrap().range(), OutputRange::Bipolar5V);

        board.clear_faults();
        bank.set_range(&board, 6, OutputRange::Unipolar10V).unwrap();
        assert_eq!(bank.config(6).unwrap().range(), OutputRange::Unipolar10V);
    }

    #[test]
    fn test_trigger_direction_read_modify_write() {
        let board = SimulatedBoard::new();
        board.poke(COMMON_CONTROL, CommonControl::WAVEFORM_ENABLE.bits());
        let mut bank = ChannelBank::default();
        bank.set_trigger_direction(&board, TriggerDirection::Output).unwrap();
        assert_eq!(
            board.last_write(COMMON_CONTROL),
            Some((CommonControl::WAVEFORM_ENABLE | CommonControl::TRIGGER_DIRECTION).bits())
        );
    }

    #[test]
    fn test_option_strings() {
        assert_eq!("mid".parse::<OutputScale>().unwrap(), OutputScale::Mid);
        assert_eq!("Timer".parse::<TriggerSource>().unwrap(), TriggerSource::Timer);
        assert_eq!(OperatingMode::Waveform.to_string(), "waveform");
        assert!("burst".parse::<OperatingMode>().is_err());
    }
}
