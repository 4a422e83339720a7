//! FIFO/DMA waveform streaming.
//!
//! [`WaveformEngine`] owns the sample arena, the per-channel cursors and
//! the descriptor chain, and drives the board through
//!
//! ```text
//! Reset --configure--> Configured --arm--> Armed --start--> Streaming
//!   ^                                        |                 |
//!   |                                        +------halt-------+--> Halted
//!   +-------------------reset (from any state)---------------------+
//! ```
//!
//! A timeout, CDMA error or register fault after the engine has started
//! programming the DMA block tears the hardware down and lands in `Reset`.
//! `Halted` only leaves through [`WaveformEngine::reset`]; arming over a
//! halted chain is refused.
//!
//! The engine never owns the register backend or the channel mirrors: every
//! operation borrows them from the device handle, which serialises access.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::buffer::{Block, OutputBuffer, Pinning, SampleMemory};
use crate::calibration::encode_straight_binary;
use crate::channel::{validate_channel, ChannelBank, OperatingMode, TriggerSource};
use crate::descriptor::{ChainPass, DescriptorChain};
use crate::error::{Ap235Error, ApStatus, Result};
use crate::io::{PollPolicy, RegisterIo};
use crate::registers::{
    channel_register, CdmaControl, CdmaStatus, ChannelRegister, CommonControl, ALL_INTERRUPTS, AXIBAR2PCIEBAR_0L,
    AXIBAR2PCIEBAR_0U, CDMA_CONTROL, CDMA_CURRENT_DESCRIPTOR, CDMA_CURRENT_DESCRIPTOR_HI, CDMA_STATUS,
    CDMA_TAIL_DESCRIPTOR, CDMA_TAIL_DESCRIPTOR_HI, CHANNEL_COUNT, COMMON_CONTROL, DMA_INTERRUPT,
    INTERRUPT_ACKNOWLEDGE, INTERRUPT_CLEAR_ENABLE, INTERRUPT_ENABLE, INTERRUPT_PENDING, MASTER_ENABLE,
    MASTER_IRQ_DISABLE, MASTER_IRQ_ENABLE, MAX_SAMPLES,
};

/// Waveform engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaveformState {
    /// Nothing programmed.
    #[default]
    Reset,
    /// Channels set up for FIFO output; DMA untouched.
    Configured,
    /// Descriptors written and CDMA configured; no transfer started.
    Armed,
    /// Output running with interrupt-driven refill.
    Streaming,
    /// Output stopped; a reset is required before arming again.
    Halted,
}

impl WaveformState {
    /// Whether the DMA engine may be holding descriptors.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Armed | Self::Streaming)
    }
}

impl fmt::Display for WaveformState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reset => "reset",
            Self::Configured => "configured",
            Self::Armed => "armed",
            Self::Streaming => "streaming",
            Self::Halted => "halted",
        };
        f.write_str(name)
    }
}

/// Polling ceilings and arena policy for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Wait for the CDMA reset bit to clear while arming.
    #[serde(default)]
    pub reset_poll: PollPolicy,
    /// Wait for the CDMA to go idle after the initial burst.
    #[serde(default)]
    pub idle_poll: PollPolicy,
    /// Wait for the CDMA completion interrupt during a refill.
    #[serde(default)]
    pub dma_poll: PollPolicy,
    /// What to do if the sample arena cannot be locked into memory.
    #[serde(default)]
    pub pinning: Pinning,
}

/// The waveform state machine.
#[derive(Debug)]
pub struct WaveformEngine {
    settings: EngineSettings,
    state: WaveformState,
    memory: Option<SampleMemory>,
    buffers: [OutputBuffer; CHANNEL_COUNT],
    active: u32,
    chain: Option<DescriptorChain>,
    primed: Option<ChainPass>,
}

fn check_transfer(status: u32, operation: &str) -> Result<()> {
    let errors = CdmaStatus::from_bits_truncate(status) & CdmaStatus::ERRORS;
    if !errors.is_empty() {
        return Err(Ap235Error::HardwareFault {
            status: ApStatus::Error,
            operation: format!("{} (CDMA status {:#06x})", operation, errors.bits()),
        });
    }
    Ok(())
}

fn pulse_common(io: &dyn RegisterIo, flag: CommonControl) -> Result<()> {
    let current = CommonControl::from_bits_retain(io.read_register(COMMON_CONTROL)?);
    io.write_register(COMMON_CONTROL, (current | flag).bits())?;
    io.write_register(COMMON_CONTROL, current.difference(flag).bits())
}

fn set_output_enable(io: &dyn RegisterIo, enable: bool) -> Result<()> {
    let mut common = CommonControl::from_bits_retain(io.read_register(COMMON_CONTROL)?);
    common.set(CommonControl::WAVEFORM_ENABLE, enable);
    io.write_register(COMMON_CONTROL, common.bits())
}

/// Stop output and silence every interrupt source. All four writes are
/// attempted; the first failure is returned.
fn halt_writes(io: &dyn RegisterIo) -> Result<()> {
    let results = [
        set_output_enable(io, false),
        io.write_register(INTERRUPT_CLEAR_ENABLE, ALL_INTERRUPTS),
        io.write_register(MASTER_ENABLE, MASTER_IRQ_DISABLE),
        io.write_register(INTERRUPT_ACKNOWLEDGE, ALL_INTERRUPTS),
    ];
    results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
}

fn mask_channels(mask: u32) -> impl Iterator<Item = usize> {
    (0..CHANNEL_COUNT).filter(move |ch| mask & (1 << ch) != 0)
}

impl WaveformEngine {
    /// Idle engine. The sample arena is allocated on first use.
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            state: WaveformState::Reset,
            memory: None,
            buffers: [OutputBuffer::default(); CHANNEL_COUNT],
            active: 0,
            chain: None,
            primed: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> WaveformState {
        self.state
    }

    /// Settings the engine was built with.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Channels selected by the last configure, one bit per channel.
    pub fn active_mask(&self) -> u32 {
        self.active
    }

    /// Cursor of one channel.
    pub fn buffer(&self, channel: usize) -> Result<OutputBuffer> {
        validate_channel(channel)?;
        Ok(self.buffers[channel])
    }

    /// One stored sample, as a two's-complement DN.
    pub fn sample(&self, channel: usize, index: usize) -> Result<i16> {
        match &self.memory {
            Some(memory) => memory.sample(channel, index),
            None => Err(Ap235Error::invalid_state("no samples have been stored")),
        }
    }

    /// Descriptor chain while armed or streaming.
    pub fn chain(&self) -> Option<&DescriptorChain> {
        self.chain.as_ref()
    }

    fn memory_mut(&mut self) -> Result<&mut SampleMemory> {
        if self.memory.is_none() {
            self.memory = Some(SampleMemory::allocate(self.settings.pinning)?);
        }
        self.memory
            .as_mut()
            .ok_or_else(|| Ap235Error::invalid_state("DMA arena not allocated"))
    }

    fn check_not_live(&self, operation: &str) -> Result<()> {
        if self.state.is_live() {
            return Err(Ap235Error::invalid_state(format!(
                "cannot {} while the waveform engine is {}",
                operation, self.state
            )));
        }
        Ok(())
    }

    /// Store up to [`MAX_SAMPLES`] DNs for a channel and point its FIFO start
    /// address at the channel's sample memory.
    pub fn populate(&mut self, io: &dyn RegisterIo, channel: usize, samples: &[i16]) -> Result<()> {
        validate_channel(channel)?;
        if samples.is_empty() {
            return Err(Ap235Error::invalid_argument("waveform must contain at least one sample"));
        }
        if samples.len() > MAX_SAMPLES {
            return Err(Ap235Error::invalid_argument(format!(
                "{} samples exceed the {} sample channel memory",
                samples.len(),
                MAX_SAMPLES
            )));
        }
        self.check_not_live("populate a waveform")?;

        self.memory_mut()?.store(channel, samples)?;
        self.buffers[channel].load(samples.len())?;

        let start = (channel * MAX_SAMPLES) as u32;
        io.write_register(channel_register(channel, ChannelRegister::StartAddress), start)?;
        if self.state == WaveformState::Configured && self.active & (1 << channel) != 0 {
            io.write_register(
                channel_register(channel, ChannelRegister::EndAddress),
                start + samples.len() as u32 - 1,
            )?;
        }
        debug!(channel, samples = samples.len(), "Populated waveform");
        Ok(())
    }

    /// Write one DN through the channel's direct-access register.
    pub fn output_single(&mut self, io: &dyn RegisterIo, bank: &ChannelBank, channel: usize, dn: i16) -> Result<()> {
        let cfg = bank.config(channel)?;
        if cfg.operating_mode() == OperatingMode::Waveform {
            return Err(Ap235Error::invalid_state(format!(
                "channel {} is in waveform mode; reset the waveform before direct output",
                channel
            )));
        }
        if self.state.is_live() && self.active & (1 << channel) != 0 {
            return Err(Ap235Error::invalid_state(format!("channel {} is streaming", channel)));
        }

        self.memory_mut()?.store(channel, &[dn])?;
        self.buffers[channel].set_single();

        let word = cfg.write_command().word(u32::from(encode_straight_binary(dn)));
        io.write_register(channel_register(channel, ChannelRegister::DirectAccess), word)?;
        trace!(channel, dn, word = format_args!("{:#010x}", word), "Direct output");
        Ok(())
    }

    /// Bring channels up for FIFO output (reset, configure, clear, FIFO
    /// bounds, mode and trigger).
    pub fn configure(
        &mut self,
        io: &dyn RegisterIo,
        bank: &mut ChannelBank,
        channels: &[usize],
        trigger: TriggerSource,
    ) -> Result<()> {
        match self.state {
            WaveformState::Reset | WaveformState::Configured => {}
            other => {
                return Err(Ap235Error::invalid_state(format!(
                    "cannot configure while the waveform engine is {}",
                    other
                )))
            }
        }
        if channels.is_empty() {
            return Err(Ap235Error::invalid_argument("no channels selected for waveform output"));
        }
        if trigger == TriggerSource::Software {
            return Err(Ap235Error::invalid_argument(
                "waveform output needs a timer or external trigger",
            ));
        }
        let mut mask = 0u32;
        for &channel in channels {
            validate_channel(channel)?;
            if mask & (1 << channel) != 0 {
                return Err(Ap235Error::invalid_argument(format!("channel {} listed twice", channel)));
            }
            if self.buffers[channel].sample_count() == 0 {
                return Err(Ap235Error::invalid_argument(format!(
                    "channel {} has no waveform; populate it first",
                    channel
                )));
            }
            mask |= 1 << channel;
        }

        let previous = self.active;
        bank.set_locked(0);
        self.state = WaveformState::Reset;
        if let Err(err) = self.program_channels(io, bank, previous & !mask, mask, trigger) {
            // Any of these may already be in waveform mode; reset must see them.
            self.active = previous | mask;
            warn!(
                error = %err,
                channels = format_args!("{:#06x}", self.active),
                "Waveform configure failed; reset the waveform to release the channels"
            );
            return Err(err);
        }

        self.active = mask;
        bank.set_locked(mask);
        self.state = WaveformState::Configured;
        info!(channels = format_args!("{:#06x}", mask), trigger = %trigger, "Waveform configured");
        Ok(())
    }

    fn program_channels(
        &self,
        io: &dyn RegisterIo,
        bank: &mut ChannelBank,
        dropped: u32,
        mask: u32,
        trigger: TriggerSource,
    ) -> Result<()> {
        for channel in mask_channels(dropped) {
            bank.set_operating_mode(io, channel, OperatingMode::Single)?;
        }

        pulse_common(io, CommonControl::SOFTWARE_RESET)?;
        pulse_common(io, CommonControl::DAC_RESET)?;
        for channel in mask_channels(mask) {
            bank.push_channel(io, channel)?;
        }
        pulse_common(io, CommonControl::DAC_CLEAR)?;

        for channel in mask_channels(mask) {
            let start = (channel * MAX_SAMPLES) as u32;
            let len = self.buffers[channel].sample_count() as u32;
            io.write_register(channel_register(channel, ChannelRegister::StartAddress), start)?;
            io.write_register(channel_register(channel, ChannelRegister::EndAddress), start + len - 1)?;
            debug!(channel, start, end = start + len - 1, "FIFO bounds set");
        }
        for channel in mask_channels(mask) {
            bank.set_stream_mode(io, channel, OperatingMode::Waveform, trigger)?;
        }
        Ok(())
    }

    fn next_blocks(&self, mask: u32) -> [Option<Block>; CHANNEL_COUNT] {
        let mut blocks = [None; CHANNEL_COUNT];
        for channel in mask_channels(mask) {
            blocks[channel] = self.buffers[channel].next_half();
        }
        blocks
    }

    /// Write the descriptor chain, reset the CDMA and put it in
    /// scatter-gather key-hole mode.
    pub fn arm(&mut self, io: &dyn RegisterIo, bank: &mut ChannelBank) -> Result<()> {
        match self.state {
            WaveformState::Configured => {}
            WaveformState::Halted => {
                return Err(Ap235Error::invalid_state(
                    "waveform was halted; reset it before arming again",
                ))
            }
            WaveformState::Reset => {
                return Err(Ap235Error::invalid_state("configure the waveform before arming"));
            }
            other => {
                return Err(Ap235Error::invalid_state(format!(
                    "cannot arm while the waveform engine is {}",
                    other
                )))
            }
        }
        for channel in mask_channels(self.active) {
            let len = self.buffers[channel].sample_count();
            if len % 2 != 0 {
                return Err(Ap235Error::invalid_argument(format!(
                    "channel {} waveform has {} samples; key-hole DMA needs an even count",
                    channel, len
                )));
            }
        }
        let host = match &self.memory {
            Some(memory) => memory.host_address(),
            None => return Err(Ap235Error::invalid_state("no samples have been stored")),
        };

        let chain = DescriptorChain::new(self.active);
        let pass = chain.plan_pass(self.active, &self.next_blocks(self.active))?;

        if let Err(err) = self.arm_hardware(io, &pass, host) {
            return Err(self.abort(io, bank, err));
        }

        self.chain = Some(chain);
        self.primed = Some(pass);
        self.state = WaveformState::Armed;
        info!(channels = format_args!("{:#06x}", self.active), "Waveform armed");
        Ok(())
    }

    fn arm_hardware(&self, io: &dyn RegisterIo, pass: &ChainPass, host: u64) -> Result<()> {
        io.write_register(AXIBAR2PCIEBAR_0U, (host >> 32) as u32)?;
        io.write_register(AXIBAR2PCIEBAR_0L, host as u32)?;
        pass.write_to(io)?;

        io.write_register(CDMA_CONTROL, CdmaControl::RESET.bits())?;
        io.poll_until(
            CDMA_CONTROL,
            &|v| v & CdmaControl::RESET.bits() == 0,
            &self.settings.reset_poll,
            "CDMA reset",
        )?;
        let control = CdmaControl::TAIL_POINTER | CdmaControl::SCATTER_GATHER | CdmaControl::KEY_HOLE_WRITE;
        io.write_register(CDMA_CONTROL, control.bits())?;
        debug!(control = format_args!("{:#x}", control.bits()), "CDMA configured");
        Ok(())
    }

    /// Run the initial burst that half-fills every FIFO, then enable
    /// interrupts and waveform output.
    pub fn start(&mut self, io: &dyn RegisterIo, bank: &mut ChannelBank) -> Result<()> {
        if self.state != WaveformState::Armed {
            return Err(Ap235Error::invalid_state(format!(
                "cannot start while the waveform engine is {}",
                self.state
            )));
        }
        let pass = self
            .primed
            .take()
            .ok_or_else(|| Ap235Error::invalid_state("armed without a primed descriptor pass"))?;

        if let Err(err) = self.start_hardware(io, &pass) {
            return Err(self.abort(io, bank, err));
        }
        if let Err(err) = self.commit(&pass) {
            return Err(self.abort(io, bank, err));
        }

        self.state = WaveformState::Streaming;
        info!(descriptors = pass.len(), "Waveform streaming");
        Ok(())
    }

    fn start_hardware(&self, io: &dyn RegisterIo, pass: &ChainPass) -> Result<()> {
        let (first, tail) = match (pass.first_address(), pass.tail_address()) {
            (Some(first), Some(tail)) => (first, tail),
            _ => return Err(Ap235Error::invalid_state("empty initial descriptor pass")),
        };
        io.write_register(CDMA_CURRENT_DESCRIPTOR_HI, 0)?;
        io.write_register(CDMA_CURRENT_DESCRIPTOR, first)?;
        io.write_register(CDMA_TAIL_DESCRIPTOR_HI, 0)?;
        io.write_register(CDMA_TAIL_DESCRIPTOR, tail)?;

        let status = io.poll_until(
            CDMA_STATUS,
            &|v| v & CdmaStatus::IDLE.bits() != 0,
            &self.settings.idle_poll,
            "CDMA idle after initial transfer",
        )?;
        check_transfer(status, "initial transfer")?;

        io.write_register(INTERRUPT_ENABLE, self.active)?;
        io.write_register(MASTER_ENABLE, MASTER_IRQ_ENABLE)?;
        set_output_enable(io, true)
    }

    fn commit(&mut self, pass: &ChainPass) -> Result<()> {
        let chain = self
            .chain
            .as_mut()
            .ok_or_else(|| Ap235Error::invalid_state("no descriptor chain"))?;
        chain.commit(pass);
        chain.check()?;
        for entry in pass.entries() {
            self.buffers[entry.channel].advance(entry.block.len)?;
        }
        Ok(())
    }

    /// Refill every channel whose half-full interrupt is pending. Returns
    /// the serviced channels, one bit per channel; zero if nothing was
    /// pending.
    pub fn service_interrupt(&mut self, io: &dyn RegisterIo, bank: &mut ChannelBank) -> Result<u32> {
        if self.state != WaveformState::Streaming {
            return Err(Ap235Error::invalid_state(format!(
                "cannot service interrupts while the waveform engine is {}",
                self.state
            )));
        }
        let pending = match io.read_register(INTERRUPT_PENDING) {
            Ok(raw) => raw & self.active,
            Err(err) => return Err(self.abort(io, bank, err)),
        };
        if pending == 0 {
            return Ok(0);
        }

        let planned = match &self.chain {
            Some(chain) => chain.plan_pass(pending, &self.next_blocks(pending)),
            None => Err(Ap235Error::invalid_state("no descriptor chain")),
        };
        let pass = match planned {
            Ok(pass) => pass,
            Err(err) => return Err(self.abort(io, bank, err)),
        };
        if let Err(err) = self.refill_hardware(io, &pass, pending) {
            return Err(self.abort(io, bank, err));
        }
        if let Err(err) = self.commit(&pass) {
            return Err(self.abort(io, bank, err));
        }

        trace!(
            pending = format_args!("{:#06x}", pending),
            descriptors = pass.len(),
            "Refilled FIFOs"
        );
        Ok(pending)
    }

    fn refill_hardware(&self, io: &dyn RegisterIo, pass: &ChainPass, pending: u32) -> Result<()> {
        let (first, tail) = match (pass.first_address(), pass.tail_address()) {
            (Some(first), Some(tail)) => (first, tail),
            _ => return Ok(()),
        };
        pass.write_to(io)?;

        io.write_register(CDMA_CURRENT_DESCRIPTOR, first)?;
        let control = CdmaControl::SCATTER_GATHER
            | CdmaControl::KEY_HOLE_WRITE
            | CdmaControl::IOC_IRQ
            | CdmaControl::ERROR_IRQ;
        io.write_register(CDMA_CONTROL, control.with_threshold(pass.len()))?;
        io.write_register(INTERRUPT_ENABLE, DMA_INTERRUPT)?;
        io.write_register(CDMA_TAIL_DESCRIPTOR, tail)?;

        io.poll_until(
            INTERRUPT_PENDING,
            &|v| v & DMA_INTERRUPT != 0,
            &self.settings.dma_poll,
            "CDMA refill completion",
        )?;
        check_transfer(io.read_register(CDMA_STATUS)?, "refill transfer")?;

        io.write_register(INTERRUPT_ACKNOWLEDGE, pending | DMA_INTERRUPT)?;
        io.write_register(INTERRUPT_ENABLE, self.active)
    }

    /// Stop output. Safe to call in any state; only an armed or streaming
    /// engine touches the hardware.
    pub fn halt(&mut self, io: &dyn RegisterIo, bank: &mut ChannelBank) -> Result<()> {
        if !self.state.is_live() {
            return Ok(());
        }
        let result = halt_writes(io);
        bank.set_locked(0);
        self.chain = None;
        self.primed = None;
        self.state = WaveformState::Halted;
        info!("Waveform halted");
        result
    }

    /// Tear down any DMA state, return waveform channels to direct access
    /// and go back to `Reset`. Stored samples are kept.
    pub fn reset(&mut self, io: &dyn RegisterIo, bank: &mut ChannelBank) -> Result<()> {
        if self.state != WaveformState::Reset || self.active != 0 {
            self.teardown(io);
        }
        bank.set_locked(0);
        let active = self.active;
        self.active = 0;
        self.chain = None;
        self.primed = None;
        self.state = WaveformState::Reset;
        for buffer in &mut self.buffers {
            buffer.rewind();
        }
        for channel in mask_channels(active) {
            bank.set_operating_mode(io, channel, OperatingMode::Single)?;
        }
        info!("Waveform reset");
        Ok(())
    }

    /// Best-effort hardware teardown: output and interrupts off, CDMA reset.
    fn teardown(&self, io: &dyn RegisterIo) {
        if let Err(err) = halt_writes(io) {
            warn!(error = %err, "Failed to silence waveform output during teardown");
        }
        if let Err(err) = io.write_register(CDMA_CONTROL, CdmaControl::RESET.bits()) {
            warn!(error = %err, "Failed to reset CDMA during teardown");
        }
    }

    fn abort(&mut self, io: &dyn RegisterIo, bank: &mut ChannelBank, err: Ap235Error) -> Ap235Error {
        warn!(error = %err, state = %self.state, "Waveform engine failed; tearing down");
        self.teardown(io);
        bank.set_locked(0);
        self.chain = None;
        self.primed = None;
        self.state = WaveformState::Reset;
        for buffer in &mut self.buffers {
            buffer.rewind();
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::calibration::OutputRange;
    use crate::registers::AXIBAR_0;
    use crate::sim::SimulatedBoard;

    fn settings() -> EngineSettings {
        let fast = PollPolicy::new(10, Duration::ZERO);
        EngineSettings {
            reset_poll: fast,
            idle_poll: fast,
            dma_poll: fast,
            pinning: Pinning::BestEffort,
        }
    }

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|i| i as i16 * 100).collect()
    }

    fn configured(board: &SimulatedBoard, bank: &mut ChannelBank, channels: &[usize], len: usize) -> WaveformEngine {
        let mut engine = WaveformEngine::new(settings());
        for &ch in channels {
            engine.populate(board, ch, &ramp(len)).unwrap();
        }
        engine.configure(board, bank, channels, TriggerSource::Timer).unwrap();
        engine
    }

    fn streaming(board: &SimulatedBoard, bank: &mut ChannelBank, channels: &[usize]) -> WaveformEngine {
        let mut engine = configured(board, bank, channels, 8);
        engine.arm(board, bank).unwrap();
        engine.start(board, bank).unwrap();
        engine
    }

    #[test]
    fn test_configure_programs_fifo_and_mode() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let engine = configured(&board, &mut bank, &[0, 1], 8);

        assert_eq!(engine.state(), WaveformState::Configured);
        assert_eq!(board.peek(channel_register(1, ChannelRegister::StartAddress)), 4096);
        assert_eq!(board.peek(channel_register(1, ChannelRegister::EndAddress)), 4103);
        assert_eq!(board.peek(channel_register(0, ChannelRegister::Control)), 0b110);
        assert_eq!(bank.config(1).unwrap().operating_mode(), OperatingMode::Waveform);
        assert_eq!(bank.config(1).unwrap().trigger_source(), TriggerSource::Timer);
        assert_eq!(board.peek(COMMON_CONTROL), 0);
    }

    #[test]
    fn test_configure_rejects_bad_requests() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = WaveformEngine::new(settings());
        engine.populate(&board, 0, &ramp(4)).unwrap();
        board.clear_log();

        let err = engine
            .configure(&board, &mut bank, &[0], TriggerSource::Software)
            .unwrap_err();
        assert!(matches!(err, Ap235Error::InvalidArgument { .. }));
        let err = engine.configure(&board, &mut bank, &[0, 2], TriggerSource::Timer).unwrap_err();
        assert!(matches!(err, Ap235Error::InvalidArgument { .. }));
        let err = engine.configure(&board, &mut bank, &[0, 0], TriggerSource::Timer).unwrap_err();
        assert!(matches!(err, Ap235Error::InvalidArgument { .. }));
        assert!(board.write_log().is_empty());
        assert_eq!(engine.state(), WaveformState::Reset);
    }

    #[test]
    fn test_failed_configure_still_releases_channels_on_reset() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = configured(&board, &mut bank, &[0], 8);
        board.fail_on(channel_register(0, ChannelRegister::EndAddress), ApStatus::Error);

        assert!(engine
            .configure(&board, &mut bank, &[0], TriggerSource::Timer)
            .is_err());
        assert_eq!(engine.state(), WaveformState::Reset);
        assert_eq!(engine.active_mask(), 0b1);
        assert_eq!(bank.locked_mask(), 0);

        board.clear_faults();
        engine.reset(&board, &mut bank).unwrap();
        assert_eq!(bank.config(0).unwrap().operating_mode(), OperatingMode::Single);
        engine.output_single(&board, &bank, 0, 100).unwrap();
    }

    #[test]
    fn test_configured_channels_are_locked() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = configured(&board, &mut bank, &[0, 2], 8);
        assert_eq!(bank.locked_mask(), 0b101);

        assert!(bank.reset(&board, 0).unwrap_err().is_invalid_state());
        assert!(bank.clear(&board, 2).unwrap_err().is_invalid_state());
        assert_eq!(bank.config(0).unwrap().operating_mode(), OperatingMode::Waveform);
        bank.reset(&board, 1).unwrap();

        // A rejected request leaves the previous selection in force.
        assert!(engine
            .configure(&board, &mut bank, &[0, 3], TriggerSource::Timer)
            .is_err());
        assert_eq!(bank.locked_mask(), 0b101);

        engine.populate(&board, 3, &ramp(8)).unwrap();
        engine.configure(&board, &mut bank, &[3], TriggerSource::Timer).unwrap();
        assert_eq!(bank.locked_mask(), 0b1000);
        assert_eq!(bank.config(0).unwrap().operating_mode(), OperatingMode::Single);

        engine.reset(&board, &mut bank).unwrap();
        assert_eq!(bank.locked_mask(), 0);
        bank.reset(&board, 3).unwrap();
    }

    #[test]
    fn test_populate_bounds() {
        let board = SimulatedBoard::new();
        let mut engine = WaveformEngine::new(settings());
        let err = engine.populate(&board, 0, &vec![0; MAX_SAMPLES + 1]).unwrap_err();
        assert!(matches!(err, Ap235Error::InvalidArgument { .. }));
        assert!(board.write_log().is_empty());

        engine.populate(&board, 3, &[5, -5]).unwrap();
        assert_eq!(board.last_write(channel_register(3, ChannelRegister::StartAddress)), Some(3 * 4096));
        assert_eq!(engine.sample(3, 1).unwrap(), -5);
        assert_eq!(engine.buffer(3).unwrap().sample_count(), 2);
    }

    #[test]
    fn test_arm_rejects_odd_length_before_any_write() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = configured(&board, &mut bank, &[2], 7);
        board.clear_log();

        let err = engine.arm(&board, &mut bank).unwrap_err();
        assert!(matches!(err, Ap235Error::InvalidArgument { .. }));
        assert!(board.write_log().is_empty());
        assert_eq!(engine.state(), WaveformState::Configured);
    }

    #[test]
    fn test_arm_programs_cdma() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = configured(&board, &mut bank, &[0, 3], 8);
        engine.arm(&board, &mut bank).unwrap();

        assert_eq!(engine.state(), WaveformState::Armed);
        assert_eq!(board.last_write(CDMA_CONTROL), Some(0x2A));
        assert_eq!(board.peek(AXIBAR2PCIEBAR_0L), engine.memory.as_ref().unwrap().host_address() as u32);
        assert_eq!(bank.locked_mask(), 0b1001);
        assert!(board.transfers().is_empty());
    }

    #[test]
    fn test_start_runs_initial_burst() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let engine = streaming(&board, &mut bank, &[0, 1]);

        assert_eq!(engine.state(), WaveformState::Streaming);
        let transfers = board.transfers();
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].channel, Some(0));
        assert_eq!(transfers[1].channel, Some(1));
        assert_eq!(transfers[1].source, AXIBAR_0 + 8192);
        assert!(transfers.iter().all(|t| t.bytes == 8));

        assert_eq!(board.peek(INTERRUPT_ENABLE), 0b11);
        assert_eq!(board.peek(MASTER_ENABLE), MASTER_IRQ_ENABLE);
        assert_ne!(board.peek(COMMON_CONTROL) & CommonControl::WAVEFORM_ENABLE.bits(), 0);
        let chain = engine.chain().unwrap();
        assert_eq!(chain.hardware_half(0), Some(crate::descriptor::Half::Ping));
        assert_eq!(engine.buffer(0).unwrap().current(), 4);
    }

    #[test]
    fn test_uneven_halves_move_whole_words() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = configured(&board, &mut bank, &[0], 6);
        engine.arm(&board, &mut bank).unwrap();
        engine.start(&board, &mut bank).unwrap();

        board.raise_interrupt(0b1);
        engine.service_interrupt(&board, &mut bank).unwrap();
        board.raise_interrupt(0b1);
        engine.service_interrupt(&board, &mut bank).unwrap();

        let transfers = board.transfers();
        let moved: Vec<(u32, u32)> = transfers.iter().map(|t| (t.source - AXIBAR_0, t.bytes)).collect();
        assert_eq!(moved, vec![(0, 4), (4, 8), (0, 4)]);
        assert!(transfers.iter().all(|t| t.bytes % 4 == 0));
    }

    #[test]
    fn test_refill_services_only_pending_channels() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = streaming(&board, &mut bank, &[0, 1]);
        board.clear_transfers();

        board.raise_interrupt(0b01);
        assert_eq!(engine.service_interrupt(&board, &mut bank).unwrap(), 0b01);

        let transfers = board.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].channel, Some(0));
        assert_eq!(transfers[0].source, AXIBAR_0 + 8);
        let control =
            CdmaControl::SCATTER_GATHER | CdmaControl::KEY_HOLE_WRITE | CdmaControl::IOC_IRQ | CdmaControl::ERROR_IRQ;
        assert_eq!(board.last_write(CDMA_CONTROL), Some(control.with_threshold(1)));
        assert_eq!(board.peek(INTERRUPT_ENABLE), 0b11);
        assert_eq!(board.read_register(INTERRUPT_PENDING).unwrap(), 0);

        let chain = engine.chain().unwrap();
        assert_eq!(chain.hardware_half(0), Some(crate::descriptor::Half::Pong));
        assert_eq!(chain.hardware_half(1), Some(crate::descriptor::Half::Ping));

        board.clear_transfers();
        board.raise_interrupt(0b01);
        engine.service_interrupt(&board, &mut bank).unwrap();
        assert_eq!(board.transfers()[0].source, AXIBAR_0);
    }

    #[test]
    fn test_nothing_pending_is_a_no_op() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = streaming(&board, &mut bank, &[4]);
        board.clear_log();
        assert_eq!(engine.service_interrupt(&board, &mut bank).unwrap(), 0);
        assert!(board.write_log().is_empty());
    }

    #[test]
    fn test_reset_timeout_tears_down() {
        let board = SimulatedBoard::new();
        board.set_reset_stuck(true);
        let mut bank = ChannelBank::default();
        let mut engine = configured(&board, &mut bank, &[0], 4);

        let err = engine.arm(&board, &mut bank).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(engine.state(), WaveformState::Reset);
        assert_eq!(bank.locked_mask(), 0);
        assert_eq!(board.peek(MASTER_ENABLE), MASTER_IRQ_DISABLE);
    }

    #[test]
    fn test_stalled_initial_burst_times_out() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = configured(&board, &mut bank, &[0], 4);
        engine.arm(&board, &mut bank).unwrap();
        board.set_dma_stalled(true);

        assert!(engine.start(&board, &mut bank).unwrap_err().is_timeout());
        assert_eq!(engine.state(), WaveformState::Reset);
        assert!(engine.chain().is_none());
    }

    #[test]
    fn test_dma_error_during_refill() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = streaming(&board, &mut bank, &[0]);
        board.inject_dma_error(CdmaStatus::SLAVE_ERROR);
        board.raise_interrupt(0b1);

        let err = engine.service_interrupt(&board, &mut bank).unwrap_err();
        assert!(matches!(
            err,
            Ap235Error::HardwareFault {
                status: ApStatus::Error,
                ..
            }
        ));
        assert_eq!(engine.state(), WaveformState::Reset);
        assert_eq!(board.peek(COMMON_CONTROL) & CommonControl::WAVEFORM_ENABLE.bits(), 0);
    }

    #[test]
    fn test_streaming_channels_are_locked() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = streaming(&board, &mut bank, &[0]);

        assert!(bank.set_range(&board, 0, OutputRange::Bipolar5V).unwrap_err().is_invalid_state());
        assert!(engine.populate(&board, 0, &ramp(4)).unwrap_err().is_invalid_state());
        assert!(engine.output_single(&board, &bank, 0, 1).unwrap_err().is_invalid_state());
        assert!(engine.output_single(&board, &bank, 5, 1).is_ok());
    }

    #[test]
    fn test_halt_is_idempotent_and_blocks_rearm() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = streaming(&board, &mut bank, &[0, 1]);

        engine.halt(&board, &mut bank).unwrap();
        assert_eq!(engine.state(), WaveformState::Halted);
        assert_eq!(board.peek(COMMON_CONTROL) & CommonControl::WAVEFORM_ENABLE.bits(), 0);
        assert_eq!(board.peek(MASTER_ENABLE), MASTER_IRQ_DISABLE);
        assert_eq!(bank.locked_mask(), 0);

        board.clear_log();
        engine.halt(&board, &mut bank).unwrap();
        assert!(board.write_log().is_empty());

        assert!(engine.arm(&board, &mut bank).unwrap_err().is_invalid_state());
        assert!(engine
            .configure(&board, &mut bank, &[0], TriggerSource::Timer)
            .unwrap_err()
            .is_invalid_state());

        engine.reset(&board, &mut bank).unwrap();
        assert_eq!(engine.state(), WaveformState::Reset);
        assert_eq!(bank.config(1).unwrap().operating_mode(), OperatingMode::Single);

        engine.configure(&board, &mut bank, &[0, 1], TriggerSource::External).unwrap();
        engine.arm(&board, &mut bank).unwrap();
        engine.start(&board, &mut bank).unwrap();
        assert_eq!(engine.state(), WaveformState::Streaming);
    }

    #[test]
    fn test_direct_output_word() {
        let board = SimulatedBoard::new();
        let mut bank = ChannelBank::default();
        let mut engine = WaveformEngine::new(settings());

        engine.output_single(&board, &bank, 2, 0).unwrap();
        assert_eq!(
            board.last_write(channel_register(2, ChannelRegister::DirectAccess)),
            Some(0x0003_8000)
        );
        bank.set_simultaneous_update(&board, 2, true).unwrap();
        engine.output_single(&board, &bank, 2, -1).unwrap();
        assert_eq!(
            board.last_write(channel_register(2, ChannelRegister::DirectAccess)),
            Some(0x0001_7FFF)
        );
        assert_eq!(engine.buffer(2).unwrap().sample_count(), 1);
        assert_eq!(engine.sample(2, 0).unwrap(), -1);

        bank.set_operating_mode(&board, 2, OperatingMode::Waveform).unwrap();
        assert!(engine.output_single(&board, &bank, 2, 0).unwrap_err().is_invalid_state());
    }
}
