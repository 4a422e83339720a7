//! Board handle.
//!
//! [`Ap235`] is the connection to one board. It owns the register backend,
//! the channel configuration mirrors, the correction table and the waveform
//! engine, all behind one lock so that the optional refill thread and the
//! caller never interleave register sequences.
//!
//! At most one handle per board index exists in the process; opening an
//! index that is already open fails with `InvalidState`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffer::OutputBuffer;
use crate::calibration::{voltage_to_dn_corrected, Correction, CorrectionTable, OutputRange};
use crate::channel::{validate_channel, ChannelBank, ChannelConfig, OutputScale, TriggerSource};
use crate::config::{Ap235Config, Backend, RefillConfig};
use crate::error::{Ap235Error, Result};
use crate::io::{MappedRegisters, RegisterIo};
use crate::registers::MAX_BOARDS;
use crate::sim::SimulatedBoard;
use crate::status::{read_board_status, read_channel_status, BoardStatus, ChannelStatus};
use crate::sync;
use crate::timing::{check_divider, divider_for_period, period_for_divider, TriggerDirection};
use crate::waveform::{EngineSettings, WaveformEngine, WaveformState};

static OPEN_BOARDS: Mutex<[bool; MAX_BOARDS]> = parking_lot::const_mutex([false; MAX_BOARDS]);

fn claim_board(board: usize) -> Result<()> {
    if board >= MAX_BOARDS {
        return Err(Ap235Error::invalid_argument(format!(
            "board index {} out of range (0-{})",
            board,
            MAX_BOARDS - 1
        )));
    }
    let mut open = OPEN_BOARDS.lock();
    if open[board] {
        return Err(Ap235Error::invalid_state(format!("board {} is already open", board)));
    }
    open[board] = true;
    Ok(())
}

fn release_board(board: usize) {
    if let Some(slot) = OPEN_BOARDS.lock().get_mut(board) {
        *slot = false;
    }
}

struct DeviceState {
    bank: ChannelBank,
    engine: WaveformEngine,
    corrections: CorrectionTable,
    closed: bool,
}

struct DeviceInner {
    board: usize,
    io: Arc<dyn RegisterIo>,
    state: Mutex<DeviceState>,
    refill_running: AtomicBool,
    refill_error: Mutex<Option<Ap235Error>>,
}

impl DeviceInner {
    fn with_state<T>(&self, f: impl FnOnce(&mut DeviceState, &dyn RegisterIo) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Ap235Error::invalid_state(format!("board {} is closed", self.board)));
        }
        f(&mut *state, self.io.as_ref())
    }

    fn take_refill_error(&self) -> Result<()> {
        match self.refill_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn refill_loop(inner: &DeviceInner, wait: Duration) {
    debug!(board = inner.board, "Refill thread started");
    while inner.refill_running.load(Ordering::SeqCst) {
        match inner.io.wait_for_interrupt(wait) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                error!(board = inner.board, error = %e, "Refill thread failed waiting for interrupt");
                *inner.refill_error.lock() = Some(e);
                break;
            }
        }

        let mut state = inner.state.lock();
        if state.closed || state.engine.state() != WaveformState::Streaming {
            break;
        }
        let DeviceState { bank, engine, .. } = &mut *state;
        if let Err(e) = engine.service_interrupt(inner.io.as_ref(), bank) {
            error!(board = inner.board, error = %e, "Refill failed; waveform torn down");
            *inner.refill_error.lock() = Some(e);
            break;
        }
    }
    inner.refill_running.store(false, Ordering::SeqCst);
    debug!(board = inner.board, "Refill thread exiting");
}

/// Cloneable handle that can halt a board's waveform from any thread.
#[derive(Clone)]
pub struct HaltHandle {
    inner: Arc<DeviceInner>,
}

impl HaltHandle {
    /// Halt waveform output. Idempotent, and a no-op once the board is closed.
    pub fn halt(&self) -> Result<()> {
        self.inner.refill_running.store(false, Ordering::SeqCst);
        let mut state = self.inner.state.lock();
        if state.closed {
            return Ok(());
        }
        let DeviceState { bank, engine, .. } = &mut *state;
        engine.halt(self.inner.io.as_ref(), bank)
    }

    /// Board index this handle controls.
    pub fn board(&self) -> usize {
        self.inner.board
    }
}

impl fmt::Debug for HaltHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HaltHandle").field("board", &self.inner.board).finish()
    }
}

/// An open AP235 board.
///
/// Dropping an open handle halts any waveform and frees the board index,
/// logging a warning; call [`close`](Self::close) to do this explicitly and
/// see errors.
pub struct Ap235 {
    inner: Arc<DeviceInner>,
    refill: RefillConfig,
    refill_thread: Option<JoinHandle<()>>,
}

macro_rules! channel_accessors {
    ($($(#[$doc:meta])* $get:ident / $set:ident: $ty:ty;)+) => {
        $(
            $(#[$doc])*
            pub fn $set(&self, channel: usize, value: $ty) -> Result<()> {
                self.inner.with_state(|s, io| s.bank.$set(io, channel, value))
            }

            #[doc = concat!("Value last set with [`", stringify!($set), "`](Self::", stringify!($set), ").")]
            pub fn $get(&self, channel: usize) -> Result<$ty> {
                self.inner.with_state(|s, _| Ok(s.bank.config(channel)?.$get()))
            }
        )+
    };
}

impl Ap235 {
    /// Open a board using [`Ap235Config::load`] for the backend and settings.
    pub fn open(board: usize) -> Result<Self> {
        let config = Ap235Config::load()
            .map_err(|e| Ap235Error::invalid_argument(format!("configuration: {}", e)))?;
        config.validate().map_err(Ap235Error::invalid_argument)?;
        Self::open_with_config(board, &config)
    }

    /// Open a board as described by `config`.
    pub fn open_with_config(board: usize, config: &Ap235Config) -> Result<Self> {
        if board >= MAX_BOARDS {
            return Err(Ap235Error::invalid_argument(format!(
                "board index {} out of range (0-{})",
                board,
                MAX_BOARDS - 1
            )));
        }
        let corrections = config.correction_table()?;
        let io: Arc<dyn RegisterIo> = match config.board.backend {
            Backend::Mapped => Arc::new(MappedRegisters::open(config.board.device_path(board))?),
            Backend::Simulated => Arc::new(SimulatedBoard::new()),
        };
        let device = Self::open_with(board, io, config.engine_settings())?.with_refill(config.refill);
        device.inner.state.lock().corrections = corrections;
        Ok(device)
    }

    /// Open a board on an explicit register backend.
    ///
    /// Every channel's default configuration is pushed before returning.
    pub fn open_with(board: usize, io: Arc<dyn RegisterIo>, settings: EngineSettings) -> Result<Self> {
        claim_board(board)?;

        let bank = ChannelBank::default();
        if let Err(e) = bank.push_all(io.as_ref()) {
            release_board(board);
            return Err(e);
        }

        info!(board, "Opened AP235");
        Ok(Self {
            inner: Arc::new(DeviceInner {
                board,
                io,
                state: Mutex::new(DeviceState {
                    bank,
                    engine: WaveformEngine::new(settings),
                    corrections: CorrectionTable::default(),
                    closed: false,
                }),
                refill_running: AtomicBool::new(false),
                refill_error: Mutex::new(None),
            }),
            refill: RefillConfig::default(),
            refill_thread: None,
        })
    }

    /// Replace the refill service settings.
    #[must_use]
    pub fn with_refill(mut self, refill: RefillConfig) -> Self {
        self.refill = refill;
        self
    }

    /// Board index.
    pub fn board(&self) -> usize {
        self.inner.board
    }

    /// Handle for halting the waveform from another thread.
    pub fn halt_handle(&self) -> HaltHandle {
        HaltHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Close the board. Fails while a waveform is armed or streaming.
    pub fn close(&mut self) -> Result<()> {
        {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(Ap235Error::invalid_state(format!("board {} is already closed", self.inner.board)));
            }
            if state.engine.state().is_live() {
                return Err(Ap235Error::invalid_state(format!(
                    "board {} waveform is {}; stop it before closing",
                    self.inner.board,
                    state.engine.state()
                )));
            }
        }
        self.stop_refill();
        self.shut_down();
        info!(board = self.inner.board, "Closed AP235");
        Ok(())
    }

    fn shut_down(&self) {
        let mut state = self.inner.state.lock();
        let settings = *state.engine.settings();
        state.engine = WaveformEngine::new(settings);
        state.closed = true;
        release_board(self.inner.board);
    }

    fn stop_refill(&mut self) {
        self.inner.refill_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.refill_thread.take() {
            if handle.join().is_err() {
                error!(board = self.inner.board, "Refill thread panicked");
            }
        }
    }

    fn spawn_refill(&mut self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let wait = self.refill.wait();
        self.inner.refill_running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("ap235-refill-{}", self.inner.board))
            .spawn(move || refill_loop(&inner, wait));
        match spawned {
            Ok(handle) => {
                self.refill_thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.refill_running.store(false, Ordering::SeqCst);
                Err(Ap235Error::invalid_state(format!("cannot spawn refill thread: {}", e)))
            }
        }
    }

    // =========================================================================
    // Channel configuration
    // =========================================================================

    channel_accessors! {
        /// Select a channel's output range.
        range / set_range: OutputRange;
        /// Select the level a channel takes at power-up.
        power_up_scale / set_power_up_scale: OutputScale;
        /// Select the level a channel takes on clear.
        clear_scale / set_clear_scale: OutputScale;
        /// Shut the channel down on over-temperature.
        thermal_shutdown / set_thermal_shutdown: bool;
        /// Allow the over-range band.
        over_range_allowed / set_over_range_allowed: bool;
        /// Select what advances the channel.
        trigger_source / set_trigger_source: TriggerSource;
        /// `true` latches writes on [`flush`](Self::flush), `false` outputs immediately.
        simultaneous_update / set_simultaneous_update: bool;
        /// Drive the clear level when the FIFO underflows.
        underflow_clear / set_underflow_clear: bool;
    }

    /// Snapshot of a channel's configuration.
    pub fn channel_config(&self, channel: usize) -> Result<ChannelConfig> {
        self.inner.with_state(|s, _| s.bank.config(channel))
    }

    /// Clear a channel's output data.
    pub fn clear(&self, channel: usize) -> Result<()> {
        self.inner.with_state(|s, io| s.bank.clear(io, channel))
    }

    /// Return a channel to power-on defaults.
    pub fn reset(&self, channel: usize) -> Result<()> {
        self.inner.with_state(|s, io| s.bank.reset(io, channel))
    }

    // =========================================================================
    // Direct output
    // =========================================================================

    /// Output a calibrated voltage.
    pub fn output(&self, channel: usize, volts: f64) -> Result<()> {
        self.inner.with_state(|s, io| {
            let range = s.bank.config(channel)?.range();
            let dn = voltage_to_dn_corrected(range, volts, s.corrections.get(channel, range))
                .map_err(|e| e.on_channel(channel))?;
            s.engine.output_single(io, &s.bank, channel, dn)
        })
    }

    /// Output a raw two's-complement code.
    pub fn output_dn(&self, channel: usize, dn: i16) -> Result<()> {
        self.inner
            .with_state(|s, io| s.engine.output_single(io, &s.bank, channel, dn))
    }

    /// Output calibrated voltages to several software-triggered channels.
    pub fn output_multi(&self, channels: &[usize], volts: &[f64]) -> Result<()> {
        self.inner.with_state(|s, io| {
            sync::output_multi(io, &s.bank, &mut s.engine, &s.corrections, channels, volts)
        })
    }

    /// Output raw codes to several software-triggered channels.
    pub fn output_multi_dn(&self, channels: &[usize], dns: &[i16]) -> Result<()> {
        self.inner
            .with_state(|s, io| sync::output_multi_dn(io, &s.bank, &mut s.engine, channels, dns))
    }

    /// Latch all pending simultaneous-mode values.
    pub fn flush(&self) -> Result<()> {
        self.inner.with_state(|_, io| sync::flush(io))
    }

    /// Cursor of a channel's sample buffer.
    pub fn output_buffer(&self, channel: usize) -> Result<OutputBuffer> {
        self.inner.with_state(|s, _| s.engine.buffer(channel))
    }

    /// A stored sample, as a two's-complement code.
    pub fn sample(&self, channel: usize, index: usize) -> Result<i16> {
        self.inner.with_state(|s, _| s.engine.sample(channel, index))
    }

    // =========================================================================
    // Waveform
    // =========================================================================

    /// Load raw codes into a channel's waveform memory.
    pub fn populate_waveform(&self, channel: usize, samples: &[i16]) -> Result<()> {
        self.inner
            .with_state(|s, io| s.engine.populate(io, channel, samples))
    }

    /// Load calibrated voltages into a channel's waveform memory. Nothing
    /// is stored if any value is out of range.
    pub fn populate_waveform_volts(&self, channel: usize, volts: &[f64]) -> Result<()> {
        self.inner.with_state(|s, io| {
            let range = s.bank.config(channel)?.range();
            let correction = s.corrections.get(channel, range);
            let samples = volts
                .iter()
                .map(|&v| voltage_to_dn_corrected(range, v, correction).map_err(|e| e.on_channel(channel)))
                .collect::<Result<Vec<i16>>>()?;
            s.engine.populate(io, channel, &samples)
        })
    }

    /// Set up channels for FIFO output on a timer or external trigger.
    pub fn configure_waveform(&self, channels: &[usize], trigger: TriggerSource) -> Result<()> {
        self.inner.take_refill_error()?;
        self.inner.with_state(|s, io| {
            let DeviceState { bank, engine, .. } = s;
            engine.configure(io, bank, channels, trigger)
        })
    }

    /// Write the descriptor chain and prepare the DMA engine.
    pub fn arm(&self) -> Result<()> {
        self.inner.take_refill_error()?;
        self.inner.with_state(|s, io| {
            let DeviceState { bank, engine, .. } = s;
            engine.arm(io, bank)
        })
    }

    /// Start output. With background refill enabled a refill thread is
    /// spawned; otherwise call [`service_interrupt`](Self::service_interrupt).
    pub fn start_waveform(&mut self) -> Result<()> {
        self.inner.take_refill_error()?;
        self.stop_refill();
        self.inner.with_state(|s, io| {
            let DeviceState { bank, engine, .. } = s;
            engine.start(io, bank)
        })?;
        if self.refill.background {
            if let Err(e) = self.spawn_refill() {
                warn!(board = self.inner.board, error = %e, "Halting waveform without a refill thread");
                self.halt_handle().halt()?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Halt output and stop the refill thread. Reports a refill failure
    /// that happened since the last engine call.
    pub fn stop_waveform(&mut self) -> Result<()> {
        self.stop_refill();
        self.inner.with_state(|s, io| {
            let DeviceState { bank, engine, .. } = s;
            engine.halt(io, bank)
        })?;
        self.inner.take_refill_error()
    }

    /// Tear down DMA state and return waveform channels to direct access.
    pub fn reset_waveform(&mut self) -> Result<()> {
        self.stop_refill();
        self.inner.refill_error.lock().take();
        self.inner.with_state(|s, io| {
            let DeviceState { bank, engine, .. } = s;
            engine.reset(io, bank)
        })
    }

    /// Refill channels with a pending half-full interrupt. Returns the
    /// serviced channels, one bit per channel.
    pub fn service_interrupt(&self) -> Result<u32> {
        self.inner.take_refill_error()?;
        self.inner.with_state(|s, io| {
            let DeviceState { bank, engine, .. } = s;
            engine.service_interrupt(io, bank)
        })
    }

    /// Block until an interrupt is pending or `timeout` elapses.
    pub fn wait_for_interrupt(&self, timeout: Duration) -> Result<bool> {
        self.inner.io.wait_for_interrupt(timeout)
    }

    /// Current waveform engine state.
    pub fn waveform_state(&self) -> Result<WaveformState> {
        self.inner.with_state(|s, _| Ok(s.engine.state()))
    }

    // =========================================================================
    // Timing
    // =========================================================================

    /// Program the board timer.
    ///
    /// Periods below the DAC settling time are still applied and reported
    /// with [`Ap235Error::TimerTooFast`].
    pub fn set_timer_period(&self, period_ns: u32) -> Result<()> {
        let divider = divider_for_period(period_ns);
        self.inner
            .with_state(|s, io| s.bank.set_timer_divider(io, divider))?;
        check_divider(period_ns, divider)
    }

    /// Timer period currently programmed, in nanoseconds.
    pub fn timer_period(&self) -> Result<u32> {
        self.inner
            .with_state(|s, _| Ok(period_for_divider(s.bank.timer_divider())))
    }

    /// Set the trigger line direction.
    pub fn set_trigger_direction(&self, direction: TriggerDirection) -> Result<()> {
        self.inner
            .with_state(|s, io| s.bank.set_trigger_direction(io, direction))
    }

    /// Trigger line direction.
    pub fn trigger_direction(&self) -> Result<TriggerDirection> {
        self.inner.with_state(|s, _| Ok(s.bank.trigger_direction()))
    }

    // =========================================================================
    // Calibration and status
    // =========================================================================

    /// Replace a channel's correction coefficients for one range.
    pub fn set_correction(&self, channel: usize, range: OutputRange, correction: Correction) -> Result<()> {
        self.inner
            .with_state(|s, _| s.corrections.set(channel, range, correction))
    }

    /// A channel's correction coefficients for one range.
    pub fn correction(&self, channel: usize, range: OutputRange) -> Result<Correction> {
        validate_channel(channel)?;
        self.inner.with_state(|s, _| Ok(s.corrections.get(channel, range)))
    }

    /// Read identity, health and all channel status registers.
    pub fn status(&self) -> Result<BoardStatus> {
        self.inner.with_state(|_, io| read_board_status(io))
    }

    /// Read one channel's status register.
    pub fn channel_status(&self, channel: usize) -> Result<ChannelStatus> {
        self.inner
            .with_state(|_, io| read_channel_status(io, channel))
    }
}

impl fmt::Debug for Ap235 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ap235")
            .field("board", &self.inner.board)
            .field("refill", &self.refill)
            .field("refill_running", &self.inner.refill_running.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for Ap235 {
    fn drop(&mut self) {
        if self.inner.state.lock().closed {
            return;
        }
        warn!(board = self.inner.board, "AP235 dropped without close; halting");
        self.stop_refill();
        if let Err(e) = self.halt_handle().halt() {
            warn!(board = self.inner.board, error = %e, "Error halting waveform on drop");
        }
        self.shut_down();
    }
}
