//! # AP235 Waveform DAC Driver
//!
//! Driver core for the Acromag AP235: sixteen 16-bit analog outputs with
//! per-channel FIFOs fed by a scatter-gather CDMA engine.
//!
//! ## Crate Structure
//!
//! - **`device`**: [`Ap235`], the open-board handle, and the process-wide
//!   board registry. Start here.
//! - **`channel`**: Per-channel configuration mirrors and the control
//!   register encoding.
//! - **`calibration`**: Voltage/DN conversion with factory calibration and
//!   per-channel offset/gain correction.
//! - **`sync`**: Grouped output and the software trigger that latches
//!   simultaneous-mode channels together.
//! - **`waveform`**: The streaming state machine (configure, arm, start,
//!   refill, halt, reset).
//! - **`descriptor`**: Ping/pong scatter-gather descriptor chain planning.
//! - **`buffer`**: Pinned sample memory and per-channel output cursors.
//! - **`timing`**: Board timer and trigger line direction.
//! - **`status`**: Board identity, FPGA health and channel status read-back.
//! - **`registers`**: Register map and bit definitions.
//! - **`io`**: The [`RegisterIo`](io::RegisterIo) trait and the
//!   memory-mapped backend.
//! - **`sim`**: A simulated board for tests and hardware-free development.
//! - **`config`**: Layered configuration (defaults, TOML, environment).
//! - **`logging`**: Tracing subscriber setup.
//! - **`error`**: [`Ap235Error`] and the crate [`Result`] alias.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ap235::prelude::*;
//!
//! # fn main() -> ap235::Result<()> {
//! let board = Arc::new(SimulatedBoard::new());
//! let mut dac = Ap235::open_with(0, board, EngineSettings::default())?;
//!
//! dac.set_range(3, OutputRange::Bipolar10V)?;
//! dac.output(3, 2.5)?;
//!
//! let sine: Vec<f64> = (0..2048)
//!     .map(|i| 5.0 * (i as f64 * std::f64::consts::TAU / 2048.0).sin())
//!     .collect();
//! dac.populate_waveform_volts(3, &sine)?;
//! dac.set_timer_period(10_000)?;
//! dac.configure_waveform(&[3], TriggerSource::Timer)?;
//! dac.arm()?;
//! dac.start_waveform()?;
//! // ...
//! dac.stop_waveform()?;
//! dac.close()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod calibration;
pub mod channel;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod io;
pub mod logging;
pub mod registers;
pub mod sim;
pub mod status;
pub mod sync;
pub mod timing;
pub mod waveform;

pub use device::{Ap235, HaltHandle};
pub use error::{Ap235Error, Result};

/// Commonly used types.
pub mod prelude {
    pub use crate::calibration::{Correction, OutputRange};
    pub use crate::channel::{OperatingMode, OutputScale, TriggerSource};
    pub use crate::config::Ap235Config;
    pub use crate::device::{Ap235, HaltHandle};
    pub use crate::error::{Ap235Error, Result};
    pub use crate::io::{PollPolicy, RegisterIo};
    pub use crate::sim::SimulatedBoard;
    pub use crate::timing::TriggerDirection;
    pub use crate::waveform::{EngineSettings, WaveformState};
}
