//! Board and channel status read-back.
//!
//! The FPGA system monitor reports 12-bit readings in the top of a 16-bit
//! register. Temperatures convert with the XADC transfer function
//! (`raw * 503.975 / 4096 - 273.15` °C), supply voltages as
//! `raw / 4096 * 3` V.

use serde::Serialize;

use crate::channel::validate_channel;
use crate::error::Result;
use crate::io::RegisterIo;
use crate::registers::{
    channel_register, ChannelRegister, ChannelStatusBits, CHANNEL_COUNT, FIRMWARE_REVISION, LOCATION,
    XADC_MAX_TEMPERATURE, XADC_MAX_VCCAUX, XADC_MAX_VCCINT, XADC_MIN_TEMPERATURE, XADC_MIN_VCCAUX, XADC_MIN_VCCINT,
    XADC_TEMPERATURE, XADC_VCCAUX, XADC_VCCINT,
};

/// Die temperature in °C for a raw XADC register value.
pub fn xadc_temperature(raw: u32) -> f64 {
    f64::from((raw >> 4) & 0x0FFF) * 503.975 / 4096.0 - 273.15
}

/// Supply voltage for a raw XADC register value.
pub fn xadc_voltage(raw: u32) -> f64 {
    f64::from((raw >> 4) & 0x0FFF) / 4096.0 * 3.0
}

/// Current value and the extremes seen since power-up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    /// Latest sample.
    pub current: f64,
    /// Highest since power-up.
    pub max: f64,
    /// Lowest since power-up.
    pub min: f64,
}

impl Reading {
    fn read(io: &dyn RegisterIo, registers: [u32; 3], convert: fn(u32) -> f64) -> Result<Self> {
        Ok(Self {
            current: convert(io.read_register(registers[0])?),
            max: convert(io.read_register(registers[1])?),
            min: convert(io.read_register(registers[2])?),
        })
    }
}

/// Decoded channel status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    /// Channel index.
    pub channel: usize,
    /// FIFO holds no samples.
    pub fifo_empty: bool,
    /// FIFO at or below half.
    pub fifo_half_full: bool,
    /// FIFO full.
    pub fifo_full: bool,
    /// FIFO ran dry while triggered.
    pub fifo_underflow: bool,
    /// Single-burst output finished.
    pub burst_complete: bool,
    /// DAC update in progress.
    pub busy: bool,
}

impl ChannelStatus {
    /// Decode a raw status register value.
    pub fn from_raw(channel: usize, raw: u32) -> Self {
        let bits = ChannelStatusBits::from_bits_truncate(raw);
        Self {
            channel,
            fifo_empty: bits.contains(ChannelStatusBits::FIFO_EMPTY),
            fifo_half_full: bits.contains(ChannelStatusBits::FIFO_HALF_FULL),
            fifo_full: bits.contains(ChannelStatusBits::FIFO_FULL),
            fifo_underflow: bits.contains(ChannelStatusBits::FIFO_UNDERFLOW),
            burst_complete: bits.contains(ChannelStatusBits::BURST_COMPLETE),
            busy: bits.contains(ChannelStatusBits::BUSY),
        }
    }
}

/// Snapshot of board identity, health and every channel's status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardStatus {
    /// Carrier slot location word.
    pub location: u32,
    /// FPGA firmware revision.
    pub firmware_revision: u32,
    /// FPGA die temperature, °C.
    pub temperature_c: Reading,
    /// Core supply, volts.
    pub vcc_int: Reading,
    /// Auxiliary supply, volts.
    pub vcc_aux: Reading,
    /// Every channel, in order.
    pub channels: Vec<ChannelStatus>,
}

/// Read one channel's status register.
pub fn read_channel_status(io: &dyn RegisterIo, channel: usize) -> Result<ChannelStatus> {
    validate_channel(channel)?;
    let raw = io.read_register(channel_register(channel, ChannelRegister::Status))?;
    Ok(ChannelStatus::from_raw(channel, raw))
}

/// Read the full board status.
pub fn read_board_status(io: &dyn RegisterIo) -> Result<BoardStatus> {
    let channels = (0..CHANNEL_COUNT)
        .map(|ch| read_channel_status(io, ch))
        .collect::<Result<Vec<_>>>()?;
    Ok(BoardStatus {
        location: io.read_register(LOCATION)?,
        firmware_revision: io.read_register(FIRMWARE_REVISION)?,
        temperature_c: Reading::read(
            io,
            [XADC_TEMPERATURE, XADC_MAX_TEMPERATURE, XADC_MIN_TEMPERATURE],
            xadc_temperature,
        )?,
        vcc_int: Reading::read(io, [XADC_VCCINT, XADC_MAX_VCCINT, XADC_MIN_VCCINT], xadc_voltage)?,
        vcc_aux: Reading::read(io, [XADC_VCCAUX, XADC_MAX_VCCAUX, XADC_MIN_VCCAUX], xadc_voltage)?,
        channels,
    })
}
