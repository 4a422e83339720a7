//! Coordinated output across several channels.
//!
//! All group checks (software trigger, direct-access mode, matching update
//! mode) run before the first register write, so a misconfigured group
//! never half-triggers a simultaneous update. Conversion errors are only
//! found per value: channels before the failing entry keep their new value
//! and no flush is issued.

use std::collections::HashSet;

use tracing::debug;

use crate::calibration::{voltage_to_dn_corrected, CorrectionTable};
use crate::channel::{ChannelBank, OperatingMode, TriggerSource};
use crate::error::{Ap235Error, Result};
use crate::io::RegisterIo;
use crate::registers::SOFTWARE_TRIGGER;
use crate::waveform::WaveformEngine;

/// Latch every pending simultaneous-mode value to its DAC.
pub fn flush(io: &dyn RegisterIo) -> Result<()> {
    io.write_register(SOFTWARE_TRIGGER, 1)
}

/// Validate a channel group and return its shared update mode
/// (`true` for simultaneous).
fn check_group(bank: &ChannelBank, channels: &[usize], values: usize) -> Result<bool> {
    if channels.is_empty() {
        return Err(Ap235Error::invalid_argument("no channels given"));
    }
    if channels.len() != values {
        return Err(Ap235Error::invalid_argument(format!(
            "{} channels but {} values",
            channels.len(),
            values
        )));
    }

    let mut seen = HashSet::with_capacity(channels.len());
    let mut reference = None;
    for &channel in channels {
        let cfg = bank.config(channel)?;
        if !seen.insert(channel) {
            return Err(Ap235Error::invalid_argument(format!("channel {} listed twice", channel)));
        }
        if cfg.trigger_source() != TriggerSource::Software {
            return Err(Ap235Error::invalid_state(format!(
                "channel {} uses {} trigger; grouped output needs software trigger",
                channel,
                cfg.trigger_source()
            )));
        }
        if cfg.operating_mode() == OperatingMode::Waveform || bank.locked_mask() & (1 << channel) != 0 {
            return Err(Ap235Error::invalid_state(format!(
                "channel {} is in waveform mode",
                channel
            )));
        }
        match reference {
            None => reference = Some(cfg.simultaneous_update()),
            Some(simultaneous) if simultaneous != cfg.simultaneous_update() => {
                return Err(Ap235Error::invalid_state(format!(
                    "channel {} update mode differs from channel {}; mixed immediate and simultaneous output",
                    channel, channels[0]
                )));
            }
            Some(_) => {}
        }
    }
    Ok(reference.unwrap_or(false))
}

/// Write calibrated voltages to a group of channels, flushing once if the
/// group is in simultaneous mode.
pub fn output_multi(
    io: &dyn RegisterIo,
    bank: &ChannelBank,
    engine: &mut WaveformEngine,
    corrections: &CorrectionTable,
    channels: &[usize],
    volts: &[f64],
) -> Result<()> {
    let simultaneous = check_group(bank, channels, volts.len())?;
    for (&channel, &value) in channels.iter().zip(volts) {
        let range = bank.config(channel)?.range();
        let dn = voltage_to_dn_corrected(range, value, corrections.get(channel, range))
            .map_err(|e| e.on_channel(channel))?;
        engine.output_single(io, bank, channel, dn)?;
    }
    finish(io, channels, simultaneous)
}

/// Write raw DNs to a group of channels, flushing once if the group is in
/// simultaneous mode.
pub fn output_multi_dn(
    io: &dyn RegisterIo,
    bank: &ChannelBank,
    engine: &mut WaveformEngine,
    channels: &[usize],
    dns: &[i16],
) -> Result<()> {
    let simultaneous = check_group(bank, channels, dns.len())?;
    for (&channel, &dn) in channels.iter().zip(dns) {
        engine.output_single(io, bank, channel, dn)?;
    }
    finish(io, channels, simultaneous)
}

fn finish(io: &dyn RegisterIo, channels: &[usize], simultaneous: bool) -> Result<()> {
    if simultaneous {
        flush(io)?;
    }
    debug!(channels = ?channels, simultaneous, "Grouped output written");
    Ok(())
}
