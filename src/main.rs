//! `ap235ctl`: command-line control of an AP235 board
//!
//! # Usage
//!
//! Show board health and channel status:
//! ```bash
//! ap235ctl status --json
//! ```
//!
//! Drive a channel to a voltage:
//! ```bash
//! ap235ctl output 3 2.5 --range=-10,10
//! ```
//!
//! Update several channels on one software trigger:
//! ```bash
//! ap235ctl multi --channels 0,1,2 --volts 1.0,-1.0,0.5 --simultaneous
//! ```
//!
//! Stream a 1 kHz sine for five seconds:
//! ```bash
//! ap235ctl waveform 0 --shape sine --amplitude 5 --samples 1000 --period-ns 1000 --seconds 5
//! ```
//!
//! Every command accepts `--simulated` to run against the in-process
//! simulated board instead of `/dev/ap235_<board>`.

use std::f64::consts::TAU;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use ap235::calibration::OutputRange;
use ap235::channel::TriggerSource;
use ap235::config::{Ap235Config, DEFAULT_CONFIG_PATH};
use ap235::logging;
use ap235::Ap235;

#[derive(Parser)]
#[command(name = "ap235ctl")]
#[command(about = "Control an Acromag AP235 waveform DAC", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Board index (overrides the configuration)
    #[arg(long, global = true)]
    board: Option<usize>,

    /// Use the simulated board
    #[arg(long, global = true)]
    simulated: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print board identity, health and channel status
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Output a voltage on one channel
    Output {
        /// Channel index (0-15)
        channel: usize,
        /// Voltage
        #[arg(allow_negative_numbers = true)]
        volts: f64,
        /// Output range, e.g. `-10,10` or `0,5`
        #[arg(long)]
        range: Option<OutputRange>,
    },

    /// Output voltages on several channels at once
    Multi {
        /// Channel indices
        #[arg(long, value_delimiter = ',', required = true)]
        channels: Vec<usize>,
        /// One voltage per channel
        #[arg(long, value_delimiter = ',', required = true, allow_negative_numbers = true)]
        volts: Vec<f64>,
        /// Latch all channels on a single software trigger
        #[arg(long)]
        simultaneous: bool,
    },

    /// Stream a generated waveform on one channel
    Waveform {
        /// Channel index (0-15)
        channel: usize,
        /// Waveform shape
        #[arg(long, value_enum, default_value_t = Shape::Sine)]
        shape: Shape,
        /// Peak amplitude in volts
        #[arg(long, default_value_t = 5.0)]
        amplitude: f64,
        /// Samples per cycle (even, at most 4096)
        #[arg(long, default_value_t = 1000)]
        samples: usize,
        /// Timer period in nanoseconds
        #[arg(long, default_value_t = 10_000)]
        period_ns: u32,
        /// How long to stream
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Shape {
    Sine,
    Square,
    Triangle,
}

impl Shape {
    fn generate(self, amplitude: f64, samples: usize) -> Vec<f64> {
        (0..samples)
            .map(|i| {
                let phase = i as f64 / samples as f64;
                match self {
                    Shape::Sine => amplitude * (phase * TAU).sin(),
                    Shape::Square if phase < 0.5 => amplitude,
                    Shape::Square => -amplitude,
                    Shape::Triangle => amplitude * (1.0 - 4.0 * (phase - 0.5).abs()),
                }
            })
            .collect()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Ap235Config::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(board) = cli.board {
        config.board.index = board;
    }
    if cli.simulated {
        config.use_simulated();
    }
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_tracing(&config.logging).map_err(|e| anyhow!(e))?;

    let mut dac = Ap235::open_with_config(config.board.index, &config)
        .with_context(|| format!("opening board {}", config.board.index))?;

    let result = match cli.command {
        Commands::Status { json } => show_status(&dac, json),
        Commands::Output { channel, volts, range } => output(&dac, channel, volts, range),
        Commands::Multi {
            channels,
            volts,
            simultaneous,
        } => multi(&dac, &channels, &volts, simultaneous),
        Commands::Waveform {
            channel,
            shape,
            amplitude,
            samples,
            period_ns,
            seconds,
        } => stream(&mut dac, channel, shape.generate(amplitude, samples), period_ns, seconds),
    };

    let closed = dac.close();
    result?;
    closed?;
    Ok(())
}

fn show_status(dac: &Ap235, json: bool) -> Result<()> {
    let status = dac.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Board {} (location {:#06x})", dac.board(), status.location);
    println!("Firmware revision {:#x}", status.firmware_revision);
    println!(
        "Temperature {:.1} °C (min {:.1}, max {:.1})",
        status.temperature_c.current, status.temperature_c.min, status.temperature_c.max
    );
    println!("VCCINT {:.3} V   VCCAUX {:.3} V", status.vcc_int.current, status.vcc_aux.current);
    println!();
    println!("ch  range      empty  half  full  underflow  busy");
    for ch in &status.channels {
        println!(
            "{:>2}  {:<9}  {:<5}  {:<4}  {:<4}  {:<9}  {}",
            ch.channel,
            dac.range(ch.channel)?.to_string(),
            ch.fifo_empty,
            ch.fifo_half_full,
            ch.fifo_full,
            ch.fifo_underflow,
            ch.busy
        );
    }
    Ok(())
}

fn output(dac: &Ap235, channel: usize, volts: f64, range: Option<OutputRange>) -> Result<()> {
    if let Some(range) = range {
        dac.set_range(channel, range)?;
    }
    dac.output(channel, volts)?;
    info!(channel, volts, "Output written");
    Ok(())
}

fn multi(dac: &Ap235, channels: &[usize], volts: &[f64], simultaneous: bool) -> Result<()> {
    for &channel in channels {
        dac.set_simultaneous_update(channel, simultaneous)?;
    }
    dac.output_multi(channels, volts)?;
    info!(?channels, simultaneous, "Grouped output written");
    Ok(())
}

fn stream(dac: &mut Ap235, channel: usize, volts: Vec<f64>, period_ns: u32, seconds: f64) -> Result<()> {
    dac.populate_waveform_volts(channel, &volts)?;
    if let Err(e) = dac.set_timer_period(period_ns) {
        if !e.is_warning() {
            return Err(e.into());
        }
        tracing::warn!(error = %e, "Timer faster than the DAC settles");
    }
    dac.configure_waveform(&[channel], TriggerSource::Timer)?;
    dac.arm()?;
    dac.start_waveform()?;
    info!(channel, samples = volts.len(), period_ns, seconds, "Streaming");

    thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));

    let stopped = dac.stop_waveform();
    dac.reset_waveform()?;
    stopped?;
    info!(channel, "Stream stopped");
    Ok(())
}
