#![cfg(feature = "hardware")]

//! Smoke tests against a real AP235.
//!
//! Needs the board's device node (`/dev/ap235_<board>` unless configured
//! otherwise) and permission to lock memory. Outputs are driven, so do not
//! run with anything sensitive connected.
//!
//! Run with:
//! ```bash
//! AP235_HARDWARE_TEST=1 cargo test --test hardware_smoke_test --features hardware -- --nocapture --test-threads=1
//! ```

use std::env;
use std::thread;
use std::time::Duration;

use ap235::channel::TriggerSource;
use ap235::config::Ap235Config;
use ap235::logging;
use ap235::waveform::WaveformState;
use ap235::Ap235;

// =============================================================================
// Test Configuration
// =============================================================================

/// Check if the hardware suite is enabled via environment variable
fn hardware_enabled() -> bool {
    env::var("AP235_HARDWARE_TEST")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Skip test with message if the hardware suite is not enabled
macro_rules! skip_if_disabled {
    () => {
        if !hardware_enabled() {
            println!("AP235 hardware test skipped (set AP235_HARDWARE_TEST=1 to enable)");
            return;
        }
    };
}

// =============================================================================
// Tests
// =============================================================================

fn open() -> Ap235 {
    let config = Ap235Config::load().unwrap();
    config.validate().unwrap();
    logging::init_tracing(&config.logging).unwrap();
    Ap235::open_with_config(config.board.index, &config).unwrap()
}

#[test]
fn test_status() {
    skip_if_disabled!();
    let mut dac = open();
    let status = dac.status().unwrap();
    println!("{status:#?}");
    assert!(status.temperature_c.current > -40.0 && status.temperature_c.current < 125.0);
    assert!((status.vcc_int.current - 1.0).abs() < 0.1);
    dac.close().unwrap();
}

#[test]
fn test_direct_output() {
    skip_if_disabled!();
    let mut dac = open();
    for volts in [-5.0, 0.0, 5.0, 0.0] {
        dac.output(0, volts).unwrap();
        thread::sleep(Duration::from_millis(50));
    }
    dac.close().unwrap();
}

#[test]
fn test_stream_one_second() {
    skip_if_disabled!();
    let mut dac = open();
    let sine: Vec<f64> = (0..2000)
        .map(|i| 2.0 * (i as f64 * std::f64::consts::TAU / 2000.0).sin())
        .collect();
    dac.populate_waveform_volts(0, &sine).unwrap();
    dac.set_timer_period(20_000).unwrap();
    dac.configure_waveform(&[0], TriggerSource::Timer).unwrap();
    dac.arm().unwrap();
    dac.start_waveform().unwrap();

    thread::sleep(Duration::from_secs(1));
    assert_eq!(dac.waveform_state().unwrap(), WaveformState::Streaming);
    assert!(!dac.channel_status(0).unwrap().fifo_underflow);

    dac.stop_waveform().unwrap();
    dac.reset_waveform().unwrap();
    dac.close().unwrap();
}
