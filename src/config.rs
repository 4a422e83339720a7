//! Driver configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. an optional TOML file (`config/ap235.toml` unless a path is given)
//! 3. environment variables prefixed with `AP235_`, nested keys separated
//!    by `__` (e.g. `AP235_BOARD__BACKEND=simulated`,
//!    `AP235_POLLING__RESET__MAX_ATTEMPTS=200`)
//!
//! # Example
//! ```no_run
//! use ap235::config::Ap235Config;
//!
//! let config = Ap235Config::load()?;
//! config.validate()?;
//! println!("Board {} via {:?}", config.board.index, config.board.backend);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::buffer::Pinning;
use crate::calibration::{Correction, CorrectionTable, OutputRange};
use crate::io::PollPolicy;
use crate::logging::{parse_log_level, OutputFormat};
use crate::registers::{CHANNEL_COUNT, MAX_BOARDS};
use crate::waveform::EngineSettings;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/ap235.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ap235Config {
    /// Which board and how to reach it
    #[serde(default)]
    pub board: BoardConfig,
    /// Bounded polls used while arming and streaming
    #[serde(default)]
    pub polling: PollingConfig,
    /// Background refill service
    #[serde(default)]
    pub refill: RefillConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Offset/gain corrections per channel and range
    #[serde(default)]
    pub corrections: Vec<CorrectionEntry>,
}

/// Register backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Memory-mapped device node
    #[default]
    Mapped,
    /// In-process simulated board
    Simulated,
}

/// Board selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Board index, 0 through 4
    #[serde(default)]
    pub index: usize,
    /// Register backend
    #[serde(default)]
    pub backend: Backend,
    /// Device node; defaults to `/dev/ap235_<index>`
    #[serde(default)]
    pub device: Option<PathBuf>,
    /// Policy when the DMA arena cannot be locked into memory
    #[serde(default)]
    pub pinning: Pinning,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            index: 0,
            backend: Backend::default(),
            device: None,
            pinning: Pinning::default(),
        }
    }
}

impl BoardConfig {
    /// Device node to map for `board`.
    pub fn device_path(&self, board: usize) -> PathBuf {
        self.device
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/dev/ap235_{}", board)))
    }
}

/// Poll ceilings for the DMA bring-up and refill
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// CDMA reset completion
    #[serde(default)]
    pub reset: PollPolicy,
    /// CDMA idle after the initial burst
    #[serde(default)]
    pub idle: PollPolicy,
    /// CDMA completion interrupt during refill
    #[serde(default)]
    pub dma: PollPolicy,
}

/// Refill service settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefillConfig {
    /// Spawn a refill thread when streaming starts
    #[serde(default = "default_background")]
    pub background: bool,
    /// How long one interrupt wait lasts before the thread rechecks for shutdown
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,
}

impl Default for RefillConfig {
    fn default() -> Self {
        Self {
            background: default_background(),
            wait_ms: default_wait_ms(),
        }
    }
}

impl RefillConfig {
    /// Interrupt wait as a duration.
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
    /// Include source file and line
    #[serde(default)]
    pub with_file_and_line: bool,
    /// Include thread names
    #[serde(default = "default_thread_names")]
    pub with_thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
            with_file_and_line: false,
            with_thread_names: default_thread_names(),
        }
    }
}

/// One correction table entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEntry {
    /// Channel index
    pub channel: usize,
    /// Output range the coefficients apply to
    pub range: OutputRange,
    /// Offset, 1/16 LSB
    #[serde(default)]
    pub offset: i16,
    /// Gain, 2^-20
    #[serde(default)]
    pub gain: i16,
}

fn default_background() -> bool {
    true
}

fn default_wait_ms() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_thread_names() -> bool {
    true
}

impl Ap235Config {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file is
    /// not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The provider stack behind [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Ap235Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("AP235_").split("__"))
    }

    /// Switch to the simulated board with best-effort arena pinning.
    pub fn use_simulated(&mut self) {
        self.board.backend = Backend::Simulated;
        self.board.pinning = Pinning::BestEffort;
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.board.index >= MAX_BOARDS {
            return Err(format!(
                "Invalid board index {}. Must be 0-{}",
                self.board.index,
                MAX_BOARDS - 1
            ));
        }

        for (name, policy) in [
            ("reset", &self.polling.reset),
            ("idle", &self.polling.idle),
            ("dma", &self.polling.dma),
        ] {
            if policy.max_attempts == 0 {
                return Err(format!("Invalid polling.{}.max_attempts 0. Must be at least 1", name));
            }
        }

        parse_log_level(&self.logging.level)?;

        let mut seen = HashSet::new();
        for entry in &self.corrections {
            if entry.channel >= CHANNEL_COUNT {
                return Err(format!(
                    "Invalid correction channel {}. Must be 0-{}",
                    entry.channel,
                    CHANNEL_COUNT - 1
                ));
            }
            if !seen.insert((entry.channel, entry.range)) {
                return Err(format!(
                    "Duplicate correction for channel {} range {}",
                    entry.channel, entry.range
                ));
            }
        }

        Ok(())
    }

    /// Engine settings derived from the polling and board sections.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            reset_poll: self.polling.reset,
            idle_poll: self.polling.idle,
            dma_poll: self.polling.dma,
            pinning: self.board.pinning,
        }
    }

    /// Correction table built from the configured entries.
    pub fn correction_table(&self) -> crate::error::Result<CorrectionTable> {
        let mut table = CorrectionTable::default();
        for entry in &self.corrections {
            let correction = Correction {
                offset: entry.offset,
                gain: entry.gain,
            };
            table.set(entry.channel, entry.range, correction)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Ap235Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.board.backend, Backend::Mapped);
        assert_eq!(config.board.device_path(2), PathBuf::from("/dev/ap235_2"));
        assert_eq!(config.polling.reset.max_attempts, 100);
        assert!(config.refill.background);
        assert_eq!(config.engine_settings().pinning, Pinning::Required);
    }

    #[test]
    fn test_simulated_backend_pins_best_effort() {
        let mut config = Ap235Config::default();
        config.use_simulated();
        assert!(config.validate().is_ok());
        assert_eq!(config.board.backend, Backend::Simulated);
        assert_eq!(config.engine_settings().pinning, Pinning::BestEffort);
    }

    #[test]
    fn test_invalid_board_index() {
        let mut config = Ap235Config::default();
        config.board.index = MAX_BOARDS;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_attempts() {
        let mut config = Ap235Config::default();
        config.polling.dma.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("polling.dma"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Ap235Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_corrections() {
        let mut config = Ap235Config::default();
        config.corrections = vec![
            CorrectionEntry {
                channel: 3,
                range: OutputRange::Bipolar5V,
                offset: 16,
                gain: -200,
            },
            CorrectionEntry {
                channel: 3,
                range: OutputRange::Bipolar10V,
                offset: 0,
                gain: 0,
            },
        ];
        assert!(config.validate().is_ok());
        let table = config.correction_table().unwrap();
        assert_eq!(table.get(3, OutputRange::Bipolar5V), Correction { offset: 16, gain: -200 });

        config.corrections.push(CorrectionEntry {
            channel: 3,
            range: OutputRange::Bipolar5V,
            offset: 1,
            gain: 1,
        });
        assert!(config.validate().unwrap_err().contains("Duplicate"));

        config.corrections = vec![CorrectionEntry {
            channel: 16,
            range: OutputRange::Bipolar5V,
            offset: 1,
            gain: 1,
        }];
        assert!(config.validate().is_err());
        assert!(config.correction_table().is_err());
    }
}
