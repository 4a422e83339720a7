//! Register access.
//!
//! [`RegisterIo`] is the only path from this crate to a board. Reads and
//! writes are synchronous 32-bit accesses at byte offsets into the board's
//! register space. Waits on hardware state go through
//! [`RegisterIo::poll_until`], which always has a fixed attempt ceiling and
//! ends in a named [`Ap235Error::Timeout`].
//!
//! Two backends are provided: [`MappedRegisters`] maps the board's BAR
//! through a device node, and [`crate::sim::SimulatedBoard`] is an in-memory
//! register file used for tests and dry runs.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::error::{Ap235Error, ApStatus, Result};
use crate::registers::{INTERRUPT_PENDING, MASTER_ENABLE, MASTER_IRQ_ENABLE, REGISTER_SPACE_BYTES};

/// Attempt ceiling and spacing for a bounded register poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Reads before giving up.
    pub max_attempts: u32,
    /// Sleep between reads, in microseconds.
    pub interval_us: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            interval_us: 1000,
        }
    }
}

impl PollPolicy {
    /// Policy with the given ceiling and interval.
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval_us: interval.as_micros() as u64,
        }
    }

    /// Sleep between reads.
    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us)
    }
}

/// Synchronous access to a board's register space.
pub trait RegisterIo: Send + Sync {
    /// Read the 32-bit register at `offset`.
    fn read_register(&self, offset: u32) -> Result<u32>;

    /// Write `value` to the 32-bit register at `offset`.
    fn write_register(&self, offset: u32, value: u32) -> Result<()>;

    /// Read `offset` until `predicate` accepts the value, sleeping
    /// `policy.interval` between reads. Returns the accepted value.
    fn poll_until(
        &self,
        offset: u32,
        predicate: &dyn Fn(u32) -> bool,
        policy: &PollPolicy,
        operation: &str,
    ) -> Result<u32> {
        for attempt in 1..=policy.max_attempts {
            let value = self.read_register(offset)?;
            if predicate(value) {
                trace!(offset = format_args!("{:#06x}", offset), attempt, "Poll satisfied");
                return Ok(value);
            }
            if attempt < policy.max_attempts && policy.interval_us > 0 {
                thread::sleep(policy.interval());
            }
        }
        Err(Ap235Error::Timeout {
            operation: operation.to_string(),
            attempts: policy.max_attempts,
        })
    }

    /// Block until an enabled interrupt is pending or `timeout` elapses.
    /// Returns `true` if an interrupt is pending.
    ///
    /// The default implementation samples the pending register once per
    /// millisecond; backends with a real interrupt line should override it.
    fn wait_for_interrupt(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let master = self.read_register(MASTER_ENABLE)?;
            if master == MASTER_IRQ_ENABLE && self.read_register(INTERRUPT_PENDING)? != 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            thread::sleep((deadline - now).min(Duration::from_millis(1)));
        }
    }
}

/// Board registers mapped into this process through a device node.
pub struct MappedRegisters {
    path: PathBuf,
    map: Mutex<MmapMut>,
}

impl MappedRegisters {
    /// Map the register space exposed by `path` (for example
    /// `/dev/ap235_0` or a sysfs `resource0` file).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Ap235Error::HardwareFault {
                status: ApStatus::InvalidHandle,
                operation: format!("open {}: {}", path.display(), e),
            })?;

        // SAFETY: the mapping is only accessed through volatile 32-bit reads
        // and writes under `map`'s lock, and it lives as long as `self`.
        #[allow(unsafe_code)]
        let map = unsafe { MmapOptions::new().len(REGISTER_SPACE_BYTES).map_mut(&file) }.map_err(|e| {
            Ap235Error::HardwareFault {
                status: ApStatus::OutOfMemory,
                operation: format!("mmap {}: {}", path.display(), e),
            }
        })?;

        info!(path = %path.display(), "Mapped AP235 register space");
        Ok(Self {
            path: path.to_path_buf(),
            map: Mutex::new(map),
        })
    }

    /// Path the registers were mapped from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_offset(offset: u32) -> Result<usize> {
        let offset = offset as usize;
        if offset % 4 != 0 || offset + 4 > REGISTER_SPACE_BYTES {
            return Err(Ap235Error::invalid_argument(format!(
                "register offset {:#x} is unaligned or outside the register space",
                offset
            )));
        }
        Ok(offset)
    }
}

impl RegisterIo for MappedRegisters {
    fn read_register(&self, offset: u32) -> Result<u32> {
        let offset = Self::check_offset(offset)?;
        let map = self.map.lock();
        // SAFETY: offset is 4-byte aligned and inside the mapping.
        #[allow(unsafe_code)]
        let value = unsafe { std::ptr::read_volatile(map.as_ptr().add(offset).cast::<u32>()) };
        Ok(value)
    }

    fn write_register(&self, offset: u32, value: u32) -> Result<()> {
        let offset = Self::check_offset(offset)?;
        let mut map = self.map.lock();
        // SAFETY: offset is 4-byte aligned and inside the mapping.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::write_volatile(map.as_mut_ptr().add(offset).cast::<u32>(), value);
        }
        Ok(())
    }
}
