//! Sample storage for DMA.
//!
//! [`SampleMemory`] is one contiguous arena holding [`MAX_SAMPLES`]
//! straight-binary codes per channel. It is aligned to 1 MiB so that a
//! single PCIe translation window covers all of it, and it is locked into
//! physical memory for its whole lifetime so the DMA engine never reads a
//! page that has been moved or swapped out.
//!
//! [`OutputBuffer`] is the per-channel cursor into that arena: a head, a
//! current position and a tail, all plain indices that are bounds-checked
//! on every update.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calibration::{decode_straight_binary, encode_straight_binary};
use crate::channel::validate_channel;
use crate::error::{Ap235Error, ApStatus, Result};
use crate::registers::{CHANNEL_COUNT, MAX_SAMPLES};

/// Alignment of the DMA arena.
pub const ARENA_ALIGNMENT: usize = 1 << 20;

/// Bytes in the DMA arena.
pub const ARENA_BYTES: usize = CHANNEL_COUNT * MAX_SAMPLES * std::mem::size_of::<u16>();

/// What to do when the arena cannot be locked into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pinning {
    /// Fail the allocation.
    #[default]
    Required,
    /// Log a warning and continue unlocked. Only suitable when no real DMA
    /// engine reads the arena.
    BestEffort,
}

/// 1 MiB-aligned, memory-locked sample arena.
pub struct SampleMemory {
    ptr: NonNull<u16>,
    layout: Layout,
    pinned: bool,
}

// SAFETY: SampleMemory exclusively owns its allocation; shared access only
// hands out immutable slices and mutation requires &mut.
#[allow(unsafe_code)]
unsafe impl Send for SampleMemory {}
#[allow(unsafe_code)]
unsafe impl Sync for SampleMemory {}

impl SampleMemory {
    /// Allocate and zero the arena, then lock it into physical memory.
    pub fn allocate(pinning: Pinning) -> Result<Self> {
        let layout = Layout::from_size_align(ARENA_BYTES, ARENA_ALIGNMENT).map_err(|e| {
            Ap235Error::invalid_argument(format!("bad DMA arena layout: {}", e))
        })?;

        // SAFETY: layout has non-zero size.
        #[allow(unsafe_code)]
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast::<u16>()).ok_or_else(|| Ap235Error::HardwareFault {
            status: ApStatus::OutOfMemory,
            operation: "allocate DMA arena".to_string(),
        })?;

        let mut memory = Self {
            ptr,
            layout,
            pinned: false,
        };

        // SAFETY: the range is the allocation we just made.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::mlock(memory.ptr.as_ptr().cast::<libc::c_void>(), ARENA_BYTES) };
        if rc == 0 {
            memory.pinned = true;
        } else {
            let err = std::io::Error::last_os_error();
            match pinning {
                Pinning::Required => {
                    // Drop frees the allocation.
                    return Err(Ap235Error::HardwareFault {
                        status: ApStatus::OutOfMemory,
                        operation: format!("mlock DMA arena: {}", err),
                    });
                }
                Pinning::BestEffort => {
                    warn!(error = %err, "DMA arena could not be locked; continuing unpinned");
                }
            }
        }

        debug!(
            address = format_args!("{:#x}", memory.host_address()),
            bytes = ARENA_BYTES,
            pinned = memory.pinned,
            "Allocated DMA arena"
        );
        Ok(memory)
    }

    /// Whether the arena is locked into physical memory.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Host address of the start of the arena.
    pub fn host_address(&self) -> u64 {
        self.ptr.as_ptr() as usize as u64
    }

    /// Byte offset of `channel`'s sample `index` from the start of the arena.
    pub fn byte_offset(channel: usize, index: usize) -> u32 {
        ((channel * MAX_SAMPLES + index) * std::mem::size_of::<u16>()) as u32
    }

    fn as_slice(&self) -> &[u16] {
        // SAFETY: ptr points at ARENA_BYTES of initialized (zeroed) memory
        // owned by self.
        #[allow(unsafe_code)]
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr(), CHANNEL_COUNT * MAX_SAMPLES)
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u16] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        #[allow(unsafe_code)]
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), CHANNEL_COUNT * MAX_SAMPLES)
        }
    }

    /// One channel's region, as straight-binary codes.
    pub fn channel(&self, channel: usize) -> Result<&[u16]> {
        validate_channel(channel)?;
        Ok(&self.as_slice()[channel * MAX_SAMPLES..(channel + 1) * MAX_SAMPLES])
    }

    /// Store two's-complement samples at the start of a channel's region.
    pub fn store(&mut self, channel: usize, samples: &[i16]) -> Result<()> {
        validate_channel(channel)?;
        if samples.len() > MAX_SAMPLES {
            return Err(Ap235Error::invalid_argument(format!(
                "{} samples exceed the {} sample channel memory",
                samples.len(),
                MAX_SAMPLES
            )));
        }
        let region = &mut self.as_mut_slice()[channel * MAX_SAMPLES..channel * MAX_SAMPLES + samples.len()];
        for (slot, &dn) in region.iter_mut().zip(samples) {
            *slot = encode_straight_binary(dn);
        }
        Ok(())
    }

    /// Read back one sample as a two's-complement DN.
    pub fn sample(&self, channel: usize, index: usize) -> Result<i16> {
        let region = self.channel(channel)?;
        region
            .get(index)
            .map(|&code| decode_straight_binary(code))
            .ok_or_else(|| Ap235Error::invalid_argument(format!("sample index {} out of range", index)))
    }
}

impl Drop for SampleMemory {
    fn drop(&mut self) {
        if self.pinned {
            // SAFETY: the range was locked in allocate().
            #[allow(unsafe_code)]
            let rc = unsafe { libc::munlock(self.ptr.as_ptr().cast::<libc::c_void>(), ARENA_BYTES) };
            if rc != 0 {
                warn!(error = %std::io::Error::last_os_error(), "Failed to unlock DMA arena");
            }
        }
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        #[allow(unsafe_code)]
        unsafe {
            alloc::dealloc(self.ptr.as_ptr().cast::<u8>(), self.layout);
        }
    }
}

impl std::fmt::Debug for SampleMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleMemory")
            .field("address", &format_args!("{:#x}", self.host_address()))
            .field("pinned", &self.pinned)
            .finish()
    }
}

/// A contiguous run of samples inside one channel's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Index of the first sample.
    pub start: usize,
    /// Number of samples.
    pub len: usize,
}

/// Head/current/tail cursor over one channel's region of the arena.
///
/// `tail == head + sample_count` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputBuffer {
    head: usize,
    current: usize,
    tail: usize,
    sample_count: usize,
}

impl OutputBuffer {
    /// Cover `sample_count` samples from the start of the region.
    pub fn load(&mut self, sample_count: usize) -> Result<()> {
        if sample_count > MAX_SAMPLES {
            return Err(Ap235Error::invalid_argument(format!(
                "{} samples exceed the {} sample channel memory",
                sample_count, MAX_SAMPLES
            )));
        }
        self.head = 0;
        self.current = 0;
        self.sample_count = sample_count;
        self.tail = sample_count;
        Ok(())
    }

    /// Cover exactly one sample, for direct-access output.
    pub fn set_single(&mut self) {
        self.head = 0;
        self.current = 0;
        self.sample_count = 1;
        self.tail = 1;
    }

    /// Forget the contents.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Index of the first sample.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Index of the next sample to hand to the DMA engine.
    pub fn current(&self) -> usize {
        self.current
    }

    /// One past the last sample.
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Number of samples loaded.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Next run of up to `max` samples without moving the cursor.
    pub fn peek_block(&self, max: usize) -> Option<Block> {
        if self.sample_count == 0 || max == 0 {
            return None;
        }
        Some(Block {
            start: self.current,
            len: max.min(self.tail - self.current),
        })
    }

    /// Next ping/pong half. The half starting at the head is rounded down to
    /// whole 32-bit words; the other half takes the rest up to the tail, so
    /// both are even whenever the sample count is.
    pub fn next_half(&self) -> Option<Block> {
        let first = (self.sample_count / 2) & !1;
        if self.current == self.head && first > 0 {
            self.peek_block(first)
        } else {
            self.peek_block(self.tail - self.current)
        }
    }

    /// Move the cursor past `len` samples, wrapping to the head at the tail.
    pub fn advance(&mut self, len: usize) -> Result<()> {
        let remaining = self.tail - self.current;
        if len > remaining {
            return Err(Ap235Error::invalid_state(format!(
                "cannot advance {} samples with {} left before the tail",
                len, remaining
            )));
        }
        self.current += len;
        if self.current == self.tail {
            self.current = self.head;
        }
        Ok(())
    }

    /// Move the cursor back to the head.
    pub fn rewind(&mut self) {
        self.current = self.head;
    }
}
