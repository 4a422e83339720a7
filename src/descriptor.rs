//! Scatter-gather descriptor ring.
//!
//! Every channel owns two descriptor slots in the board's descriptor RAM,
//! a ping half and a pong half. While a channel streams, exactly one half
//! is owned by the hardware (queued or draining into the FIFO) and the
//! other belongs to software, which refills it on the channel's next
//! half-full interrupt.
//!
//! Planning a DMA pass is pure: [`DescriptorChain::plan_pass`] takes the
//! current ownership and the next sample block of each serviced channel and
//! returns a [`ChainPass`] without touching hardware. The pass is written
//! with [`ChainPass::write_to`] and recorded with [`DescriptorChain::commit`].

use tracing::trace;

use crate::buffer::{Block, SampleMemory};
use crate::error::{Ap235Error, Result};
use crate::io::RegisterIo;
use crate::registers::{
    channel_register, descriptor_field, ChannelRegister, AXIBAR_0, CHANNEL_COUNT, DESCRIPTOR_RAM_BASE,
    DESCRIPTOR_SLOTS, DESCRIPTOR_STRIDE,
};

/// One of a channel's two descriptor slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    /// First slot.
    Ping,
    /// Second slot.
    Pong,
}

impl Half {
    /// The opposite half.
    pub fn other(self) -> Self {
        match self {
            Self::Ping => Self::Pong,
            Self::Pong => Self::Ping,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Ping => 0,
            Self::Pong => 1,
        }
    }
}

/// Who may touch a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Owner {
    /// Free for software to fill.
    #[default]
    Software,
    /// Queued to or being processed by the DMA engine.
    Hardware,
}

/// One scatter-gather transfer descriptor, in AXI addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    /// Address of the next descriptor.
    pub next: u32,
    /// Source address (host memory through AXI BAR 0).
    pub source: u32,
    /// Destination address (a channel FIFO register).
    pub destination: u32,
    /// Bytes to transfer.
    pub byte_count: u32,
    /// Completion status; zero until the engine finishes the descriptor.
    pub status: u32,
}

/// Descriptor slot index for a channel half.
pub fn slot(channel: usize, half: Half) -> usize {
    channel * 2 + half.index()
}

/// AXI address of a descriptor slot.
pub fn slot_address(slot: usize) -> u32 {
    DESCRIPTOR_RAM_BASE + slot as u32 * DESCRIPTOR_STRIDE
}

/// One descriptor in a planned pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassEntry {
    /// Channel served.
    pub channel: usize,
    /// Half filled.
    pub half: Half,
    /// Slot index.
    pub slot: usize,
    /// Sample run transferred.
    pub block: Block,
    /// Descriptor contents.
    pub descriptor: Descriptor,
}

/// A planned DMA pass: the descriptors to write, in chain order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainPass {
    entries: Vec<PassEntry>,
}

impl ChainPass {
    /// Descriptors in chain order.
    pub fn entries(&self) -> &[PassEntry] {
        &self.entries
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing needs transferring.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Address for the current descriptor pointer.
    pub fn first_address(&self) -> Option<u32> {
        self.entries.first().map(|e| slot_address(e.slot))
    }

    /// Address for the tail descriptor pointer.
    pub fn tail_address(&self) -> Option<u32> {
        self.entries.last().map(|e| slot_address(e.slot))
    }

    /// Channels served, one bit per channel.
    pub fn channel_mask(&self) -> u32 {
        self.entries.iter().fold(0, |mask, e| mask | 1 << e.channel)
    }

    /// Write every descriptor of the pass into descriptor RAM, status zeroed.
    pub fn write_to(&self, io: &dyn RegisterIo) -> Result<()> {
        for entry in &self.entries {
            let base = slot_address(entry.slot);
            let d = &entry.descriptor;
            io.write_register(base + descriptor_field::NEXT, d.next)?;
            io.write_register(base + descriptor_field::NEXT_HI, 0)?;
            io.write_register(base + descriptor_field::SOURCE, d.source)?;
            io.write_register(base + descriptor_field::SOURCE_HI, 0)?;
            io.write_register(base + descriptor_field::DESTINATION, d.destination)?;
            io.write_register(base + descriptor_field::DESTINATION_HI, 0)?;
            io.write_register(base + descriptor_field::CONTROL, d.byte_count)?;
            io.write_register(base + descriptor_field::STATUS, 0)?;
            trace!(
                channel = entry.channel,
                slot = entry.slot,
                start = entry.block.start,
                len = entry.block.len,
                "Wrote descriptor"
            );
        }
        Ok(())
    }
}

/// Ownership and contents of all descriptor slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    descriptors: [Descriptor; DESCRIPTOR_SLOTS],
    owners: [[Owner; 2]; CHANNEL_COUNT],
    active: u32,
}

impl DescriptorChain {
    /// Empty chain serving the channels in `active`.
    pub fn new(active: u32) -> Self {
        Self {
            descriptors: [Descriptor::default(); DESCRIPTOR_SLOTS],
            owners: [[Owner::Software; 2]; CHANNEL_COUNT],
            active,
        }
    }

    /// Channels in the chain, one bit per channel.
    pub fn active_mask(&self) -> u32 {
        self.active
    }

    /// Owner of a channel half.
    pub fn owner(&self, channel: usize, half: Half) -> Owner {
        self.owners[channel][half.index()]
    }

    /// The half currently owned by hardware, if any.
    pub fn hardware_half(&self, channel: usize) -> Option<Half> {
        [Half::Ping, Half::Pong]
            .into_iter()
            .find(|&h| self.owner(channel, h) == Owner::Hardware)
    }

    /// Last committed contents of a slot.
    pub fn descriptor(&self, slot: usize) -> Option<&Descriptor> {
        self.descriptors.get(slot)
    }

    /// Plan a pass serving `channels`, using `blocks[ch]` as each channel's
    /// next run of samples. Each channel gets the half it does not have in
    /// hardware; the first pass uses the ping halves.
    pub fn plan_pass(&self, channels: u32, blocks: &[Option<Block>; CHANNEL_COUNT]) -> Result<ChainPass> {
        let stray = channels & !self.active;
        if stray != 0 {
            return Err(Ap235Error::invalid_state(format!(
                "channels {:#06x} are not part of the descriptor chain",
                stray
            )));
        }

        let mut entries = Vec::new();
        for channel in (0..CHANNEL_COUNT).filter(|ch| channels & (1 << ch) != 0) {
            let block = blocks[channel].ok_or_else(|| {
                Ap235Error::invalid_state(format!("channel {} has no samples to transfer", channel))
            })?;
            let half = match self.hardware_half(channel) {
                Some(h) => h.other(),
                None => Half::Ping,
            };
            let slot = slot(channel, half);
            entries.push(PassEntry {
                channel,
                half,
                slot,
                block,
                descriptor: Descriptor {
                    next: 0,
                    source: AXIBAR_0 + SampleMemory::byte_offset(channel, block.start),
                    destination: channel_register(channel, ChannelRegister::Fifo),
                    byte_count: (block.len * std::mem::size_of::<u16>()) as u32,
                    status: 0,
                },
            });
        }

        let addresses: Vec<u32> = entries.iter().map(|e| slot_address(e.slot)).collect();
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.descriptor.next = addresses.get(i + 1).copied().unwrap_or(addresses[i]);
        }

        Ok(ChainPass { entries })
    }

    /// Record that `pass` has been handed to the hardware: each served
    /// half becomes hardware-owned and its sibling returns to software.
    pub fn commit(&mut self, pass: &ChainPass) {
        for entry in &pass.entries {
            self.descriptors[entry.slot] = entry.descriptor;
            self.owners[entry.channel][entry.half.index()] = Owner::Hardware;
            self.owners[entry.channel][entry.half.other().index()] = Owner::Software;
        }
    }

    /// Verify that no channel has both halves in hardware and that
    /// channels outside the chain own nothing.
    pub fn check(&self) -> Result<()> {
        for (channel, owners) in self.owners.iter().enumerate() {
            let in_hardware = owners.iter().filter(|&&o| o == Owner::Hardware).count();
            let active = self.active & (1 << channel) != 0;
            if in_hardware > 1 || (!active && in_hardware > 0) {
                return Err(Ap235Error::invalid_state(format!(
                    "descriptor ownership corrupted on channel {}",
                    channel
                )));
            }
        }
        Ok(())
    }
}
