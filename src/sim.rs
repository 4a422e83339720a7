//! In-memory AP235 used by the test suite and the `simulated` backend.
//!
//! [`SimulatedBoard`] implements [`RegisterIo`] over a sparse register file
//! and models the parts of the board the driver depends on:
//!
//! - CDMA reset reads back as in progress for a configurable number of reads
//! - writing the tail descriptor pointer walks the descriptor chain in
//!   descriptor RAM, records each transfer and raises the CDMA interrupt
//! - the interrupt controller masks status with the enable register and
//!   clears acknowledged bits
//!
//! Faults can be injected per register, and the DMA engine can be stalled
//! or made to report errors.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Ap235Error, ApStatus, Result};
use crate::io::RegisterIo;
use crate::registers::{
    channel_register, descriptor_field, CdmaControl, CdmaStatus, ChannelRegister, ChannelStatusBits,
    CDMA_CONTROL, CDMA_CURRENT_DESCRIPTOR, CDMA_STATUS, CDMA_TAIL_DESCRIPTOR, CHANNEL_COUNT,
    DESCRIPTOR_RAM_BASE, DESCRIPTOR_SLOTS, DESCRIPTOR_STRIDE, DMA_INTERRUPT, FIRMWARE_REVISION,
    INTERRUPT_ACKNOWLEDGE, INTERRUPT_CLEAR_ENABLE, INTERRUPT_ENABLE, INTERRUPT_PENDING, INTERRUPT_SET_ENABLE,
    INTERRUPT_STATUS, LOCATION, XADC_MAX_TEMPERATURE, XADC_MAX_VCCAUX, XADC_MAX_VCCINT, XADC_MIN_TEMPERATURE,
    XADC_MIN_VCCAUX, XADC_MIN_VCCINT, XADC_TEMPERATURE, XADC_VCCAUX, XADC_VCCINT,
};

/// One register write observed by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    /// Byte offset.
    pub offset: u32,
    /// Value written.
    pub value: u32,
}

/// One descriptor processed by the simulated CDMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTransfer {
    /// Descriptor slot index.
    pub slot: usize,
    /// Channel whose FIFO was the destination, if the destination was a FIFO.
    pub channel: Option<usize>,
    /// AXI source address.
    pub source: u32,
    /// Bytes moved.
    pub bytes: u32,
}

struct SimState {
    registers: HashMap<u32, u32>,
    writes: Vec<RegisterWrite>,
    transfers: Vec<DmaTransfer>,
    faults: HashMap<u32, ApStatus>,
    interrupt_status: u32,
    reset_latency: u32,
    reset_reads_left: u32,
    reset_stuck: bool,
    dma_stalled: bool,
    dma_error: CdmaStatus,
}

impl SimState {
    fn get(&self, offset: u32) -> u32 {
        self.registers.get(&offset).copied().unwrap_or(0)
    }

    fn set(&mut self, offset: u32, value: u32) {
        self.registers.insert(offset, value);
    }

    fn fault(&self, offset: u32, access: &str) -> Result<()> {
        match self.faults.get(&offset) {
            Some(&status) => Err(Ap235Error::HardwareFault {
                status,
                operation: format!("{} {:#06x}", access, offset),
            }),
            None => Ok(()),
        }
    }

    fn run_chain(&mut self) {
        let control = CdmaControl::from_bits_truncate(self.get(CDMA_CONTROL));
        let mut status = CdmaStatus::from_bits_truncate(self.get(CDMA_STATUS));

        if self.dma_stalled {
            status.remove(CdmaStatus::IDLE);
            self.set(CDMA_STATUS, status.bits());
            return;
        }

        let tail = self.get(CDMA_TAIL_DESCRIPTOR);
        let mut address = self.get(CDMA_CURRENT_DESCRIPTOR);
        let mut completed = false;
        for _ in 0..=DESCRIPTOR_SLOTS {
            let Some(slot) = slot_of(address) else {
                break;
            };
            let source = self.get(address + descriptor_field::SOURCE);
            let destination = self.get(address + descriptor_field::DESTINATION);
            let bytes = self.get(address + descriptor_field::CONTROL) & 0x03FF_FFFF;
            let channel = fifo_channel(destination);
            self.transfers.push(DmaTransfer {
                slot,
                channel,
                source,
                bytes,
            });
            self.set(address + descriptor_field::STATUS, (1 << 31) | bytes);
            if let Some(ch) = channel {
                let status_reg = channel_register(ch, ChannelRegister::Status);
                let bits = self.get(status_reg) & !ChannelStatusBits::FIFO_EMPTY.bits();
                self.set(status_reg, bits);
            }
            if address == tail {
                completed = true;
                break;
            }
            address = self.get(address + descriptor_field::NEXT);
        }

        if !completed {
            status.insert(CdmaStatus::SG_DECODE_ERROR);
        }
        status.insert(self.dma_error);
        status.insert(CdmaStatus::IDLE);
        if control.contains(CdmaControl::IOC_IRQ) {
            status.insert(CdmaStatus::IOC_IRQ);
            self.interrupt_status |= DMA_INTERRUPT;
        }
        if status.intersects(CdmaStatus::ERRORS) && control.contains(CdmaControl::ERROR_IRQ) {
            status.insert(CdmaStatus::ERROR_IRQ);
            self.interrupt_status |= DMA_INTERRUPT;
        }
        self.set(CDMA_STATUS, status.bits());
        trace!(transfers = self.transfers.len(), "Simulated CDMA pass complete");
    }
}

fn slot_of(address: u32) -> Option<usize> {
    let rel = address.checked_sub(DESCRIPTOR_RAM_BASE)?;
    let slot = (rel / DESCRIPTOR_STRIDE) as usize;
    (rel % DESCRIPTOR_STRIDE == 0 && slot < DESCRIPTOR_SLOTS).then_some(slot)
}

fn fifo_channel(address: u32) -> Option<usize> {
    (0..CHANNEL_COUNT).find(|&ch| channel_register(ch, ChannelRegister::Fifo) == address)
}

/// Simulated AP235 register file.
pub struct SimulatedBoard {
    state: Mutex<SimState>,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBoard {
    /// A board in its power-up state at carrier location 0.
    pub fn new() -> Self {
        let mut registers = HashMap::new();
        registers.insert(CDMA_STATUS, (CdmaStatus::IDLE | CdmaStatus::SG_INCLUDED).bits());
        registers.insert(FIRMWARE_REVISION, 0x0002_0001);
        registers.insert(LOCATION, 0);
        // 30.0 C, 1.0 V, 1.8 V in XADC 12-bit left-justified codes
        for (reg, value) in [
            (XADC_TEMPERATURE, 0x9A00),
            (XADC_MAX_TEMPERATURE, 0x9C00),
            (XADC_MIN_TEMPERATURE, 0x9800),
            (XADC_VCCINT, 0x5550),
            (XADC_MAX_VCCINT, 0x5560),
            (XADC_MIN_VCCINT, 0x5540),
            (XADC_VCCAUX, 0x99A0),
            (XADC_MAX_VCCAUX, 0x99B0),
            (XADC_MIN_VCCAUX, 0x9990),
        ] {
            registers.insert(reg, value);
        }
        for ch in 0..CHANNEL_COUNT {
            registers.insert(
                channel_register(ch, ChannelRegister::Status),
                ChannelStatusBits::FIFO_EMPTY.bits(),
            );
        }

        Self {
            state: Mutex::new(SimState {
                registers,
                writes: Vec::new(),
                transfers: Vec::new(),
                faults: HashMap::new(),
                interrupt_status: 0,
                reset_latency: 2,
                reset_reads_left: 0,
                reset_stuck: false,
                dma_stalled: false,
                dma_error: CdmaStatus::empty(),
            }),
        }
    }

    /// Reads of the CDMA control register that report the reset still in progress.
    pub fn set_reset_latency(&self, reads: u32) {
        self.state.lock().reset_latency = reads;
    }

    /// Keep the CDMA reset bit set forever.
    pub fn set_reset_stuck(&self, stuck: bool) {
        self.state.lock().reset_stuck = stuck;
    }

    /// Leave the CDMA busy after the tail pointer is written.
    pub fn set_dma_stalled(&self, stalled: bool) {
        self.state.lock().dma_stalled = stalled;
    }

    /// Error bits the CDMA reports after each pass.
    pub fn inject_dma_error(&self, error: CdmaStatus) {
        self.state.lock().dma_error = error;
    }

    /// Fail every access to `offset` with `status`.
    pub fn fail_on(&self, offset: u32, status: ApStatus) {
        self.state.lock().faults.insert(offset, status);
    }

    /// Remove injected register faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Latch interrupt sources, as a DAC FIFO crossing half full would.
    pub fn raise_interrupt(&self, mask: u32) {
        self.state.lock().interrupt_status |= mask;
    }

    /// Register value without side effects.
    pub fn peek(&self, offset: u32) -> u32 {
        let state = self.state.lock();
        match offset {
            INTERRUPT_STATUS => state.interrupt_status,
            INTERRUPT_PENDING => state.interrupt_status & state.get(INTERRUPT_ENABLE),
            _ => state.get(offset),
        }
    }

    /// Set a register value without logging a write.
    pub fn poke(&self, offset: u32, value: u32) {
        self.state.lock().set(offset, value);
    }

    /// Every write so far, oldest first.
    pub fn write_log(&self) -> Vec<RegisterWrite> {
        self.state.lock().writes.clone()
    }

    /// Number of writes to `offset`.
    pub fn writes_to(&self, offset: u32) -> usize {
        self.state.lock().writes.iter().filter(|w| w.offset == offset).count()
    }

    /// Most recent value written to `offset`.
    pub fn last_write(&self, offset: u32) -> Option<u32> {
        self.state
            .lock()
            .writes
            .iter()
            .rev()
            .find(|w| w.offset == offset)
            .map(|w| w.value)
    }

    /// Forget the write log.
    pub fn clear_log(&self) {
        self.state.lock().writes.clear();
    }

    /// Descriptors processed so far, oldest first.
    pub fn transfers(&self) -> Vec<DmaTransfer> {
        self.state.lock().transfers.clone()
    }

    /// Forget recorded transfers.
    pub fn clear_transfers(&self) {
        self.state.lock().transfers.clear();
    }
}

impl RegisterIo for SimulatedBoard {
    fn read_register(&self, offset: u32) -> Result<u32> {
        let mut state = self.state.lock();
        state.fault(offset, "read")?;
        let value = match offset {
            CDMA_CONTROL => {
                let value = state.get(CDMA_CONTROL);
                if value & CdmaControl::RESET.bits() != 0 && !state.reset_stuck {
                    if state.reset_reads_left == 0 {
                        let cleared = value & !CdmaControl::RESET.bits();
                        state.set(CDMA_CONTROL, cleared);
                        cleared
                    } else {
                        state.reset_reads_left -= 1;
                        value
                    }
                } else {
                    value
                }
            }
            INTERRUPT_STATUS => state.interrupt_status,
            INTERRUPT_PENDING => state.interrupt_status & state.get(INTERRUPT_ENABLE),
            _ => state.get(offset),
        };
        Ok(value)
    }

    fn write_register(&self, offset: u32, value: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.fault(offset, "write")?;
        state.writes.push(RegisterWrite { offset, value });

        match offset {
            CDMA_CONTROL => {
                state.set(CDMA_CONTROL, value);
                if value & CdmaControl::RESET.bits() != 0 {
                    state.reset_reads_left = state.reset_latency;
                    state.set(CDMA_STATUS, (CdmaStatus::IDLE | CdmaStatus::SG_INCLUDED).bits());
                }
            }
            CDMA_TAIL_DESCRIPTOR => {
                state.set(offset, value);
                state.run_chain();
            }
            INTERRUPT_ACKNOWLEDGE => state.interrupt_status &= !value,
            INTERRUPT_SET_ENABLE => {
                let enable = state.get(INTERRUPT_ENABLE) | value;
                state.set(INTERRUPT_ENABLE, enable);
            }
            INTERRUPT_CLEAR_ENABLE => {
                let enable = state.get(INTERRUPT_ENABLE) & !value;
                state.set(INTERRUPT_ENABLE, enable);
            }
            INTERRUPT_STATUS | INTERRUPT_PENDING => {}
            _ => state.set(offset, value),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::PollPolicy;
    use std::time::Duration;

    #[test]
    fn test_reset_clears_after_latency() {
        let board = SimulatedBoard::new();
        board.set_reset_latency(3);
        board.write_register(CDMA_CONTROL, CdmaControl::RESET.bits()).unwrap();

        let policy = PollPolicy::new(10, Duration::ZERO);
        let reads = std::cell::Cell::new(0);
        board
            .poll_until(
                CDMA_CONTROL,
                &|v| {
                    reads.set(reads.get() + 1);
                    v & CdmaControl::RESET.bits() == 0
                },
                &policy,
                "cdma reset",
            )
            .unwrap();
        assert_eq!(reads.get(), 4);
    }

    #[test]
    fn test_stuck_reset_times_out() {
        let board = SimulatedBoard::new();
        board.set_reset_stuck(true);
        board.write_register(CDMA_CONTROL, CdmaControl::RESET.bits()).unwrap();
        let policy = PollPolicy::new(7, Duration::ZERO);
        let err = board
            .poll_until(CDMA_CONTROL, &|v| v & CdmaControl::RESET.bits() == 0, &policy, "cdma reset")
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_interrupt_masking_and_ack() {
        let board = SimulatedBoard::new();
        board.raise_interrupt(0b101);
        assert_eq!(board.read_register(INTERRUPT_PENDING).unwrap(), 0);
        board.write_register(INTERRUPT_ENABLE, 0b001).unwrap();
        assert_eq!(board.read_register(INTERRUPT_PENDING).unwrap(), 0b001);
        board.write_register(INTERRUPT_ACKNOWLEDGE, 0b001).unwrap();
        assert_eq!(board.read_register(INTERRUPT_PENDING).unwrap(), 0);
        assert_eq!(board.read_register(INTERRUPT_STATUS).unwrap(), 0b100);
    }

    #[test]
    fn test_fault_injection() {
        let board = SimulatedBoard::new();
        board.fail_on(LOCATION, ApStatus::NotInitialized);
        let err = board.read_register(LOCATION).unwrap_err();
        assert!(matches!(
            err,
            Ap235Error::HardwareFault {
                status: ApStatus::NotInitialized,
                ..
            }
        ));
        board.clear_faults();
        assert!(board.read_register(LOCATION).is_ok());
    }

    #[test]
    fn test_chain_walk_records_transfers() {
        let board = SimulatedBoard::new();
        let d0 = DESCRIPTOR_RAM_BASE;
        let d1 = DESCRIPTOR_RAM_BASE + 2 * DESCRIPTOR_STRIDE;
        for (desc, next, ch) in [(d0, d1, 0usize), (d1, d1, 1usize)] {
            board.write_register(desc + descriptor_field::NEXT, next).unwrap();
            board.write_register(desc + descriptor_field::SOURCE, 0x8_0000).unwrap();
            board
                .write_register(desc + descriptor_field::DESTINATION, channel_register(ch, ChannelRegister::Fifo))
                .unwrap();
            board.write_register(desc + descriptor_field::CONTROL, 64).unwrap();
        }
        board
            .write_register(CDMA_CONTROL, (CdmaControl::SCATTER_GATHER | CdmaControl::IOC_IRQ).bits())
            .unwrap();
        board.write_register(CDMA_CURRENT_DESCRIPTOR, d0).unwrap();
        board.write_register(CDMA_TAIL_DESCRIPTOR, d1).unwrap();

        let transfers = board.transfers();
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].channel, Some(0));
        assert_eq!(transfers[1].slot, 2);
        assert_eq!(board.peek(d1 + descriptor_field::STATUS), (1 << 31) | 64);
        assert_eq!(board.peek(INTERRUPT_STATUS) & DMA_INTERRUPT, DMA_INTERRUPT);
        let status = CdmaStatus::from_bits_truncate(board.peek(CDMA_STATUS));
        assert!(status.contains(CdmaStatus::IDLE));
        assert!(!status.intersects(CdmaStatus::ERRORS));
    }

    #[test]
    fn test_broken_chain_reports_decode_error() {
        let board = SimulatedBoard::new();
        board.write_register(CDMA_CURRENT_DESCRIPTOR, 0x1234).unwrap();
        board.write_register(CDMA_TAIL_DESCRIPTOR, DESCRIPTOR_RAM_BASE).unwrap();
        let status = CdmaStatus::from_bits_truncate(board.peek(CDMA_STATUS));
        assert!(status.contains(CdmaStatus::SG_DECODE_ERROR));
    }
}
