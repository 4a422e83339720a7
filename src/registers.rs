//! AP235 register map.
//!
//! Offsets are byte offsets from the start of the board's memory space
//! (BAR 0). The map is split into the AXI central DMA block, the PCIe
//! bridge translation registers, the AXI interrupt controller, the XADC
//! system monitor, identification registers, the scatter-gather descriptor
//! RAM and the DAC block with one register group per channel.

use bitflags::bitflags;

/// DAC channels per board.
pub const CHANNEL_COUNT: usize = 16;

/// Samples of sample memory reserved for each channel.
pub const MAX_SAMPLES: usize = 4096;

/// Largest single DMA transfer, in samples (half a channel's sample memory).
pub const MAX_TRANSFER_SAMPLES: usize = MAX_SAMPLES / 2;

/// Boards the carrier library can address at once.
pub const MAX_BOARDS: usize = 5;

/// Size of the memory-mapped register space.
pub const REGISTER_SPACE_BYTES: usize = 0x8_0000;

// AXI central DMA
/// CDMA control register.
pub const CDMA_CONTROL: u32 = 0x0000;
/// CDMA status register.
pub const CDMA_STATUS: u32 = 0x0004;
/// Current descriptor pointer, low word.
pub const CDMA_CURRENT_DESCRIPTOR: u32 = 0x0008;
/// Current descriptor pointer, high word.
pub const CDMA_CURRENT_DESCRIPTOR_HI: u32 = 0x000C;
/// Tail descriptor pointer, low word. Writing it starts a transfer.
pub const CDMA_TAIL_DESCRIPTOR: u32 = 0x0010;
/// Tail descriptor pointer, high word.
pub const CDMA_TAIL_DESCRIPTOR_HI: u32 = 0x0014;

// PCIe bridge address translation for AXI BAR 0
/// Upper 32 bits of the host address AXI BAR 0 maps onto.
pub const AXIBAR2PCIEBAR_0U: u32 = 0x1208;
/// Lower 32 bits of the host address AXI BAR 0 maps onto.
pub const AXIBAR2PCIEBAR_0L: u32 = 0x120C;

// AXI interrupt controller
/// Raw interrupt status.
pub const INTERRUPT_STATUS: u32 = 0x2000;
/// Status masked by the enable register.
pub const INTERRUPT_PENDING: u32 = 0x2004;
/// Interrupt enable.
pub const INTERRUPT_ENABLE: u32 = 0x2008;
/// Write-one-to-clear acknowledge.
pub const INTERRUPT_ACKNOWLEDGE: u32 = 0x200C;
/// Set bits in the enable register.
pub const INTERRUPT_SET_ENABLE: u32 = 0x2010;
/// Clear bits in the enable register.
pub const INTERRUPT_CLEAR_ENABLE: u32 = 0x2014;
/// Master IRQ and hardware interrupt enable.
pub const MASTER_ENABLE: u32 = 0x201C;

/// Master enable value: master IRQ enable and hardware interrupt enable.
pub const MASTER_IRQ_ENABLE: u32 = 0x3;
/// Master enable value: everything off.
pub const MASTER_IRQ_DISABLE: u32 = 0x0;
/// Interrupt controller bit for the CDMA.
pub const DMA_INTERRUPT: u32 = 1 << 16;
/// Interrupt controller bits for the sixteen DAC channels.
pub const DAC_INTERRUPTS: u32 = 0xFFFF;
/// Every source the interrupt controller knows about.
pub const ALL_INTERRUPTS: u32 = DAC_INTERRUPTS | DMA_INTERRUPT;

// XADC system monitor
/// Die temperature, current.
pub const XADC_TEMPERATURE: u32 = 0x3200;
/// VCCINT, current.
pub const XADC_VCCINT: u32 = 0x3204;
/// VCCAUX, current.
pub const XADC_VCCAUX: u32 = 0x3208;
/// Die temperature, maximum since power-up.
pub const XADC_MAX_TEMPERATURE: u32 = 0x3280;
/// VCCINT, maximum.
pub const XADC_MAX_VCCINT: u32 = 0x3284;
/// VCCAUX, maximum.
pub const XADC_MAX_VCCAUX: u32 = 0x3288;
/// Die temperature, minimum since power-up.
pub const XADC_MIN_TEMPERATURE: u32 = 0x3290;
/// VCCINT, minimum.
pub const XADC_MIN_VCCINT: u32 = 0x3294;
/// VCCAUX, minimum.
pub const XADC_MIN_VCCAUX: u32 = 0x3298;

// Identification
/// Firmware revision.
pub const FIRMWARE_REVISION: u32 = 0x4000;
/// Carrier location, bits 7:0.
pub const LOCATION: u32 = 0x6000;

// Scatter-gather descriptor RAM
/// Base of the descriptor block RAM, in both BAR and AXI address space.
pub const DESCRIPTOR_RAM_BASE: u32 = 0xA000;
/// Bytes per descriptor slot.
pub const DESCRIPTOR_STRIDE: u32 = 0x40;
/// Descriptor slots, two per channel.
pub const DESCRIPTOR_SLOTS: usize = CHANNEL_COUNT * 2;

/// Descriptor word offsets within a slot.
pub mod descriptor_field {
    /// Next descriptor pointer, low word.
    pub const NEXT: u32 = 0x00;
    /// Next descriptor pointer, high word.
    pub const NEXT_HI: u32 = 0x04;
    /// Source address, low word.
    pub const SOURCE: u32 = 0x08;
    /// Source address, high word.
    pub const SOURCE_HI: u32 = 0x0C;
    /// Destination address, low word.
    pub const DESTINATION: u32 = 0x10;
    /// Destination address, high word.
    pub const DESTINATION_HI: u32 = 0x14;
    /// Bytes to transfer.
    pub const CONTROL: u32 = 0x18;
    /// Transfer status word; zero means not yet completed.
    pub const STATUS: u32 = 0x1C;
}

/// AXI address at which host memory (through translation register 0) appears.
pub const AXIBAR_0: u32 = 0x8_0000;

// DAC block
/// Base of the per-channel register groups.
pub const DAC_BASE: u32 = 0x4_0000;
/// Bytes per channel register group.
pub const DAC_STRIDE: u32 = 0x20;

/// Registers in each channel's group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRegister {
    /// First sample-memory address of the channel FIFO.
    StartAddress,
    /// Last sample-memory address of the channel FIFO.
    EndAddress,
    /// FIFO write port; DMA key-hole destination.
    Fifo,
    /// Operating mode and trigger source.
    Control,
    /// FIFO status; writing bit 3 sets underflow-clear.
    Status,
    /// DAC command/data port.
    DirectAccess,
}

impl ChannelRegister {
    fn offset(self) -> u32 {
        match self {
            Self::StartAddress => 0x00,
            Self::EndAddress => 0x04,
            Self::Fifo => 0x08,
            Self::Control => 0x10,
            Self::Status => 0x14,
            Self::DirectAccess => 0x18,
        }
    }
}

/// Byte offset of a channel register.
pub fn channel_register(channel: usize, register: ChannelRegister) -> u32 {
    DAC_BASE + channel as u32 * DAC_STRIDE + register.offset()
}

/// Board-wide control register.
pub const COMMON_CONTROL: u32 = 0x4_0200;
/// Timer divider; one tick is 32 ns.
pub const TIMER_DIVIDER: u32 = 0x4_0204;
/// Writing 1 latches all simultaneous-mode channels.
pub const SOFTWARE_TRIGGER: u32 = 0x4_0208;

/// DAC direct-access commands, placed in bits 19:16 of the command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DacCommand {
    /// Load the input register; output changes on the next software trigger.
    SimultaneousWrite = 0x1,
    /// Update the output from the input register.
    Update = 0x2,
    /// Load and update in one step.
    TransparentWrite = 0x3,
    /// Write the DAC control word.
    WriteControl = 0x4,
    /// Clear output data.
    DataReset = 0x7,
    /// Clear output data and configuration.
    FullReset = 0xF,
}

impl DacCommand {
    /// Command word carrying `data` in its low 16 bits.
    pub fn word(self, data: u32) -> u32 {
        ((self as u32) << 16) | (data & 0xFFFF)
    }
}

bitflags! {
    /// Common Control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommonControl: u32 {
        /// Drain the channel FIFOs at the trigger rate.
        const WAVEFORM_ENABLE = 1 << 0;
        /// Reset every DAC.
        const DAC_RESET = 1 << 2;
        /// External trigger line is an output when set.
        const TRIGGER_DIRECTION = 1 << 3;
        /// Drive every DAC to its configured clear voltage.
        const DAC_CLEAR = 1 << 4;
        /// Return the board logic to its power-up state.
        const SOFTWARE_RESET = 1 << 5;
    }
}

bitflags! {
    /// CDMA control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CdmaControl: u32 {
        /// Transfers run until the tail descriptor pointer is reached.
        const TAIL_POINTER = 1 << 1;
        /// Engine reset; reads back set while the reset is in progress.
        const RESET = 1 << 2;
        /// Scatter-gather mode.
        const SCATTER_GATHER = 1 << 3;
        /// Fixed destination address.
        const KEY_HOLE_WRITE = 1 << 5;
        /// Cyclic buffer-descriptor mode.
        const CYCLIC = 1 << 6;
        /// Interrupt on completion.
        const IOC_IRQ = 1 << 12;
        /// Interrupt on delay timer.
        const DELAY_IRQ = 1 << 13;
        /// Interrupt on error.
        const ERROR_IRQ = 1 << 14;
    }
}

impl CdmaControl {
    /// Shift of the interrupt threshold field.
    pub const THRESHOLD_SHIFT: u32 = 16;

    /// Raw control word with an interrupt threshold of `descriptors`.
    pub fn with_threshold(self, descriptors: usize) -> u32 {
        self.bits() | (((descriptors as u32) & 0xFF) << Self::THRESHOLD_SHIFT)
    }
}

bitflags! {
    /// CDMA status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CdmaStatus: u32 {
        /// Engine idle.
        const IDLE = 1 << 1;
        /// Scatter-gather descriptors are supported.
        const SG_INCLUDED = 1 << 3;
        /// Internal error.
        const INTERNAL_ERROR = 1 << 4;
        /// Slave error.
        const SLAVE_ERROR = 1 << 5;
        /// Decode error.
        const DECODE_ERROR = 1 << 6;
        /// Descriptor fetch internal error.
        const SG_INTERNAL_ERROR = 1 << 8;
        /// Descriptor fetch slave error.
        const SG_SLAVE_ERROR = 1 << 9;
        /// Descriptor fetch decode error.
        const SG_DECODE_ERROR = 1 << 10;
        /// Completion interrupt latched.
        const IOC_IRQ = 1 << 12;
        /// Error interrupt latched.
        const ERROR_IRQ = 1 << 14;
    }
}

impl CdmaStatus {
    /// Any transfer or descriptor error.
    pub const ERRORS: CdmaStatus = CdmaStatus::INTERNAL_ERROR
        .union(CdmaStatus::SLAVE_ERROR)
        .union(CdmaStatus::DECODE_ERROR)
        .union(CdmaStatus::SG_INTERNAL_ERROR)
        .union(CdmaStatus::SG_SLAVE_ERROR)
        .union(CdmaStatus::SG_DECODE_ERROR);
}

bitflags! {
    /// Channel Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelStatusBits: u32 {
        /// FIFO empty.
        const FIFO_EMPTY = 1 << 0;
        /// FIFO at or below half full.
        const FIFO_HALF_FULL = 1 << 1;
        /// FIFO full.
        const FIFO_FULL = 1 << 2;
        /// FIFO ran dry while draining. Writing this bit selects underflow-clear.
        const FIFO_UNDERFLOW = 1 << 3;
        /// Single burst played out.
        const BURST_COMPLETE = 1 << 4;
        /// DAC busy.
        const BUSY = 1 << 5;
    }
}
