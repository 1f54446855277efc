//! xHCI register offsets and bit definitions (xHCI 1.2, chapter 5).

// =============================================================================
// Capability registers (BAR0)
// =============================================================================

/// CAPLENGTH in bits 7:0, HCIVERSION in bits 31:16.
pub const CAP_CAPLENGTH: usize = 0x00;
pub const CAP_HCSPARAMS1: usize = 0x04;
pub const CAP_HCSPARAMS2: usize = 0x08;
pub const CAP_HCCPARAMS1: usize = 0x10;
pub const CAP_DBOFF: usize = 0x14;
pub const CAP_RTSOFF: usize = 0x18;

/// 64-byte contexts.
pub const HCCPARAMS1_CSZ: u32 = 1 << 2;

// =============================================================================
// Operational registers (BAR0 + CAPLENGTH)
// =============================================================================

pub const OP_USBCMD: usize = 0x00;
pub const OP_USBSTS: usize = 0x04;
pub const OP_PAGESIZE: usize = 0x08;
pub const OP_CRCR: usize = 0x18;
pub const OP_DCBAAP: usize = 0x30;
pub const OP_CONFIG: usize = 0x38;
pub const OP_PORTSC_BASE: usize = 0x400;
pub const OP_PORTSC_STRIDE: usize = 0x10;

pub const USBCMD_RS: u32 = 1 << 0;
pub const USBCMD_HCRST: u32 = 1 << 1;
pub const USBCMD_INTE: u32 = 1 << 2;

pub const USBSTS_HCH: u32 = 1 << 0;
pub const USBSTS_HSE: u32 = 1 << 2;
pub const USBSTS_EINT: u32 = 1 << 3;
pub const USBSTS_PCD: u32 = 1 << 4;
pub const USBSTS_CNR: u32 = 1 << 11;

/// Ring Cycle State.
pub const CRCR_RCS: u64 = 1 << 0;

pub const PORTSC_CCS: u32 = 1 << 0;
pub const PORTSC_PED: u32 = 1 << 1;
pub const PORTSC_PR: u32 = 1 << 4;
pub const PORTSC_PP: u32 = 1 << 9;
pub const PORTSC_SPEED_SHIFT: u32 = 10;
pub const PORTSC_SPEED_MASK: u32 = 0xF << PORTSC_SPEED_SHIFT;
pub const PORTSC_CSC: u32 = 1 << 17;
pub const PORTSC_PEC: u32 = 1 << 18;
pub const PORTSC_WRC: u32 = 1 << 19;
pub const PORTSC_OCC: u32 = 1 << 20;
pub const PORTSC_PRC: u32 = 1 << 21;
pub const PORTSC_PLC: u32 = 1 << 22;
pub const PORTSC_CEC: u32 = 1 << 23;
/// Write-1-to-clear change bits.
pub const PORTSC_CHANGE_BITS: u32 =
    PORTSC_CSC | PORTSC_PEC | PORTSC_WRC | PORTSC_OCC | PORTSC_PRC | PORTSC_PLC | PORTSC_CEC;
/// RW bits that must be written back unchanged; PED is RW1C and excluded.
pub const PORTSC_PRESERVE: u32 = PORTSC_PP;

// =============================================================================
// Runtime registers (BAR0 + RTSOFF), interrupter 0
// =============================================================================

pub const IR0_IMAN: usize = 0x20;
pub const IR0_IMOD: usize = 0x24;
pub const IR0_ERSTSZ: usize = 0x28;
pub const IR0_ERSTBA: usize = 0x30;
pub const IR0_ERDP: usize = 0x38;

pub const IMAN_IP: u32 = 1 << 0;
pub const IMAN_IE: u32 = 1 << 1;
/// Event Handler Busy, write 1 to clear.
pub const ERDP_EHB: u64 = 1 << 3;
/// 1 ms at 250 ns granularity.
pub const IMOD_DEFAULT: u32 = 4000;

// =============================================================================
// Tunables
// =============================================================================

pub const MAX_SLOTS: usize = 16;
pub const MAX_PORTS: usize = 16;
pub const CMD_RING_SIZE: usize = 64;
pub const EVT_RING_SIZE: usize = 64;
pub const XFER_RING_SIZE: usize = 32;

pub const HALT_TIMEOUT_MS: u64 = 20;
pub const RESET_TIMEOUT_MS: u64 = 1000;
pub const COMMAND_TIMEOUT_MS: u64 = 100;
pub const TRANSFER_TIMEOUT_MS: u64 = 500;
pub const PORT_RESET_TIMEOUT_MS: u64 = 100;

/// Boot-protocol reports are at most 8 bytes; a full packet fits in 64.
pub const REPORT_BUFFER_SIZE: usize = 64;
pub const CONTROL_BUFFER_SIZE: usize = 512;

// =============================================================================
// Port speeds (PORTSC bits 13:10)
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum UsbSpeed {
    #[default]
    Unknown = 0,
    Full = 1,
    Low = 2,
    High = 3,
    Super = 4,
}

impl UsbSpeed {
    pub const fn from_portsc(portsc: u32) -> Self {
        match (portsc & PORTSC_SPEED_MASK) >> PORTSC_SPEED_SHIFT {
            1 => Self::Full,
            2 => Self::Low,
            3 => Self::High,
            4 => Self::Super,
            _ => Self::Unknown,
        }
    }

    /// EP0 max packet size before the device descriptor is read.
    pub const fn default_ep0_max_packet(self) -> u16 {
        match self {
            Self::Low => 8,
            Self::Super => 512,
            _ => 64,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Full => "full-speed",
            Self::Low => "low-speed",
            Self::High => "high-speed",
            Self::Super => "SuperSpeed",
            Self::Unknown => "unknown-speed",
        }
    }
}
