//! Register map, bit definitions and the supported-device table for the
//! 8254x (E1000) and ICH/PCH (E1000E) families.

// =============================================================================
// Registers
// =============================================================================

pub const REG_CTRL: usize = 0x0000;
pub const REG_STATUS: usize = 0x0008;
pub const REG_EERD: usize = 0x0014;
pub const REG_MDIC: usize = 0x0020;
/// Interrupt cause, cleared on read.
pub const REG_ICR: usize = 0x00C0;
pub const REG_IMS: usize = 0x00D0;
pub const REG_IMC: usize = 0x00D8;
pub const REG_RCTL: usize = 0x0100;
pub const REG_TCTL: usize = 0x0400;
pub const REG_TIPG: usize = 0x0410;
pub const REG_EXTCNF_CTRL: usize = 0x0F00;
pub const REG_RDBAL: usize = 0x2800;
pub const REG_RDBAH: usize = 0x2804;
pub const REG_RDLEN: usize = 0x2808;
pub const REG_RDH: usize = 0x2810;
pub const REG_RDT: usize = 0x2818;
pub const REG_TDBAL: usize = 0x3800;
pub const REG_TDBAH: usize = 0x3804;
pub const REG_TDLEN: usize = 0x3808;
pub const REG_TDH: usize = 0x3810;
pub const REG_TDT: usize = 0x3818;
/// Multicast table array, 128 dwords.
pub const REG_MTA: usize = 0x5200;
pub const MTA_ENTRIES: usize = 128;
pub const REG_RAL: usize = 0x5400;
pub const REG_RAH: usize = 0x5404;
pub const REG_SWSM: usize = 0x5B50;

// =============================================================================
// Bits
// =============================================================================

pub const CTRL_LRST: u32 = 1 << 3;
pub const CTRL_SLU: u32 = 1 << 6;
pub const CTRL_ILOS: u32 = 1 << 7;
pub const CTRL_FRCSPD: u32 = 1 << 11;
pub const CTRL_FRCDPLX: u32 = 1 << 12;
pub const CTRL_RST: u32 = 1 << 26;
pub const CTRL_PHY_RST: u32 = 1 << 31;

pub const STATUS_LU: u32 = 1 << 1;

pub const MDIC_DATA_MASK: u32 = 0xFFFF;
pub const MDIC_REG_SHIFT: u32 = 16;
pub const MDIC_PHY_SHIFT: u32 = 21;
pub const MDIC_OP_WRITE: u32 = 1 << 26;
pub const MDIC_OP_READ: u32 = 2 << 26;
pub const MDIC_READY: u32 = 1 << 28;
pub const MDIC_ERROR: u32 = 1 << 30;
/// Internal PHY address.
pub const PHY_ADDR: u32 = 1;

pub const PHY_CONTROL: u32 = 0x00;
pub const PHY_AUTONEG_ADV: u32 = 0x04;
pub const PHY_1000T_CTRL: u32 = 0x09;
pub const PHY_CTRL_RESET: u16 = 1 << 15;
pub const PHY_CTRL_AUTONEG_EN: u16 = 1 << 12;
pub const PHY_CTRL_RESTART_AN: u16 = 1 << 9;
/// 10/100 half and full duplex.
pub const PHY_ANAR_10_100: u16 = (1 << 5) | (1 << 6) | (1 << 7) | (1 << 8);
/// 1000BASE-T half and full duplex.
pub const PHY_GBCR_1000: u16 = (1 << 8) | (1 << 9);

pub const SWSM_SMBI: u32 = 1 << 0;
pub const EXTCNF_CTRL_SWFLAG: u32 = 1 << 5;

pub const RCTL_EN: u32 = 1 << 1;
pub const RCTL_BAM: u32 = 1 << 15;
/// 4096 with BSEX.
pub const RCTL_BSIZE_4096: u32 = 3 << 16;
pub const RCTL_BSEX: u32 = 1 << 25;
pub const RCTL_SECRC: u32 = 1 << 26;

pub const TCTL_EN: u32 = 1 << 1;
pub const TCTL_PSP: u32 = 1 << 3;
pub const TCTL_CT_SHIFT: u32 = 4;
pub const TCTL_COLD_SHIFT: u32 = 12;
pub const TIPG_DEFAULT: u32 = 10 | (10 << 10) | (10 << 20);

pub const ICR_TXDW: u32 = 1 << 0;
pub const ICR_TXQE: u32 = 1 << 1;
pub const ICR_LSC: u32 = 1 << 2;
pub const ICR_RXDMT0: u32 = 1 << 4;
pub const ICR_RXO: u32 = 1 << 6;
pub const ICR_RXT0: u32 = 1 << 7;
pub const IMS_DEFAULT: u32 = ICR_RXT0 | ICR_TXDW | ICR_TXQE | ICR_LSC | ICR_RXDMT0;

pub const RAH_AV: u32 = 1 << 31;

pub const TXCMD_EOP: u8 = 1 << 0;
pub const TXCMD_IFCS: u8 = 1 << 1;
pub const TXCMD_RS: u8 = 1 << 3;
pub const TXSTA_DD: u8 = 1 << 0;
pub const RXSTA_DD: u8 = 1 << 0;
pub const RXSTA_EOP: u8 = 1 << 1;

// =============================================================================
// Tunables
// =============================================================================

pub const RX_DESC_COUNT: usize = 32;
pub const TX_DESC_COUNT: usize = 32;
pub const PACKET_BUFFER_SIZE: usize = 8192;
pub const DESC_SIZE: usize = 16;

pub const SEMAPHORE_ATTEMPTS: u32 = 2000;
pub const RESET_SETTLE_US: u64 = 1_000;
pub const RESET_TIMEOUT_MS: u64 = 10;
pub const MDIC_TIMEOUT_MS: u64 = 10;
pub const PHY_RESET_TIMEOUT_MS: u64 = 100;
pub const EEPROM_TIMEOUT_MS: u64 = 10;

// =============================================================================
// Supported devices
// =============================================================================

/// Register-compatible families that differ in EEPROM access and firmware handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NicVariant {
    /// 8254x: EERD address at bit 8, done at bit 4, no ME semaphore.
    E1000,
    /// I217/I218/I219 PCH parts: EERD address at bit 2, done at bit 1.
    E1000e,
}

impl NicVariant {
    #[inline]
    pub const fn eerd_request(self, word: u8) -> u32 {
        match self {
            Self::E1000 => ((word as u32) << 8) | 1,
            Self::E1000e => ((word as u32) << 2) | 1,
        }
    }

    #[inline]
    pub const fn eerd_done(self) -> u32 {
        match self {
            Self::E1000 => 1 << 4,
            Self::E1000e => 1 << 1,
        }
    }

    /// Whether the management engine may own the PHY and needs the SW/FW handshake.
    #[inline]
    pub const fn has_fw_semaphore(self) -> bool {
        matches!(self, Self::E1000e)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SupportedNic {
    pub device_id: u16,
    pub name: &'static str,
    pub variant: NicVariant,
}

const fn nic(device_id: u16, name: &'static str, variant: NicVariant) -> SupportedNic {
    SupportedNic {
        device_id,
        name,
        variant,
    }
}

use NicVariant::{E1000, E1000e};

pub static SUPPORTED_NICS: &[SupportedNic] = &[
    nic(0x100E, "82540EM", E1000),
    nic(0x10D3, "82574L", E1000),
    nic(0x153A, "I217-LM", E1000e),
    nic(0x153B, "I217-V", E1000e),
    nic(0x155A, "I218-LM", E1000e),
    nic(0x1559, "I218-V", E1000e),
    nic(0x15A0, "I218-LM (2)", E1000e),
    nic(0x15A1, "I218-V (2)", E1000e),
    nic(0x15A2, "I218-LM (3)", E1000e),
    nic(0x15A3, "I218-V (3)", E1000e),
    nic(0x156F, "I219-LM", E1000e),
    nic(0x15B7, "I219-LM (2)", E1000e),
    nic(0x15BB, "I219-LM (3)", E1000e),
    nic(0x15BD, "I219-LM (4)", E1000e),
    nic(0x15DF, "I219-LM (5)", E1000e),
    nic(0x15E1, "I219-LM (6)", E1000e),
    nic(0x15E3, "I219-LM (7)", E1000e),
    nic(0x15D7, "I219-LM (8)", E1000e),
    nic(0x0D4C, "I219-LM (9)", E1000e),
    nic(0x0D4E, "I219-LM (10)", E1000e),
    nic(0x0D53, "I219-LM (11)", E1000e),
    nic(0x0D55, "I219-LM (12)", E1000e),
    nic(0x0DC5, "I219-LM (13)", E1000e),
    nic(0x0DC7, "I219-LM (14)", E1000e),
    nic(0x1A1C, "I219-LM (15)", E1000e),
    nic(0x1A1E, "I219-LM (16)", E1000e),
    nic(0x1570, "I219-V", E1000e),
    nic(0x15B8, "I219-V (2)", E1000e),
    nic(0x15BC, "I219-V (3)", E1000e),
    nic(0x15BE, "I219-V (4)", E1000e),
    nic(0x15E0, "I219-V (5)", E1000e),
    nic(0x15E2, "I219-V (6)", E1000e),
    nic(0x15D6, "I219-V (7)", E1000e),
    nic(0x15D8, "I219-V (8)", E1000e),
    nic(0x0D4D, "I219-V (9)", E1000e),
    nic(0x0D4F, "I219-V (10)", E1000e),
    nic(0x0D54, "I219-V (11)", E1000e),
    nic(0x0DC6, "I219-V (13)", E1000e),
    nic(0x0DC8, "I219-V (14)", E1000e),
    nic(0x1A1D, "I219-V (15)", E1000e),
    nic(0x1A1F, "I219-V (16)", E1000e),
];

pub fn lookup_nic(vendor_id: u16, device_id: u16) -> Option<&'static SupportedNic> {
    if vendor_id != crate::pci_defs::PCI_VENDOR_ID_INTEL {
        return None;
    }
    SUPPORTED_NICS.iter().find(|n| n.device_id == device_id)
}
