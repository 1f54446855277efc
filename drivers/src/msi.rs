//! MSI (Message Signaled Interrupts) for PCI functions.
//!
//! ```text
//! Offset  Size  Field
//! +0x00   8     Cap ID (0x05) | Next Pointer
//! +0x02   16    Message Control
//! +0x04   32    Message Address (lower)
//! +0x08   32    Message Address (upper), only if 64-bit capable
//! +0x08/C 16    Message Data
//! ```

use kestrel_lib::{klog_info, klog_warn};

use crate::hw::{InterruptMode, IrqRouter};
use crate::pci::ConfigAccess;
use crate::pci_defs::{PCI_COMMAND_INTX_DISABLE, PCI_COMMAND_OFFSET, PciAddress, PciDevice};

// =============================================================================
// Message Control bits
// =============================================================================

const MSI_CTRL_ENABLE: u16 = 1 << 0;
const MSI_CTRL_MMC_SHIFT: u16 = 1;
/// Multi-message enable (granted vectors, log2).
const MSI_CTRL_MME_MASK: u16 = 0x7 << 4;
const MSI_CTRL_64BIT: u16 = 1 << 7;
const MSI_CTRL_PVM: u16 = 1 << 8;

const MSI_REG_CONTROL: u16 = 0x02;
const MSI_REG_ADDR_LO: u16 = 0x04;
const MSI_REG_ADDR_HI: u16 = 0x08;
const MSI_REG_DATA_32: u16 = 0x08;
const MSI_REG_DATA_64: u16 = 0x0C;

/// LAPIC doorbell window.
const MSI_ADDR_BASE: u32 = 0xFEE0_0000;
const MSI_ADDR_DEST_ID_SHIFT: u32 = 12;

/// Vectors below 32 are CPU exceptions.
const MSI_MIN_VECTOR: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiCapability {
    pub cap_offset: u16,
    /// Message Control at parse time.
    pub control: u16,
    pub is_64bit: bool,
    pub has_per_vector_masking: bool,
    /// log2 of the maximum vectors the function can generate.
    pub multi_message_capable: u8,
}

impl MsiCapability {
    #[inline]
    const fn data_offset(&self) -> u16 {
        if self.is_64bit {
            self.cap_offset + MSI_REG_DATA_64
        } else {
            self.cap_offset + MSI_REG_DATA_32
        }
    }

    #[inline]
    pub const fn is_enabled(&self) -> bool {
        (self.control & MSI_CTRL_ENABLE) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiError {
    InvalidVector,
    NoCapability,
}

impl core::fmt::Display for MsiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidVector => f.write_str("vector below 32"),
            Self::NoCapability => f.write_str("no MSI capability"),
        }
    }
}

pub fn msi_read_capability(cfg: &dyn ConfigAccess, addr: PciAddress, cap_offset: u16) -> MsiCapability {
    let control = cfg.read16(addr, cap_offset + MSI_REG_CONTROL);
    MsiCapability {
        cap_offset,
        control,
        is_64bit: (control & MSI_CTRL_64BIT) != 0,
        has_per_vector_masking: (control & MSI_CTRL_PVM) != 0,
        multi_message_capable: ((control >> MSI_CTRL_MMC_SHIFT) & 0x7) as u8,
    }
}

/// Program single-vector MSI towards `target_apic_id` and disable INTx.
///
/// MSI stays disabled while address and data are rewritten and is
/// enabled last.
pub fn msi_configure(
    cfg: &dyn ConfigAccess,
    addr: PciAddress,
    cap: &MsiCapability,
    vector: u8,
    target_apic_id: u8,
) -> Result<(), MsiError> {
    if vector < MSI_MIN_VECTOR {
        return Err(MsiError::InvalidVector);
    }
    let ctrl_off = cap.cap_offset + MSI_REG_CONTROL;

    let mut ctrl = cfg.read16(addr, ctrl_off) & !MSI_CTRL_ENABLE;
    cfg.write16(addr, ctrl_off, ctrl);

    let msg_addr = MSI_ADDR_BASE | ((target_apic_id as u32) << MSI_ADDR_DEST_ID_SHIFT);
    cfg.write32(addr, cap.cap_offset + MSI_REG_ADDR_LO, msg_addr);
    if cap.is_64bit {
        cfg.write32(addr, cap.cap_offset + MSI_REG_ADDR_HI, 0);
    }

    // Fixed delivery, edge triggered: both encode as zero bits.
    cfg.write16(addr, cap.data_offset(), vector as u16);

    ctrl = cfg.read16(addr, ctrl_off) & !(MSI_CTRL_ENABLE | MSI_CTRL_MME_MASK);
    cfg.write16(addr, ctrl_off, ctrl);

    let cmd = cfg.read16(addr, PCI_COMMAND_OFFSET);
    cfg.write16(addr, PCI_COMMAND_OFFSET, cmd | PCI_COMMAND_INTX_DISABLE);

    cfg.write16(addr, ctrl_off, ctrl | MSI_CTRL_ENABLE);

    klog_info!(
        "MSI: Configured {} -> vector 0x{:02x}, APIC ID {}{}",
        addr,
        vector,
        target_apic_id,
        if cap.is_64bit { ", 64-bit" } else { "" },
    );
    Ok(())
}

/// Disable MSI and re-enable legacy INTx.
pub fn msi_disable(cfg: &dyn ConfigAccess, addr: PciAddress, cap: &MsiCapability) {
    let ctrl_off = cap.cap_offset + MSI_REG_CONTROL;
    let ctrl = cfg.read16(addr, ctrl_off);
    cfg.write16(addr, ctrl_off, ctrl & !MSI_CTRL_ENABLE);

    let cmd = cfg.read16(addr, PCI_COMMAND_OFFSET);
    cfg.write16(addr, PCI_COMMAND_OFFSET, cmd & !PCI_COMMAND_INTX_DISABLE);
    klog_info!("MSI: Disabled for {}", addr);
}

/// Route `dev`'s interrupt to `handler`: MSI first, then the legacy INTx
/// line, else polling.
pub fn select_interrupt_mode(
    cfg: &dyn ConfigAccess,
    dev: &PciDevice,
    router: &dyn IrqRouter,
    handler: fn(),
) -> InterruptMode {
    if let Some(cap_offset) = dev.msi_cap_offset {
        if let Some(vector) = router.alloc_msi_vector(handler) {
            let cap = msi_read_capability(cfg, dev.addr, cap_offset);
            match msi_configure(cfg, dev.addr, &cap, vector, router.msi_target_apic_id()) {
                Ok(()) => return InterruptMode::Msi { vector },
                Err(e) => klog_warn!("MSI: {} setup failed: {}", dev.addr, e),
            }
        }
    }
    let irq = dev.irq_line;
    if irq != 0xFF && router.register_legacy_irq(irq, handler) {
        return InterruptMode::Legacy { irq };
    }
    InterruptMode::Polling
}
