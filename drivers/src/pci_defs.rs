//! PCI configuration space constants and device structures.

// =============================================================================
// Configuration Space Register Offsets
// =============================================================================

pub const PCI_VENDOR_ID_OFFSET: u16 = 0x00;
pub const PCI_DEVICE_ID_OFFSET: u16 = 0x02;
pub const PCI_COMMAND_OFFSET: u16 = 0x04;
pub const PCI_STATUS_OFFSET: u16 = 0x06;
pub const PCI_REVISION_ID_OFFSET: u16 = 0x08;
pub const PCI_PROG_IF_OFFSET: u16 = 0x09;
pub const PCI_SUBCLASS_OFFSET: u16 = 0x0A;
pub const PCI_CLASS_CODE_OFFSET: u16 = 0x0B;
pub const PCI_HEADER_TYPE_OFFSET: u16 = 0x0E;
pub const PCI_BAR0_OFFSET: u16 = 0x10;
/// Capabilities pointer (header type 0).
pub const PCI_CAP_PTR_OFFSET: u16 = 0x34;
pub const PCI_INTERRUPT_LINE_OFFSET: u16 = 0x3C;
pub const PCI_INTERRUPT_PIN_OFFSET: u16 = 0x3D;

/// Legacy port I/O only reaches the first 256 bytes of each function.
pub const PCI_LEGACY_CONFIG_SIZE: u16 = 256;
/// PCIe extended configuration space per function.
pub const PCI_ECAM_FUNCTION_SIZE: u16 = 4096;

// =============================================================================
// Header / Status / Command bits
// =============================================================================

pub const PCI_HEADER_MULTIFUNCTION: u8 = 0x80;
pub const PCI_HEADER_TYPE_MASK: u8 = 0x7F;

pub const PCI_STATUS_CAP_LIST: u16 = 0x10;

pub const PCI_COMMAND_IO_SPACE: u16 = 0x0001;
pub const PCI_COMMAND_MEMORY_SPACE: u16 = 0x0002;
pub const PCI_COMMAND_BUS_MASTER: u16 = 0x0004;
/// Bit 10: the function may not assert INTx.
pub const PCI_COMMAND_INTX_DISABLE: u16 = 1 << 10;

// =============================================================================
// Device Classes
// =============================================================================

pub const PCI_CLASS_NETWORK: u8 = 0x02;
pub const PCI_SUBCLASS_ETHERNET: u8 = 0x00;

pub const PCI_CLASS_SERIAL_BUS: u8 = 0x0C;
pub const PCI_SUBCLASS_USB: u8 = 0x03;
pub const PCI_PROG_IF_XHCI: u8 = 0x30;

// =============================================================================
// Capability IDs
// =============================================================================

pub const PCI_CAP_ID_PM: u8 = 0x01;
pub const PCI_CAP_ID_MSI: u8 = 0x05;
pub const PCI_CAP_ID_VNDR: u8 = 0x09;
pub const PCI_CAP_ID_PCIE: u8 = 0x10;
pub const PCI_CAP_ID_MSIX: u8 = 0x11;

// =============================================================================
// Vendor IDs
// =============================================================================

pub const PCI_VENDOR_ID_INTEL: u16 = 0x8086;
/// No device present.
pub const PCI_VENDOR_ID_INVALID: u16 = 0xFFFF;

// =============================================================================
// Enumeration Limits
// =============================================================================

pub const PCI_MAX_DEVICES_PER_BUS: u8 = 32;
pub const PCI_MAX_FUNCTIONS: u8 = 8;
pub const PCI_MAX_BARS: usize = 6;

// =============================================================================
// PCI Device Structures
// =============================================================================

/// Segment/bus/device/function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciAddress {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            segment: 0,
            bus,
            device,
            function,
        }
    }
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct PciBarInfo {
    pub base: u64,
    pub size: u64,
    pub is_io: bool,
    pub is_64bit: bool,
    pub prefetchable: bool,
}

impl PciBarInfo {
    pub const fn zeroed() -> Self {
        Self {
            base: 0,
            size: 0,
            is_io: false,
            is_64bit: false,
            prefetchable: false,
        }
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.base != 0 || self.size != 0
    }

    #[inline]
    pub fn is_mmio(&self) -> bool {
        !self.is_io && self.base != 0
    }
}

/// A discovered PCI function. Immutable once enumerated.
#[derive(Clone, Copy, Default, Debug)]
pub struct PciDevice {
    pub addr: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub irq_line: u8,
    pub irq_pin: u8,
    pub bar_count: u8,
    pub bars: [PciBarInfo; PCI_MAX_BARS],
    pub msi_cap_offset: Option<u16>,
}

impl PciDevice {
    #[inline]
    pub fn matches_class(&self, class: u8, subclass: u8, prog_if: u8) -> bool {
        self.class_code == class && self.subclass == subclass && self.prog_if == prog_if
    }

    /// First memory BAR, where both the NIC and xHCI put their registers.
    pub fn mmio_bar(&self) -> Option<&PciBarInfo> {
        self.bars.iter().find(|b| b.is_mmio())
    }
}
