//! PCI bus enumeration and configuration space access.
//!
//! Configuration access goes through PCIe ECAM when the ACPI MCFG table
//! describes a window for segment 0, and falls back to legacy port I/O
//! (0xCF8/0xCFC) otherwise. A missing or malformed MCFG is never fatal.

use alloc::boxed::Box;
use alloc::vec::Vec;

use kestrel_acpi::{AcpiTables, Mcfg, McfgEntry, PhysMapper};
use kestrel_lib::klog_info;
use kestrel_lib::ports::{PCI_CONFIG_ADDRESS, PCI_CONFIG_DATA};
use x86_64::instructions::port::Port;

use crate::hw::{MmioMapper, MmioRegion};
pub use crate::pci_defs::*;

const PCI_SECONDARY_BUS_OFFSET: u16 = 0x19;

// =============================================================================
// Configuration access backends
// =============================================================================

/// Raw configuration space access for one PCI segment.
///
/// Narrow reads extract from the containing dword; narrow writes are
/// read-modify-write on it.
pub trait ConfigAccess: Sync {
    fn name(&self) -> &'static str;

    fn read32(&self, addr: PciAddress, offset: u16) -> u32;
    fn write32(&self, addr: PciAddress, offset: u16, value: u32);

    /// Buses this backend can reach (inclusive).
    fn bus_range(&self) -> (u8, u8) {
        (0, 0xFF)
    }

    fn read16(&self, addr: PciAddress, offset: u16) -> u16 {
        let value = self.read32(addr, offset & !0x3);
        ((value >> ((offset & 0x2) * 8)) & 0xFFFF) as u16
    }

    fn read8(&self, addr: PciAddress, offset: u16) -> u8 {
        let value = self.read32(addr, offset & !0x3);
        ((value >> ((offset & 0x3) * 8)) & 0xFF) as u8
    }

    fn write16(&self, addr: PciAddress, offset: u16, value: u16) {
        let dword = self.read32(addr, offset & !0x3);
        let shift = (offset & 0x2) * 8;
        let mask = !(0xFFFFu32 << shift);
        self.write32(addr, offset & !0x3, (dword & mask) | ((value as u32) << shift));
    }

    fn write8(&self, addr: PciAddress, offset: u16, value: u8) {
        let dword = self.read32(addr, offset & !0x3);
        let shift = (offset & 0x3) * 8;
        let mask = !(0xFFu32 << shift);
        self.write32(addr, offset & !0x3, (dword & mask) | ((value as u32) << shift));
    }
}

/// Compute the 32-bit address for legacy PCI configuration port I/O.
#[inline(always)]
pub fn pci_pio_config_addr(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | ((offset as u32) & 0xFC)
}

/// Mechanism #1 port I/O. Only reaches segment 0 and the first 256 bytes.
pub struct LegacyPortAccess;

impl LegacyPortAccess {
    fn reachable(addr: PciAddress, offset: u16) -> bool {
        addr.segment == 0
            && offset < PCI_LEGACY_CONFIG_SIZE
            && addr.device < PCI_MAX_DEVICES_PER_BUS
            && addr.function < PCI_MAX_FUNCTIONS
    }
}

impl ConfigAccess for LegacyPortAccess {
    fn name(&self) -> &'static str {
        "legacy port I/O"
    }

    fn read32(&self, addr: PciAddress, offset: u16) -> u32 {
        if !Self::reachable(addr, offset) {
            return 0xFFFF_FFFF;
        }
        let cfg = pci_pio_config_addr(addr.bus, addr.device, addr.function, offset as u8);
        // SAFETY: 0xCF8/0xCFC are the PCI configuration mechanism ports.
        unsafe {
            Port::<u32>::new(PCI_CONFIG_ADDRESS).write(cfg);
            Port::<u32>::new(PCI_CONFIG_DATA).read()
        }
    }

    fn write32(&self, addr: PciAddress, offset: u16, value: u32) {
        if !Self::reachable(addr, offset) {
            return;
        }
        let cfg = pci_pio_config_addr(addr.bus, addr.device, addr.function, offset as u8);
        // SAFETY: see read32.
        unsafe {
            Port::<u32>::new(PCI_CONFIG_ADDRESS).write(cfg);
            Port::<u32>::new(PCI_CONFIG_DATA).write(value);
        }
    }
}

/// Memory-mapped PCIe configuration space for one MCFG entry.
pub struct EcamAccess {
    region: MmioRegion,
    entry: McfgEntry,
}

impl EcamAccess {
    pub fn new(region: MmioRegion, entry: McfgEntry) -> Self {
        Self { region, entry }
    }

    fn offset_of(&self, addr: PciAddress, offset: u16) -> Option<usize> {
        if addr.segment != self.entry.segment || offset >= PCI_ECAM_FUNCTION_SIZE {
            return None;
        }
        let base = self.entry.ecam_offset(addr.bus, addr.device, addr.function)?;
        let total = (base + (offset & !0x3) as u64) as usize;
        self.region.is_valid_offset(total, 4).then_some(total)
    }
}

impl ConfigAccess for EcamAccess {
    fn name(&self) -> &'static str {
        "ECAM"
    }

    fn read32(&self, addr: PciAddress, offset: u16) -> u32 {
        match self.offset_of(addr, offset) {
            Some(off) => self.region.read::<u32>(off),
            None => 0xFFFF_FFFF,
        }
    }

    fn write32(&self, addr: PciAddress, offset: u16, value: u32) {
        if let Some(off) = self.offset_of(addr, offset) {
            self.region.write::<u32>(off, value);
        }
    }

    fn bus_range(&self) -> (u8, u8) {
        (self.entry.bus_start, self.entry.bus_end)
    }
}

/// Locate the segment 0 ECAM window via MCFG and map it.
fn discover_ecam(
    xsdt_phys: u64,
    acpi: &dyn PhysMapper,
    mmio: &dyn MmioMapper,
) -> Option<EcamAccess> {
    let Some(tables) = AcpiTables::from_xsdt(xsdt_phys, acpi) else {
        klog_info!("PCI: ACPI tables validation failed, skipping MCFG");
        return None;
    };
    let Some(mcfg) = Mcfg::from_tables(&tables) else {
        klog_info!("PCI: No MCFG table, using legacy port I/O config access");
        return None;
    };
    let Some(entry) = mcfg.primary_entry().copied() else {
        klog_info!("PCI: MCFG has no segment 0 entry, using legacy port I/O");
        return None;
    };

    let size = entry.region_size() as usize;
    klog_info!(
        "PCI: ECAM segment {} buses {}..{} at phys 0x{:x} ({}MB)",
        entry.segment,
        entry.bus_start,
        entry.bus_end,
        entry.base_phys,
        size >> 20
    );
    match mmio.map_mmio(entry.base_phys, size) {
        Some(region) => Some(EcamAccess::new(region, entry)),
        None => {
            klog_info!("PCI: ECAM mapping failed, using legacy port I/O");
            None
        }
    }
}

// =============================================================================
// Capability list walking
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciCapability {
    pub offset: u16,
    pub id: u8,
}

/// Iterator over a function's capability list.
///
/// Stops on a zero next pointer or on an offset it has already visited,
/// so a malformed (cyclic) list terminates.
pub struct PciCapabilityIter<'a> {
    access: &'a dyn ConfigAccess,
    addr: PciAddress,
    next_ptr: u16,
    visited: [u64; 4],
}

impl<'a> PciCapabilityIter<'a> {
    pub fn new(access: &'a dyn ConfigAccess, addr: PciAddress) -> Self {
        let status = access.read16(addr, PCI_STATUS_OFFSET);
        let first_ptr = if (status & PCI_STATUS_CAP_LIST) != 0 {
            // Bottom 2 bits of the pointer are reserved.
            (access.read8(addr, PCI_CAP_PTR_OFFSET) & 0xFC) as u16
        } else {
            0
        };
        Self {
            access,
            addr,
            next_ptr: first_ptr,
            visited: [0; 4],
        }
    }

    fn mark_visited(&mut self, offset: u16) -> bool {
        let (word, bit) = ((offset as usize >> 6) & 0x3, offset & 63);
        let seen = self.visited[word] & (1 << bit) != 0;
        self.visited[word] |= 1 << bit;
        !seen
    }
}

impl Iterator for PciCapabilityIter<'_> {
    type Item = PciCapability;

    fn next(&mut self) -> Option<PciCapability> {
        let offset = self.next_ptr;
        // Capabilities live after the 64-byte standard header.
        if offset < 0x40 || !self.mark_visited(offset) {
            return None;
        }
        let id = self.access.read8(self.addr, offset);
        self.next_ptr = (self.access.read8(self.addr, offset + 1) & 0xFC) as u16;
        Some(PciCapability { offset, id })
    }
}

/// Human-readable name for a capability ID (boot log).
pub fn pci_cap_id_name(id: u8) -> &'static str {
    match id {
        PCI_CAP_ID_PM => "PM",
        0x03 => "VPD",
        PCI_CAP_ID_MSI => "MSI",
        PCI_CAP_ID_VNDR => "Vendor",
        PCI_CAP_ID_PCIE => "PCIe",
        PCI_CAP_ID_MSIX => "MSI-X",
        0x12 => "SATA",
        0x13 => "AF",
        _ => "Unknown",
    }
}

/// Human-readable name for a class/subclass pair (boot log).
pub fn class_name(class: u8, subclass: u8) -> &'static str {
    match (class, subclass) {
        (0x00, _) => "Unclassified",
        (0x01, 0x01) => "IDE Controller",
        (0x01, 0x06) => "SATA Controller",
        (0x01, 0x08) => "NVMe Controller",
        (0x01, _) => "Mass Storage",
        (0x02, 0x00) => "Ethernet Controller",
        (0x02, _) => "Network Controller",
        (0x03, 0x00) => "VGA Controller",
        (0x03, _) => "Display Controller",
        (0x04, 0x03) => "Audio Device",
        (0x04, _) => "Multimedia Controller",
        (0x05, _) => "Memory Controller",
        (0x06, 0x00) => "Host Bridge",
        (0x06, 0x01) => "ISA Bridge",
        (0x06, 0x04) => "PCI-to-PCI Bridge",
        (0x06, _) => "Bridge",
        (0x07, _) => "Communication Controller",
        (0x08, _) => "System Peripheral",
        (0x09, _) => "Input Controller",
        (0x0C, 0x03) => "USB Controller",
        (0x0C, 0x05) => "SMBus Controller",
        (0x0C, _) => "Serial Bus Controller",
        (0x0D, _) => "Wireless Controller",
        _ => "Unknown",
    }
}

// =============================================================================
// Bus
// =============================================================================

/// The enumerated device list plus the config access backend used to build it.
pub struct PciBus {
    access: Box<dyn ConfigAccess>,
    devices: Vec<PciDevice>,
}

impl PciBus {
    pub fn new(access: Box<dyn ConfigAccess>) -> Self {
        Self {
            access,
            devices: Vec::new(),
        }
    }

    /// Pick ECAM from MCFG when `xsdt_phys` leads to one, else legacy
    /// port I/O, then enumerate.
    pub fn initialize(
        xsdt_phys: Option<u64>,
        acpi: &dyn PhysMapper,
        mmio: &dyn MmioMapper,
    ) -> Self {
        klog_info!("PCI: Initializing PCI subsystem");
        let access: Box<dyn ConfigAccess> = match xsdt_phys.and_then(|x| discover_ecam(x, acpi, mmio)) {
            Some(ecam) => Box::new(ecam),
            None => Box::new(LegacyPortAccess),
        };
        let mut bus = Self::new(access);
        bus.enumerate_all();
        bus
    }

    #[inline]
    pub fn backend_name(&self) -> &'static str {
        self.access.name()
    }

    #[inline]
    pub fn config(&self) -> &dyn ConfigAccess {
        &*self.access
    }

    /// Walk every bus/device/function the backend reaches. Returns the device count.
    pub fn enumerate_all(&mut self) -> usize {
        self.devices.clear();
        let (first, last) = self.access.bus_range();
        for bus in first..=last {
            for device in 0..PCI_MAX_DEVICES_PER_BUS {
                self.scan_slot(bus, device);
            }
        }
        klog_info!(
            "PCI: Enumeration complete via {}. Devices discovered: {}",
            self.backend_name(),
            self.devices.len()
        );
        self.devices.len()
    }

    fn scan_slot(&mut self, bus: u8, device: u8) {
        let fn0 = PciAddress::new(bus, device, 0);
        if self.access.read16(fn0, PCI_VENDOR_ID_OFFSET) == PCI_VENDOR_ID_INVALID {
            return;
        }
        self.scan_function(fn0);

        let header = self.access.read8(fn0, PCI_HEADER_TYPE_OFFSET);
        if header & PCI_HEADER_MULTIFUNCTION == 0 {
            return;
        }
        for function in 1..PCI_MAX_FUNCTIONS {
            let addr = PciAddress::new(bus, device, function);
            if self.access.read16(addr, PCI_VENDOR_ID_OFFSET) != PCI_VENDOR_ID_INVALID {
                self.scan_function(addr);
            }
        }
    }

    fn scan_function(&mut self, addr: PciAddress) {
        let a = &*self.access;
        let vendor_id = a.read16(addr, PCI_VENDOR_ID_OFFSET);
        let device_id = a.read16(addr, PCI_DEVICE_ID_OFFSET);
        let class_code = a.read8(addr, PCI_CLASS_CODE_OFFSET);
        let subclass = a.read8(addr, PCI_SUBCLASS_OFFSET);
        let prog_if = a.read8(addr, PCI_PROG_IF_OFFSET);
        let header_type = a.read8(addr, PCI_HEADER_TYPE_OFFSET) & PCI_HEADER_TYPE_MASK;

        let mut bars = [PciBarInfo::zeroed(); PCI_MAX_BARS];
        let mut bar_count = 0u8;
        if header_type == 0 {
            let mut idx = 0u8;
            while (idx as usize) < PCI_MAX_BARS {
                let bar = pci_read_bar(a, addr, idx);
                bars[idx as usize] = bar;
                if bar.is_present() {
                    bar_count = idx + 1;
                }
                if bar.is_64bit {
                    idx += 1;
                }
                idx += 1;
            }
        }

        let msi_cap_offset = PciCapabilityIter::new(a, addr)
            .find(|c| c.id == PCI_CAP_ID_MSI)
            .map(|c| c.offset);

        let dev = PciDevice {
            addr,
            vendor_id,
            device_id,
            class_code,
            subclass,
            prog_if,
            revision: a.read8(addr, PCI_REVISION_ID_OFFSET),
            header_type,
            irq_line: a.read8(addr, PCI_INTERRUPT_LINE_OFFSET),
            irq_pin: a.read8(addr, PCI_INTERRUPT_PIN_OFFSET),
            bar_count,
            bars,
            msi_cap_offset,
        };

        klog_info!(
            "PCI: [{}] VID=0x{:04x} DID=0x{:04x} Class=0x{:02x}:{:02x} ProgIF=0x{:02x} {}",
            addr,
            vendor_id,
            device_id,
            class_code,
            subclass,
            prog_if,
            class_name(class_code, subclass)
        );
        for cap in PciCapabilityIter::new(a, addr) {
            klog_info!(
                "    CAP: 0x{:02x} ({}) at offset 0x{:02x}",
                cap.id,
                pci_cap_id_name(cap.id),
                cap.offset
            );
        }
        if header_type == 1 {
            klog_info!(
                "    bridge to secondary bus {}",
                a.read8(addr, PCI_SECONDARY_BUS_OFFSET)
            );
        }

        self.devices.push(dev);
    }

    #[inline]
    pub fn devices(&self) -> &[PciDevice] {
        &self.devices
    }

    pub fn find_device(&self, vendor_id: u16, device_id: u16) -> Option<&PciDevice> {
        self.devices
            .iter()
            .find(|d| d.vendor_id == vendor_id && d.device_id == device_id)
    }

    pub fn find_by_class(&self, class: u8, subclass: u8, prog_if: u8) -> Option<&PciDevice> {
        self.devices
            .iter()
            .find(|d| d.matches_class(class, subclass, prog_if))
    }

    pub fn capabilities(&self, addr: PciAddress) -> PciCapabilityIter<'_> {
        PciCapabilityIter::new(&*self.access, addr)
    }

    /// Config-space offset of the first capability with `cap_id`.
    pub fn find_capability(&self, addr: PciAddress, cap_id: u8) -> Option<u16> {
        self.capabilities(addr)
            .find(|cap| cap.id == cap_id)
            .map(|cap| cap.offset)
    }

    #[inline]
    pub fn read32(&self, addr: PciAddress, offset: u16) -> u32 {
        self.access.read32(addr, offset)
    }

    #[inline]
    pub fn read16(&self, addr: PciAddress, offset: u16) -> u16 {
        self.access.read16(addr, offset)
    }

    #[inline]
    pub fn read8(&self, addr: PciAddress, offset: u16) -> u8 {
        self.access.read8(addr, offset)
    }

    #[inline]
    pub fn write32(&self, addr: PciAddress, offset: u16, value: u32) {
        self.access.write32(addr, offset, value)
    }

    #[inline]
    pub fn write16(&self, addr: PciAddress, offset: u16, value: u16) {
        self.access.write16(addr, offset, value)
    }

    #[inline]
    pub fn write8(&self, addr: PciAddress, offset: u16, value: u8) {
        self.access.write8(addr, offset, value)
    }

    /// Enable MMIO decoding and bus mastering (DMA) for a function.
    pub fn enable_bus_master(&self, addr: PciAddress) {
        let cmd = self.read16(addr, PCI_COMMAND_OFFSET);
        self.write16(
            addr,
            PCI_COMMAND_OFFSET,
            cmd | PCI_COMMAND_MEMORY_SPACE | PCI_COMMAND_BUS_MASTER,
        );
    }
}

/// Size a BAR by writing all-ones and reading back the mask.
pub fn pci_read_bar(a: &dyn ConfigAccess, addr: PciAddress, bar_idx: u8) -> PciBarInfo {
    let bar_offset = PCI_BAR0_OFFSET + bar_idx as u16 * 4;
    let original = a.read32(addr, bar_offset);
    let is_io = (original & 1) != 0;

    a.write32(addr, bar_offset, 0xFFFF_FFFF);
    let size_mask = a.read32(addr, bar_offset);
    a.write32(addr, bar_offset, original);

    if size_mask == 0 || size_mask == 0xFFFF_FFFF {
        return PciBarInfo::zeroed();
    }

    if is_io {
        PciBarInfo {
            base: (original & !0x3) as u64,
            size: (!(size_mask & !0x3)).wrapping_add(1) as u64,
            is_io: true,
            ..PciBarInfo::zeroed()
        }
    } else {
        let is_64bit = ((original >> 1) & 0x3) == 2;
        let base_high = if is_64bit && (bar_idx as usize) < PCI_MAX_BARS - 1 {
            a.read32(addr, bar_offset + 4) as u64
        } else {
            0
        };
        PciBarInfo {
            base: (original & !0xF) as u64 | (base_high << 32),
            size: (!(size_mask & !0xF)).wrapping_add(1) as u64,
            is_io: false,
            is_64bit,
            prefetchable: ((original >> 3) & 1) != 0,
        }
    }
}
