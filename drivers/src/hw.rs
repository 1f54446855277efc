//! Hardware access seams shared by the NIC and USB host drivers.
//!
//! Drivers never touch raw pointers for device registers or DMA memory
//! directly; they go through [`RegisterIo`] and [`DmaRegion`] so that the
//! same ring logic runs against real MMIO on the target and against an
//! in-memory register file under `cargo test`.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{Ordering, fence};

use kestrel_lib::Clock;

// =============================================================================
// Register access
// =============================================================================

/// 32/64-bit device register access at byte offsets from a BAR base.
pub trait RegisterIo: Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);

    /// Low dword first, as xHCI and E1000 both accept split 64-bit writes.
    fn read64(&self, offset: usize) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        lo | (hi << 32)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }

    #[inline]
    fn set_bits32(&self, offset: usize, bits: u32) {
        let v = self.read32(offset);
        self.write32(offset, v | bits);
    }

    #[inline]
    fn clear_bits32(&self, offset: usize, bits: u32) {
        let v = self.read32(offset);
        self.write32(offset, v & !bits);
    }
}

/// A mapped, uncached MMIO window.
#[derive(Debug, Clone, Copy)]
pub struct MmioRegion {
    virt_base: u64,
    phys_base: u64,
    size: usize,
}

impl MmioRegion {
    #[inline]
    pub const fn empty() -> Self {
        Self {
            virt_base: 0,
            phys_base: 0,
            size: 0,
        }
    }

    /// # Safety
    ///
    /// `virt_base..virt_base + size` must be mapped uncached onto the
    /// device's registers for the lifetime of the region.
    pub const unsafe fn from_raw(virt_base: u64, phys_base: u64, size: usize) -> Self {
        Self {
            virt_base,
            phys_base,
            size,
        }
    }

    #[inline]
    pub fn is_valid_offset(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.size)
    }

    #[inline]
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        let size = core::mem::size_of::<T>();
        debug_assert!(
            self.is_valid_offset(offset, size),
            "MMIO read out of bounds: offset={}, size={}, region_size={}",
            offset,
            size,
            self.size
        );
        debug_assert!(offset % size == 0, "MMIO read misaligned: offset={}", offset);
        // SAFETY: from_raw contract; bounds checked above in debug builds.
        unsafe { read_volatile((self.virt_base + offset as u64) as *const T) }
    }

    #[inline]
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        let size = core::mem::size_of::<T>();
        debug_assert!(
            self.is_valid_offset(offset, size),
            "MMIO write out of bounds: offset={}, size={}, region_size={}",
            offset,
            size,
            self.size
        );
        debug_assert!(offset % size == 0, "MMIO write misaligned: offset={}", offset);
        // SAFETY: see read.
        unsafe { write_volatile((self.virt_base + offset as u64) as *mut T, value) }
    }

    #[inline]
    pub fn virt_base(&self) -> u64 {
        self.virt_base
    }

    #[inline]
    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl RegisterIo for MmioRegion {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        self.read(offset)
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        self.write(offset, value)
    }
}

/// Maps device BARs into the kernel's MMIO window.
pub trait MmioMapper: Sync {
    fn map_mmio(&self, phys: u64, size: usize) -> Option<MmioRegion>;
}

// =============================================================================
// DMA memory
// =============================================================================

/// Physically contiguous memory visible to both the CPU and a bus master.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    pub virt: u64,
    pub phys: u64,
    pub len: usize,
}

impl DmaRegion {
    #[inline]
    pub fn phys_at(&self, offset: usize) -> u64 {
        self.phys + offset as u64
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len)
    }

    /// Volatile read; the device may have written this memory behind our back.
    #[inline]
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        debug_assert!(self.check(offset, core::mem::size_of::<T>()));
        // SAFETY: DmaAllocator contract guarantees [virt, virt+len) is owned
        // by this region and suitably aligned for descriptor fields.
        unsafe { read_volatile((self.virt + offset as u64) as *const T) }
    }

    #[inline]
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        debug_assert!(self.check(offset, core::mem::size_of::<T>()));
        // SAFETY: see read.
        unsafe { write_volatile((self.virt + offset as u64) as *mut T, value) }
    }

    /// Copy `data` into the region. Returns false (copying nothing) if it does not fit.
    pub fn copy_in(&self, offset: usize, data: &[u8]) -> bool {
        if !self.check(offset, data.len()) {
            return false;
        }
        // SAFETY: bounds checked; DMA memory never overlaps kernel slices.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.virt + offset as u64) as *mut u8,
                data.len(),
            );
        }
        fence(Ordering::Release);
        true
    }

    /// Borrow `len` bytes of the region.
    ///
    /// The slice must not outlive the point where the device may reuse
    /// the buffer (callers hand the descriptor back only after they are done).
    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if !self.check(offset, len) {
            return None;
        }
        fence(Ordering::Acquire);
        // SAFETY: bounds checked; see DmaAllocator contract.
        Some(unsafe { core::slice::from_raw_parts((self.virt + offset as u64) as *const u8, len) })
    }

    pub fn zero(&self) {
        // SAFETY: whole region is owned.
        unsafe { core::ptr::write_bytes(self.virt as *mut u8, 0, self.len) };
    }
}

/// Source of DMA-capable memory.
///
/// # Safety
///
/// Returned regions must be zero-initialised, exclusively owned by the
/// caller, aligned to `align`, and stay mapped for the kernel's lifetime.
pub unsafe trait DmaAllocator: Sync {
    fn alloc(&self, len: usize, align: usize) -> Option<DmaRegion>;

    /// Hand back a region from [`alloc`](Self::alloc). The device must no
    /// longer reference it. Bump allocators may ignore this.
    fn release(&self, _region: DmaRegion) {}
}

// =============================================================================
// Interrupt routing
// =============================================================================

/// How a driver ended up receiving its interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    Msi { vector: u8 },
    Legacy { irq: u8 },
    Polling,
}

impl InterruptMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Msi { .. } => "MSI",
            Self::Legacy { .. } => "legacy IRQ",
            Self::Polling => "polling",
        }
    }
}

/// Platform interrupt controller hooks used by drivers at init time.
pub trait IrqRouter: Sync {
    /// Allocate a free vector for MSI delivery and bind `handler` to it.
    fn alloc_msi_vector(&self, handler: fn()) -> Option<u8>;

    /// Route a legacy INTx line to `handler`.
    fn register_legacy_irq(&self, irq: u8, handler: fn()) -> bool;

    /// Destination for MSI messages.
    fn msi_target_apic_id(&self) -> u8 {
        0
    }
}

/// Router for machines without interrupt delivery; every driver polls.
pub struct NoIrqRouter;

impl IrqRouter for NoIrqRouter {
    fn alloc_msi_vector(&self, _handler: fn()) -> Option<u8> {
        None
    }

    fn register_legacy_irq(&self, _irq: u8, _handler: fn()) -> bool {
        false
    }
}

// =============================================================================
// Platform bundle
// =============================================================================

/// Everything a PCI driver needs from the kernel to bring a device up.
#[derive(Clone, Copy)]
pub struct Platform<'a> {
    pub mmio: &'a dyn MmioMapper,
    pub dma: &'a dyn DmaAllocator,
    pub irq: &'a dyn IrqRouter,
    pub clock: &'a (dyn Clock + Sync),
}
