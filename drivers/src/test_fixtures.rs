//! In-memory stand-ins for hardware used by the host unit tests.

use alloc::alloc::{Layout, alloc_zeroed};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_lib::IrqMutex;

use crate::hw::{DmaAllocator, DmaRegion};
use crate::net::netdev::{NetDevice, NetDeviceStats, StatsCounters};
use crate::net::types::{MacAddr, NetError};
use crate::pci::ConfigAccess;
use crate::pci_defs::{PCI_BAR0_OFFSET, PciAddress};

/// Leaking heap allocator; physical == virtual.
pub struct HeapDma;

unsafe impl DmaAllocator for HeapDma {
    fn alloc(&self, len: usize, align: usize) -> Option<DmaRegion> {
        let layout = Layout::from_size_align(len.max(1), align.max(1)).ok()?;
        // SAFETY: non-zero size layout.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(DmaRegion {
            virt: ptr as u64,
            phys: ptr as u64,
            len,
        })
    }
}

/// Sparse 32-bit register file. Unwritten registers read as zero.
#[derive(Default)]
pub struct RegFile {
    regs: IrqMutex<BTreeMap<usize, u32>>,
}

impl RegFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, offset: usize) -> u32 {
        self.regs.lock().get(&offset).copied().unwrap_or(0)
    }

    pub fn set(&self, offset: usize, value: u32) {
        self.regs.lock().insert(offset, value);
    }
}

/// Configuration space for a handful of fake functions.
///
/// BAR sizing is emulated: writing all-ones to a BAR with a registered size
/// reads back the size mask.
#[derive(Default)]
pub struct FakeConfigSpace {
    spaces: IrqMutex<BTreeMap<PciAddress, [u8; 256]>>,
    bar_sizes: IrqMutex<BTreeMap<(PciAddress, u16), u32>>,
}

impl FakeConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a type-0 function with no capabilities.
    pub fn add_function(&self, addr: PciAddress, vendor: u16, device: u16, class: [u8; 3]) {
        let mut space = [0u8; 256];
        space[0..2].copy_from_slice(&vendor.to_le_bytes());
        space[2..4].copy_from_slice(&device.to_le_bytes());
        space[9] = class[2];
        space[0x0A] = class[1];
        space[0x0B] = class[0];
        self.spaces.lock().insert(addr, space);
    }

    pub fn poke8(&self, addr: PciAddress, offset: u16, value: u8) {
        if let Some(space) = self.spaces.lock().get_mut(&addr) {
            space[offset as usize] = value;
        }
    }

    pub fn set_bar(&self, addr: PciAddress, idx: u16, base: u32, size: u32) {
        let off = PCI_BAR0_OFFSET + idx * 4;
        self.write32(addr, off, base);
        self.bar_sizes.lock().insert((addr, off), size);
    }
}

impl ConfigAccess for FakeConfigSpace {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn read32(&self, addr: PciAddress, offset: u16) -> u32 {
        let spaces = self.spaces.lock();
        let Some(space) = spaces.get(&addr) else {
            return 0xFFFF_FFFF;
        };
        let o = (offset & 0xFC) as usize;
        u32::from_le_bytes([space[o], space[o + 1], space[o + 2], space[o + 3]])
    }

    fn write32(&self, addr: PciAddress, offset: u16, value: u32) {
        let o = offset & 0xFC;
        let mut value = value;
        if value == 0xFFFF_FFFF && (PCI_BAR0_OFFSET..PCI_BAR0_OFFSET + 24).contains(&o) {
            let size = self.bar_sizes.lock().get(&(addr, o)).copied().unwrap_or(0);
            let flags = self.read32(addr, o) & 0xF;
            value = if size == 0 { 0 } else { !(size - 1) | flags };
        }
        let mut spaces = self.spaces.lock();
        if let Some(space) = spaces.get_mut(&addr) {
            space[o as usize..o as usize + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Point-to-point Ethernet segment between two [`WirePort`]s. A frame sent on
/// one end waits in the other end's inbox until that side polls.
pub struct Wire {
    inbox: [IrqMutex<VecDeque<Vec<u8>>>; 2],
}

impl Wire {
    pub fn pair(mac_a: MacAddr, mac_b: MacAddr) -> (WirePort, WirePort) {
        let wire = Arc::new(Self {
            inbox: [IrqMutex::new(VecDeque::new()), IrqMutex::new(VecDeque::new())],
        });
        (
            WirePort::new(wire.clone(), 0, mac_a),
            WirePort::new(wire, 1, mac_b),
        )
    }
}

pub struct WirePort {
    wire: Arc<Wire>,
    side: usize,
    mac: MacAddr,
    stats: StatsCounters,
}

impl WirePort {
    fn new(wire: Arc<Wire>, side: usize, mac: MacAddr) -> Self {
        Self {
            wire,
            side,
            mac,
            stats: StatsCounters::new(),
        }
    }

    /// Frames addressed to this end that nobody has polled yet.
    pub fn drain_inbound(&self) -> Vec<Vec<u8>> {
        self.wire.inbox[self.side].lock().drain(..).collect()
    }

    pub fn inbound_len(&self) -> usize {
        self.wire.inbox[self.side].lock().len()
    }
}

impl NetDevice for WirePort {
    fn send_frame(&self, frame: &[u8]) -> Result<(), NetError> {
        self.stats.record_tx(frame.len());
        self.wire.inbox[1 - self.side]
            .lock()
            .push_back(frame.to_vec());
        Ok(())
    }

    fn poll_frames(&self, sink: &mut dyn FnMut(&[u8])) -> usize {
        let mut n = 0;
        loop {
            // Popped before the sink runs; the sink may transmit.
            let next = self.wire.inbox[self.side].lock().pop_front();
            let Some(frame) = next else {
                return n;
            };
            self.stats.record_rx(frame.len());
            sink(&frame);
            n += 1;
        }
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn link_up(&self) -> bool {
        true
    }

    fn stats(&self) -> NetDeviceStats {
        self.stats.snapshot()
    }
}
