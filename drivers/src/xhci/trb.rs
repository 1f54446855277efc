//! Transfer Request Blocks and the rings that carry them.
//!
//! Producer rings (command, transfer) end in a Link TRB with Toggle Cycle
//! set; the producer flips its cycle state every time it follows the link.
//! The event ring is consumed by software: an entry is new only while its
//! cycle bit matches the consumer cycle state, which flips on wrap.

use crate::hw::{DmaAllocator, DmaRegion};

pub const TRB_SIZE: usize = 16;
const RING_ALIGN: usize = 64;

pub const TRB_TYPE_SHIFT: u32 = 10;
pub const TRB_TYPE_MASK: u32 = 0x3F << TRB_TYPE_SHIFT;

pub const TRB_NORMAL: u32 = 1;
pub const TRB_SETUP_STAGE: u32 = 2;
pub const TRB_DATA_STAGE: u32 = 3;
pub const TRB_STATUS_STAGE: u32 = 4;
pub const TRB_LINK: u32 = 6;
pub const TRB_ENABLE_SLOT: u32 = 9;
pub const TRB_DISABLE_SLOT: u32 = 10;
pub const TRB_ADDRESS_DEVICE: u32 = 11;
pub const TRB_CONFIGURE_ENDPOINT: u32 = 12;
pub const TRB_EVALUATE_CONTEXT: u32 = 13;
pub const TRB_NOOP_CMD: u32 = 23;
pub const TRB_TRANSFER_EVENT: u32 = 32;
pub const TRB_COMMAND_COMPLETION: u32 = 33;
pub const TRB_PORT_STATUS_CHANGE: u32 = 34;

pub const TRB_CYCLE: u32 = 1 << 0;
/// Toggle Cycle on a Link TRB.
pub const TRB_TC: u32 = 1 << 1;
pub const TRB_ISP: u32 = 1 << 2;
pub const TRB_CHAIN: u32 = 1 << 4;
pub const TRB_IOC: u32 = 1 << 5;
pub const TRB_IDT: u32 = 1 << 6;
pub const TRB_BSR: u32 = 1 << 9;
pub const TRB_DIR_IN: u32 = 1 << 16;
pub const TRB_TRT_NO_DATA: u32 = 0 << 16;
pub const TRB_TRT_OUT: u32 = 2 << 16;
pub const TRB_TRT_IN: u32 = 3 << 16;

pub const CC_INVALID: u8 = 0;
pub const CC_SUCCESS: u8 = 1;
pub const CC_STALL: u8 = 6;
pub const CC_SHORT_PACKET: u8 = 13;

/// USB SETUP packet, sent inline in a Setup Stage TRB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    #[inline]
    pub const fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    pub const fn to_u64(self) -> u64 {
        (self.request_type as u64)
            | ((self.request as u64) << 8)
            | ((self.value as u64) << 16)
            | ((self.index as u64) << 32)
            | ((self.length as u64) << 48)
    }

    pub const fn from_u64(raw: u64) -> Self {
        Self {
            request_type: raw as u8,
            request: (raw >> 8) as u8,
            value: (raw >> 16) as u16,
            index: (raw >> 32) as u16,
            length: (raw >> 48) as u16,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trb {
    pub param: u64,
    pub status: u32,
    pub control: u32,
}

impl Trb {
    #[inline]
    pub const fn of_type(trb_type: u32) -> Self {
        Self {
            param: 0,
            status: 0,
            control: trb_type << TRB_TYPE_SHIFT,
        }
    }

    #[inline]
    pub const fn trb_type(&self) -> u32 {
        (self.control & TRB_TYPE_MASK) >> TRB_TYPE_SHIFT
    }

    #[inline]
    pub const fn cycle(&self) -> bool {
        self.control & TRB_CYCLE != 0
    }

    #[inline]
    pub const fn completion_code(&self) -> u8 {
        (self.status >> 24) as u8
    }

    /// Bytes not transferred, for Transfer Events.
    #[inline]
    pub const fn residual_length(&self) -> u32 {
        self.status & 0x00FF_FFFF
    }

    #[inline]
    pub const fn slot_id(&self) -> u8 {
        (self.control >> 24) as u8
    }

    #[inline]
    pub const fn endpoint_id(&self) -> u8 {
        ((self.control >> 16) & 0x1F) as u8
    }

    /// Root port of a Port Status Change event.
    #[inline]
    pub const fn port_id(&self) -> u8 {
        (self.param >> 24) as u8
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    pub const fn enable_slot() -> Self {
        Self::of_type(TRB_ENABLE_SLOT)
    }

    pub const fn disable_slot(slot: u8) -> Self {
        Self {
            param: 0,
            status: 0,
            control: (TRB_DISABLE_SLOT << TRB_TYPE_SHIFT) | ((slot as u32) << 24),
        }
    }

    pub const fn address_device(input_ctx: u64, slot: u8) -> Self {
        Self {
            param: input_ctx,
            status: 0,
            control: (TRB_ADDRESS_DEVICE << TRB_TYPE_SHIFT) | ((slot as u32) << 24),
        }
    }

    pub const fn configure_endpoint(input_ctx: u64, slot: u8) -> Self {
        Self {
            param: input_ctx,
            status: 0,
            control: (TRB_CONFIGURE_ENDPOINT << TRB_TYPE_SHIFT) | ((slot as u32) << 24),
        }
    }

    pub const fn noop_command() -> Self {
        Self::of_type(TRB_NOOP_CMD)
    }

    // -------------------------------------------------------------------------
    // Transfers
    // -------------------------------------------------------------------------

    pub const fn setup_stage(setup: SetupPacket) -> Self {
        let trt = if setup.length == 0 {
            TRB_TRT_NO_DATA
        } else if setup.is_in() {
            TRB_TRT_IN
        } else {
            TRB_TRT_OUT
        };
        Self {
            param: setup.to_u64(),
            status: 8,
            control: (TRB_SETUP_STAGE << TRB_TYPE_SHIFT) | TRB_IDT | trt,
        }
    }

    pub const fn data_stage(buffer: u64, length: u16, dir_in: bool) -> Self {
        Self {
            param: buffer,
            status: length as u32,
            control: (TRB_DATA_STAGE << TRB_TYPE_SHIFT) | if dir_in { TRB_DIR_IN } else { 0 },
        }
    }

    /// Status stage runs opposite to the data stage (IN when there is none).
    pub const fn status_stage(data_in: bool, has_data: bool) -> Self {
        let dir = if has_data && data_in { 0 } else { TRB_DIR_IN };
        Self {
            param: 0,
            status: 0,
            control: (TRB_STATUS_STAGE << TRB_TYPE_SHIFT) | TRB_IOC | dir,
        }
    }

    pub const fn normal(buffer: u64, length: u32) -> Self {
        Self {
            param: buffer,
            status: length & 0x1_FFFF,
            control: (TRB_NORMAL << TRB_TYPE_SHIFT) | TRB_IOC | TRB_ISP,
        }
    }

    pub const fn link(target: u64) -> Self {
        Self {
            param: target,
            status: 0,
            control: (TRB_LINK << TRB_TYPE_SHIFT) | TRB_TC,
        }
    }

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    pub fn read_from(mem: &DmaRegion, index: usize) -> Self {
        let off = index * TRB_SIZE;
        Self {
            param: mem.read::<u64>(off),
            status: mem.read::<u32>(off + 8),
            control: mem.read::<u32>(off + 12),
        }
    }

    /// Store with the cycle bit forced to `cycle`; control goes last so the
    /// controller never sees a half-written TRB it owns.
    pub fn write_to(&self, mem: &DmaRegion, index: usize, cycle: bool) {
        let off = index * TRB_SIZE;
        mem.write::<u64>(off, self.param);
        mem.write::<u32>(off + 8, self.status);
        let control = (self.control & !TRB_CYCLE) | if cycle { TRB_CYCLE } else { 0 };
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        mem.write::<u32>(off + 12, control);
    }
}

// =============================================================================
// Producer ring
// =============================================================================

pub struct TrbRing {
    mem: DmaRegion,
    size: usize,
    enqueue: usize,
    cycle: bool,
}

impl TrbRing {
    /// `size` slots, the last of which is the Link TRB back to slot 0.
    pub fn new(dma: &dyn DmaAllocator, size: usize) -> Option<Self> {
        let mem = dma.alloc(size * TRB_SIZE, RING_ALIGN)?;
        Trb::link(mem.phys).write_to(&mem, size - 1, false);
        Some(Self {
            mem,
            size,
            enqueue: 0,
            cycle: true,
        })
    }

    /// Hand `trb` to the controller. Returns its physical address, which
    /// completion events quote back.
    pub fn push(&mut self, trb: Trb) -> u64 {
        let index = self.enqueue;
        trb.write_to(&self.mem, index, self.cycle);
        let phys = self.mem.phys_at(index * TRB_SIZE);

        self.enqueue += 1;
        if self.enqueue == self.size - 1 {
            let link = Trb::read_from(&self.mem, self.size - 1);
            link.write_to(&self.mem, self.size - 1, self.cycle);
            self.cycle = !self.cycle;
            self.enqueue = 0;
        }
        phys
    }

    #[inline]
    pub fn phys(&self) -> u64 {
        self.mem.phys
    }

    #[inline]
    pub fn enqueue_index(&self) -> usize {
        self.enqueue
    }

    #[inline]
    pub fn cycle(&self) -> bool {
        self.cycle
    }

    #[inline]
    pub fn region(&self) -> DmaRegion {
        self.mem
    }

    /// Usable slots (the Link TRB excluded).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size - 1
    }
}

// =============================================================================
// Event ring
// =============================================================================

/// Single-segment event ring plus its one-entry segment table.
pub struct EventRing {
    mem: DmaRegion,
    erst: DmaRegion,
    size: usize,
    dequeue: usize,
    cycle: bool,
}

impl EventRing {
    pub fn new(dma: &dyn DmaAllocator, size: usize) -> Option<Self> {
        let mem = dma.alloc(size * TRB_SIZE, RING_ALIGN)?;
        let erst = dma.alloc(16, RING_ALIGN)?;
        erst.write::<u64>(0, mem.phys);
        erst.write::<u32>(8, size as u32);
        erst.write::<u32>(12, 0);
        Some(Self {
            mem,
            erst,
            size,
            dequeue: 0,
            cycle: true,
        })
    }

    /// Next event the controller has published, if any.
    pub fn pop(&mut self) -> Option<Trb> {
        let trb = Trb::read_from(&self.mem, self.dequeue);
        if trb.cycle() != self.cycle {
            return None;
        }
        self.dequeue += 1;
        if self.dequeue == self.size {
            self.dequeue = 0;
            self.cycle = !self.cycle;
        }
        Some(trb)
    }

    #[inline]
    pub fn dequeue_phys(&self) -> u64 {
        self.mem.phys_at(self.dequeue * TRB_SIZE)
    }

    #[inline]
    pub fn erst_phys(&self) -> u64 {
        self.erst.phys
    }

    #[inline]
    pub fn segment_phys(&self) -> u64 {
        self.mem.phys
    }

    #[inline]
    pub fn cycle(&self) -> bool {
        self.cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::HeapDma;

    #[test]
    fn producer_toggles_cycle_through_link() {
        let mut ring = TrbRing::new(&HeapDma, 4).expect("ring");
        let base = ring.phys();
        assert_eq!(ring.push(Trb::noop_command()), base);
        assert_eq!(ring.push(Trb::noop_command()), base + 16);
        assert!(ring.cycle());
        assert_eq!(ring.push(Trb::noop_command()), base + 32);

        // Third push reached the link: it now carries the old cycle and we flipped.
        assert!(!ring.cycle());
        assert_eq!(ring.enqueue_index(), 0);
        let link = Trb::read_from(&ring.mem, 3);
        assert_eq!(link.trb_type(), TRB_LINK);
        assert!(link.cycle());
        assert_eq!(link.param, base);
        assert_ne!(link.control & TRB_TC, 0);

        assert_eq!(ring.push(Trb::enable_slot()), base);
        let second_pass = Trb::read_from(&ring.mem, 0);
        assert!(!second_pass.cycle());
        assert_eq!(second_pass.trb_type(), TRB_ENABLE_SLOT);
    }

    #[test]
    fn event_ring_consumes_only_matching_cycle() {
        let mut ring = EventRing::new(&HeapDma, 2).expect("ring");
        assert!(ring.pop().is_none());

        let ev = Trb {
            param: 0x1000,
            status: (CC_SUCCESS as u32) << 24,
            control: (TRB_COMMAND_COMPLETION << TRB_TYPE_SHIFT) | (3 << 24),
        };
        ev.write_to(&ring.mem, 0, true);
        ev.write_to(&ring.mem, 1, true);

        let first = ring.pop().expect("first");
        assert_eq!(first.completion_code(), CC_SUCCESS);
        assert_eq!(first.slot_id(), 3);
        assert!(ring.pop().is_some());

        // Wrapped: stale entries from the previous pass are ignored.
        assert!(!ring.cycle());
        assert!(ring.pop().is_none());
        ev.write_to(&ring.mem, 0, false);
        assert!(ring.pop().is_some());
        assert_eq!(ring.dequeue_phys(), ring.segment_phys() + 16);
    }

    #[test]
    fn setup_packet_layout() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: 6,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        let trb = Trb::setup_stage(setup);
        assert_eq!(trb.param, 0x0012_0000_0100_0680);
        assert_eq!(trb.control & TRB_TRT_IN, TRB_TRT_IN);
        assert_ne!(trb.control & TRB_IDT, 0);
        assert_eq!(SetupPacket::from_u64(trb.param), setup);

        assert_ne!(Trb::status_stage(true, false).control & TRB_DIR_IN, 0);
        assert_eq!(Trb::status_stage(true, true).control & TRB_DIR_IN, 0);
        assert_ne!(Trb::status_stage(false, true).control & TRB_DIR_IN, 0);
    }
}
