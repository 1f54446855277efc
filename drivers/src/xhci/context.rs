//! Device and input context layout (xHCI 1.2, section 6.2).
//!
//! Contexts are 32 or 64 bytes depending on HCCPARAMS1.CSZ. The output
//! (device) context holds the slot context followed by 31 endpoint
//! contexts; an input context prepends the input control context.

use crate::hw::DmaRegion;

use super::regs::UsbSpeed;

pub const EP_TYPE_CONTROL: u32 = 4;
pub const EP_TYPE_INTERRUPT_IN: u32 = 7;

/// Slot context plus 31 endpoint contexts.
pub const DEVICE_CONTEXT_ENTRIES: usize = 32;

/// Device Context Index of endpoint `number` in direction `dir_in`.
#[inline]
pub const fn endpoint_dci(number: u8, dir_in: bool) -> u8 {
    number * 2 + if dir_in { 1 } else { 0 }
}

/// Endpoint interval in 125 µs exponent form.
///
/// High/SuperSpeed `bInterval` is already an exponent (plus one); full and
/// low speed give frames, which are rounded down to a power of two.
pub fn xhci_interval(speed: UsbSpeed, b_interval: u8) -> u8 {
    match speed {
        UsbSpeed::High | UsbSpeed::Super => b_interval.clamp(1, 16) - 1,
        _ => {
            let microframes = (b_interval.max(1) as u32) * 8;
            (31 - microframes.leading_zeros()).clamp(3, 10) as u8
        }
    }
}

pub struct EndpointConfig {
    pub dci: u8,
    pub ep_type: u32,
    pub max_packet: u16,
    pub interval: u8,
    pub dequeue: u64,
    pub cycle: bool,
    pub average_trb_length: u16,
}

/// Input context builder over a zeroed DMA buffer.
pub struct InputContext<'a> {
    mem: &'a DmaRegion,
    ctx_size: usize,
}

impl<'a> InputContext<'a> {
    pub fn new(mem: &'a DmaRegion, ctx_size: usize) -> Self {
        mem.zero();
        Self { mem, ctx_size }
    }

    /// Bytes needed for an input context at `ctx_size`.
    pub const fn byte_len(ctx_size: usize) -> usize {
        ctx_size * (DEVICE_CONTEXT_ENTRIES + 1)
    }

    pub fn add_flags(&self, flags: u32) {
        self.mem.write::<u32>(4, flags);
    }

    #[inline]
    fn slot_offset(&self) -> usize {
        self.ctx_size
    }

    #[inline]
    fn ep_offset(&self, dci: u8) -> usize {
        self.ctx_size * (1 + dci as usize)
    }

    pub fn set_slot(&self, speed: UsbSpeed, root_port: u8, context_entries: u8) {
        let off = self.slot_offset();
        self.mem
            .write::<u32>(off, ((speed as u32) << 20) | ((context_entries as u32) << 27));
        self.mem.write::<u32>(off + 4, (root_port as u32) << 16);
    }

    pub fn set_endpoint(&self, ep: &EndpointConfig) {
        let off = self.ep_offset(ep.dci);
        self.mem.write::<u32>(off, (ep.interval as u32) << 16);
        // CErr = 3
        self.mem.write::<u32>(
            off + 4,
            (3 << 1) | (ep.ep_type << 3) | ((ep.max_packet as u32) << 16),
        );
        self.mem
            .write::<u64>(off + 8, ep.dequeue | if ep.cycle { 1 } else { 0 });
        let esit = if ep.ep_type == EP_TYPE_CONTROL {
            0
        } else {
            ep.max_packet as u32
        };
        self.mem
            .write::<u32>(off + 16, ep.average_trb_length as u32 | (esit << 16));
    }

    /// Read an endpoint's TR dequeue pointer back (used by tests and fakes).
    pub fn endpoint_dequeue(mem: &DmaRegion, ctx_size: usize, dci: u8) -> u64 {
        mem.read::<u64>(ctx_size * (1 + dci as usize) + 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::HeapDma;
    use crate::hw::DmaAllocator;

    #[test]
    fn interval_conversion() {
        assert_eq!(xhci_interval(UsbSpeed::High, 4), 3);
        assert_eq!(xhci_interval(UsbSpeed::Full, 10), 6);
        assert_eq!(xhci_interval(UsbSpeed::Low, 1), 3);
        assert_eq!(endpoint_dci(1, true), 3);
        assert_eq!(endpoint_dci(0, false), 0);
    }

    #[test]
    fn input_context_fields_land_at_csz_offsets() {
        for ctx_size in [32usize, 64] {
            let mem = HeapDma
                .alloc(InputContext::byte_len(ctx_size), 64)
                .expect("alloc");
            let ctx = InputContext::new(&mem, ctx_size);
            ctx.add_flags(0b11);
            ctx.set_slot(UsbSpeed::High, 2, 1);
            ctx.set_endpoint(&EndpointConfig {
                dci: 1,
                ep_type: EP_TYPE_CONTROL,
                max_packet: 64,
                interval: 0,
                dequeue: 0x4000,
                cycle: true,
                average_trb_length: 8,
            });

            assert_eq!(mem.read::<u32>(4), 0b11);
            assert_eq!(mem.read::<u32>(ctx_size), (3 << 20) | (1 << 27));
            assert_eq!(mem.read::<u32>(ctx_size + 4), 2 << 16);
            let ep0 = ctx_size * 2;
            assert_eq!(mem.read::<u32>(ep0 + 4), (3 << 1) | (4 << 3) | (64 << 16));
            assert_eq!(InputContext::endpoint_dequeue(&mem, ctx_size, 1), 0x4001);
        }
    }
}
