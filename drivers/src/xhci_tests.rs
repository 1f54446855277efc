//! xHCI bring-up and enumeration against an emulated controller.
//!
//! The fake walks the command and transfer rings when a doorbell is written
//! and posts completions into the event ring, so the driver's cycle-bit and
//! link handling is exercised for real.
//!
//! Covers:
//! - reset, scratchpads, command/event ring programming
//! - enumeration of a boot keyboard present at start (32- and 64-byte contexts)
//! - interrupt reports reaching the HID handler and being re-armed
//! - hotplug deferred until `process_deferred_work`, then disconnect
//! - command timeout, control transfer stalls and bad arguments
//! - the event ring drained and handed back while a command is pending

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use kestrel_lib::{Clock, IrqMutex, SteppingClock};
use spin::Once;

use crate::hw::{DmaRegion, RegisterIo};
use crate::test_fixtures::{HeapDma, RegFile};
use crate::xhci::context::InputContext;
use crate::xhci::descriptors::samples::{KEYBOARD_CONFIG, KEYBOARD_DEVICE};
use crate::xhci::descriptors::*;
use crate::xhci::regs::*;
use crate::xhci::trb::*;
use crate::xhci::{HidHandler, UsbDeviceInfo, XhciController};

const OP: usize = 0x40;
const RT: usize = 0x1000;
const DB: usize = 0x2000;
const PORTS: usize = 4;

const USBCMD: usize = OP + OP_USBCMD;
const USBSTS: usize = OP + OP_USBSTS;
const CRCR_LO: usize = OP + OP_CRCR;
const CRCR_HI: usize = OP + OP_CRCR + 4;
const DCBAAP: usize = OP + OP_DCBAAP;
const PORTSC1: usize = OP + OP_PORTSC_BASE;
const IMAN: usize = RT + IR0_IMAN;
const ERSTBA_LO: usize = RT + IR0_ERSTBA;
const ERSTBA_HI: usize = RT + IR0_ERSTBA + 4;
const ERDP_LO: usize = RT + IR0_ERDP;
const ERDP_HI: usize = RT + IR0_ERDP + 4;

const CC_SLOT_NOT_ENABLED: u8 = 11;

static CLOCK: SteppingClock = SteppingClock::new(10);

fn mem_at(addr: u64, len: usize) -> DmaRegion {
    DmaRegion {
        virt: addr,
        phys: addr,
        len,
    }
}

// =============================================================================
// Emulated controller
// =============================================================================

/// Consumer side of a producer ring, following Link TRBs.
#[derive(Clone, Copy, Debug)]
struct Cursor {
    ptr: u64,
    cycle: bool,
}

impl Cursor {
    fn from_dequeue(raw: u64) -> Self {
        Self {
            ptr: raw & !0xF,
            cycle: raw & 1 != 0,
        }
    }

    fn next(&mut self) -> Option<(u64, Trb)> {
        loop {
            let trb = Trb::read_from(&mem_at(self.ptr, TRB_SIZE), 0);
            if trb.cycle() != self.cycle {
                return None;
            }
            if trb.trb_type() == TRB_LINK {
                if trb.control & TRB_TC != 0 {
                    self.cycle = !self.cycle;
                }
                self.ptr = trb.param;
                continue;
            }
            let at = self.ptr;
            self.ptr += TRB_SIZE as u64;
            return Some((at, trb));
        }
    }
}

struct EventCursor {
    base: u64,
    size: usize,
    index: usize,
    cycle: bool,
    /// Slot the driver last reported through ERDP.
    consumer: usize,
}

#[derive(Default)]
struct FakeSlot {
    ep0: Option<Cursor>,
    interrupt: Option<(u8, Cursor)>,
    /// (TRB address, buffer, requested length) of the queued Normal TRB.
    pending: Option<(u64, u64, u32)>,
}

struct Emu {
    ctx_size: usize,
    commands_ring: Option<Cursor>,
    events: Option<EventCursor>,
    next_slot: u8,
    slots: BTreeMap<u8, FakeSlot>,
    root_ports: BTreeMap<u8, u8>,
    commands: Vec<u32>,
    requests: Vec<SetupPacket>,
    mute_commands: bool,
    stall_request: Option<u8>,
    device: Vec<u8>,
    config: Vec<u8>,
    /// Events lost because the ring was full.
    overflows: usize,
}

impl Emu {
    fn post(&mut self, trb: Trb) {
        let Some(ev) = self.events.as_mut() else {
            return;
        };
        if (ev.index + 1) % ev.size == ev.consumer {
            self.overflows += 1;
            return;
        }
        trb.write_to(&mem_at(ev.base, ev.size * TRB_SIZE), ev.index, ev.cycle);
        ev.index += 1;
        if ev.index == ev.size {
            ev.index = 0;
            ev.cycle = !ev.cycle;
        }
    }

    fn input(&self, phys: u64) -> DmaRegion {
        mem_at(phys, InputContext::byte_len(self.ctx_size))
    }

    fn execute(&mut self, trb: Trb) -> (u8, u8) {
        let slot = trb.slot_id();
        match trb.trb_type() {
            TRB_ENABLE_SLOT => {
                self.next_slot += 1;
                let slot = self.next_slot;
                self.slots.insert(slot, FakeSlot::default());
                (CC_SUCCESS, slot)
            }
            TRB_ADDRESS_DEVICE => {
                let input = self.input(trb.param);
                let deq = InputContext::endpoint_dequeue(&input, self.ctx_size, 1);
                let port = (input.read::<u32>(self.ctx_size + 4) >> 16) as u8;
                let Some(s) = self.slots.get_mut(&slot) else {
                    return (CC_SLOT_NOT_ENABLED, slot);
                };
                s.ep0 = Some(Cursor::from_dequeue(deq));
                self.root_ports.insert(slot, port);
                (CC_SUCCESS, slot)
            }
            TRB_CONFIGURE_ENDPOINT => {
                let input = self.input(trb.param);
                let flags = input.read::<u32>(4);
                let ctx_size = self.ctx_size;
                let Some(s) = self.slots.get_mut(&slot) else {
                    return (CC_SLOT_NOT_ENABLED, slot);
                };
                for dci in 2..32u8 {
                    if flags & (1 << dci) != 0 {
                        let deq = InputContext::endpoint_dequeue(&input, ctx_size, dci);
                        s.interrupt = Some((dci, Cursor::from_dequeue(deq)));
                    }
                }
                (CC_SUCCESS, slot)
            }
            TRB_DISABLE_SLOT => {
                self.slots.remove(&slot);
                (CC_SUCCESS, slot)
            }
            _ => (CC_SUCCESS, slot),
        }
    }

    fn run_commands(&mut self) -> bool {
        if self.mute_commands {
            return false;
        }
        let Some(mut cursor) = self.commands_ring else {
            return false;
        };
        let mut posted = false;
        while let Some((at, trb)) = cursor.next() {
            self.commands.push(trb.trb_type());
            let (cc, slot) = self.execute(trb);
            self.post(Trb {
                param: at,
                status: (cc as u32) << 24,
                control: (TRB_COMMAND_COMPLETION << TRB_TYPE_SHIFT) | ((slot as u32) << 24),
            });
            posted = true;
        }
        self.commands_ring = Some(cursor);
        posted
    }

    fn respond(&mut self, req: SetupPacket, data: Option<(u64, u32)>) -> u8 {
        self.requests.push(req);
        if self.stall_request == Some(req.request) {
            return CC_STALL;
        }
        if req.request == REQ_GET_DESCRIPTOR {
            let src = match (req.value >> 8) as u8 {
                DESC_DEVICE => &self.device,
                DESC_CONFIGURATION => &self.config,
                _ => return CC_STALL,
            };
            if let Some((buf, len)) = data {
                let n = src.len().min(len as usize);
                mem_at(buf, n).copy_in(0, &src[..n]);
            }
        }
        CC_SUCCESS
    }

    fn run_control(&mut self, slot: u8) -> bool {
        let Some(mut cursor) = self.slots.get(&slot).and_then(|s| s.ep0) else {
            return false;
        };
        let mut transfers = Vec::new();
        let mut setup = None;
        let mut data = None;
        while let Some((at, trb)) = cursor.next() {
            match trb.trb_type() {
                TRB_SETUP_STAGE => setup = Some(SetupPacket::from_u64(trb.param)),
                TRB_DATA_STAGE => data = Some((trb.param, trb.status & 0x1_FFFF)),
                TRB_STATUS_STAGE => {
                    transfers.push((setup.take().unwrap_or_default(), data.take(), at));
                }
                _ => {}
            }
        }
        if let Some(s) = self.slots.get_mut(&slot) {
            s.ep0 = Some(cursor);
        }
        let posted = !transfers.is_empty();
        for (req, data, at) in transfers {
            let cc = self.respond(req, data);
            self.post(Trb {
                param: at,
                status: (cc as u32) << 24,
                control: (TRB_TRANSFER_EVENT << TRB_TYPE_SHIFT) | (1 << 16) | ((slot as u32) << 24),
            });
        }
        posted
    }

    fn queue_interrupt(&mut self, slot: u8, target: u8) {
        let Some(s) = self.slots.get_mut(&slot) else {
            return;
        };
        let Some((dci, cursor)) = s.interrupt.as_mut() else {
            return;
        };
        if *dci != target {
            return;
        }
        while let Some((at, trb)) = cursor.next() {
            if trb.trb_type() == TRB_NORMAL {
                s.pending = Some((at, trb.param, trb.status & 0x1_FFFF));
            }
        }
    }
}

struct FakeXhci {
    regs: RegFile,
    emu: IrqMutex<Emu>,
}

impl FakeXhci {
    fn new(ctx64: bool) -> Self {
        let fake = Self {
            regs: RegFile::new(),
            emu: IrqMutex::new(Emu {
                ctx_size: if ctx64 { 64 } else { 32 },
                commands_ring: None,
                events: None,
                next_slot: 0,
                slots: BTreeMap::new(),
                root_ports: BTreeMap::new(),
                commands: Vec::new(),
                requests: Vec::new(),
                mute_commands: false,
                stall_request: None,
                device: KEYBOARD_DEVICE.to_vec(),
                config: KEYBOARD_CONFIG.to_vec(),
                overflows: 0,
            }),
        };
        let r = &fake.regs;
        r.set(CAP_CAPLENGTH, (0x0110 << 16) | OP as u32);
        r.set(CAP_HCSPARAMS1, 32 | ((PORTS as u32) << 24));
        r.set(CAP_HCCPARAMS1, if ctx64 { HCCPARAMS1_CSZ } else { 0 });
        r.set(CAP_DBOFF, DB as u32);
        r.set(CAP_RTSOFF, RT as u32);
        r.set(OP + OP_PAGESIZE, 1);
        // Firmware left it running.
        r.set(USBCMD, USBCMD_RS);
        for port in 0..PORTS {
            r.set(PORTSC1 + port * OP_PORTSC_STRIDE, PORTSC_PP);
        }
        fake
    }

    fn portsc(port: u8) -> usize {
        PORTSC1 + (port as usize - 1) * OP_PORTSC_STRIDE
    }

    fn raise(&self) {
        self.regs.set(USBSTS, self.regs.get(USBSTS) | USBSTS_EINT);
        self.regs.set(IMAN, self.regs.get(IMAN) | IMAN_IP);
    }

    fn post_port_change(&self, port: u8) {
        self.emu.lock().post(Trb {
            param: (port as u64) << 24,
            status: (CC_SUCCESS as u32) << 24,
            control: TRB_PORT_STATUS_CHANGE << TRB_TYPE_SHIFT,
        });
        self.raise();
    }

    /// Device present before the driver starts; no event.
    fn plug(&self, port: u8, speed: UsbSpeed) {
        self.regs.set(
            Self::portsc(port),
            PORTSC_CCS | PORTSC_PP | PORTSC_CSC | ((speed as u32) << PORTSC_SPEED_SHIFT),
        );
    }

    fn connect(&self, port: u8, speed: UsbSpeed) {
        self.plug(port, speed);
        self.post_port_change(port);
    }

    fn disconnect(&self, port: u8) {
        self.regs.set(Self::portsc(port), PORTSC_PP | PORTSC_CSC);
        self.post_port_change(port);
    }

    /// Complete the queued interrupt transfer of `slot` with `data`.
    fn send_report(&self, slot: u8, data: &[u8]) -> bool {
        let mut emu = self.emu.lock();
        let Some((dci, _)) = emu.slots.get(&slot).and_then(|s| s.interrupt) else {
            return false;
        };
        let Some((at, buf, len)) = emu.slots.get_mut(&slot).and_then(|s| s.pending.take()) else {
            return false;
        };
        let n = data.len().min(len as usize);
        mem_at(buf, n).copy_in(0, &data[..n]);
        let cc = if n == len as usize { CC_SUCCESS } else { CC_SHORT_PACKET };
        emu.post(Trb {
            param: at,
            status: ((cc as u32) << 24) | (len - n as u32),
            control: (TRB_TRANSFER_EVENT << TRB_TYPE_SHIFT)
                | ((dci as u32) << 16)
                | ((slot as u32) << 24),
        });
        drop(emu);
        self.raise();
        true
    }

    fn has_pending_report(&self, slot: u8) -> bool {
        self.emu
            .lock()
            .slots
            .get(&slot)
            .is_some_and(|s| s.pending.is_some())
    }

    fn dcbaa_entry(&self, slot: u8) -> u64 {
        let base = self.regs.get(DCBAAP) as u64 | ((self.regs.get(DCBAAP + 4) as u64) << 32);
        mem_at(base, (MAX_SLOTS + 1) * 8).read::<u64>(slot as usize * 8)
    }

    fn write_portsc(&self, offset: usize, value: u32) {
        let cur = self.regs.get(offset);
        let mut next = cur & !(value & PORTSC_CHANGE_BITS);
        if value & PORTSC_PR != 0 && cur & PORTSC_CCS != 0 {
            next |= PORTSC_PED | PORTSC_PRC;
        }
        self.regs.set(offset, next);
    }

    fn doorbell(&self, slot: u8, target: u8) {
        let mut emu = self.emu.lock();
        let posted = if slot == 0 {
            emu.run_commands()
        } else if target == 1 {
            emu.run_control(slot)
        } else {
            emu.queue_interrupt(slot, target);
            false
        };
        drop(emu);
        if posted {
            self.raise();
        }
    }
}

impl RegisterIo for FakeXhci {
    fn read32(&self, offset: usize) -> u32 {
        self.regs.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        match offset {
            USBCMD => {
                if value & USBCMD_HCRST != 0 {
                    self.regs.set(USBCMD, 0);
                    self.regs.set(USBSTS, USBSTS_HCH);
                    return;
                }
                self.regs.set(USBCMD, value);
                let sts = self.regs.get(USBSTS);
                let sts = if value & USBCMD_RS != 0 {
                    sts & !USBSTS_HCH
                } else {
                    sts | USBSTS_HCH
                };
                self.regs.set(USBSTS, sts);
            }
            USBSTS => {
                let clear = value & (USBSTS_EINT | USBSTS_PCD | USBSTS_HSE);
                self.regs.set(USBSTS, self.regs.get(USBSTS) & !clear);
            }
            CRCR_HI => {
                self.regs.set(offset, value);
                let lo = self.regs.get(CRCR_LO);
                let ptr = (lo & !0x3F) as u64 | ((value as u64) << 32);
                self.emu.lock().commands_ring = Some(Cursor {
                    ptr,
                    cycle: lo & 1 != 0,
                });
            }
            IMAN => {
                let cur = self.regs.get(IMAN);
                let ip = cur & IMAN_IP & !(value & IMAN_IP);
                self.regs.set(IMAN, (value & IMAN_IE) | ip);
            }
            ERSTBA_HI => {
                self.regs.set(offset, value);
                let erst_phys = self.regs.get(ERSTBA_LO) as u64 | ((value as u64) << 32);
                let erst = mem_at(erst_phys, 16);
                self.emu.lock().events = Some(EventCursor {
                    base: erst.read::<u64>(0),
                    size: erst.read::<u32>(8) as usize,
                    index: 0,
                    cycle: true,
                    consumer: 0,
                });
            }
            ERDP_HI => {
                self.regs.set(offset, value);
                let erdp = (self.regs.get(ERDP_LO) as u64 & !0xF) | ((value as u64) << 32);
                if let Some(ev) = self.emu.lock().events.as_mut() {
                    ev.consumer = ((erdp - ev.base) / TRB_SIZE as u64) as usize;
                }
            }
            o if (PORTSC1..PORTSC1 + PORTS * OP_PORTSC_STRIDE).contains(&o) => {
                self.write_portsc(o, value)
            }
            o if (DB..DB + 4 * (MAX_SLOTS + 1)).contains(&o) => {
                self.regs.set(o, value);
                self.doorbell(((o - DB) / 4) as u8, value as u8);
            }
            _ => self.regs.set(offset, value),
        }
    }
}

// =============================================================================
// HID recorder
// =============================================================================

#[derive(Default)]
struct RecordingHid {
    attached: IrqMutex<Vec<UsbDeviceInfo>>,
    detached: IrqMutex<Vec<u8>>,
    reports: IrqMutex<Vec<Vec<u8>>>,
}

impl HidHandler for RecordingHid {
    fn attach(&self, dev: &UsbDeviceInfo) {
        self.attached.lock().push(*dev);
    }

    fn detach(&self, dev: &UsbDeviceInfo) {
        self.detached.lock().push(dev.slot_id);
    }

    fn report(&self, _dev: &UsbDeviceInfo, data: &[u8]) {
        self.reports.lock().push(data.to_vec());
    }
}

fn recorder() -> &'static RecordingHid {
    Box::leak(Box::new(RecordingHid::default()))
}

fn controller(fake: FakeXhci, hid: &'static RecordingHid) -> XhciController<FakeXhci> {
    let hid: &'static dyn HidHandler = hid;
    XhciController::bring_up(fake, &HeapDma, &CLOCK, Some(hid)).expect("bring-up")
}

fn started_with_keyboard(ctx64: bool) -> (XhciController<FakeXhci>, &'static RecordingHid) {
    let fake = FakeXhci::new(ctx64);
    fake.plug(1, UsbSpeed::Full);
    let hid = recorder();
    let hc = controller(fake, hid);
    hc.start().expect("start");
    (hc, hid)
}

// =============================================================================
// Bring-up
// =============================================================================

#[test]
fn bring_up_resets_and_programs_rings() {
    let fake = FakeXhci::new(false);
    // Two scratchpad buffers (Max Scratchpad Bufs Lo).
    fake.regs.set(CAP_HCSPARAMS2, 2 << 27);
    let hc = controller(fake, recorder());
    let r = &hc.regs().regs;

    assert_eq!(hc.hci_version(), 0x0110);
    assert_eq!(hc.max_slots(), MAX_SLOTS as u8);
    assert_eq!(hc.max_ports(), PORTS as u8);
    assert_eq!(hc.context_size(), 32);
    assert_eq!(r.get(OP + OP_CONFIG), MAX_SLOTS as u32);

    // Halted until start().
    assert_ne!(r.get(USBSTS) & USBSTS_HCH, 0);
    assert!(!hc.is_running());

    assert_eq!(r.get(CRCR_LO) as u64 & CRCR_RCS, CRCR_RCS);
    assert_eq!(r.get(RT + IR0_ERSTSZ), 1);
    assert_eq!(r.get(RT + IR0_IMOD), IMOD_DEFAULT);
    assert_ne!(r.get(ERSTBA_LO), 0);

    let scratch_array = hc.regs().dcbaa_entry(0);
    assert_ne!(scratch_array, 0);
    let array = mem_at(scratch_array, 16);
    assert_ne!(array.read::<u64>(0), 0);
    assert_ne!(array.read::<u64>(8), 0);
}

#[test]
fn halt_timeout_is_reported() {
    struct StuckRunning(FakeXhci);

    impl RegisterIo for StuckRunning {
        fn read32(&self, offset: usize) -> u32 {
            if offset == USBSTS {
                return 0;
            }
            self.0.read32(offset)
        }

        fn write32(&self, offset: usize, value: u32) {
            self.0.write32(offset, value)
        }
    }

    let result = XhciController::bring_up(StuckRunning(FakeXhci::new(false)), &HeapDma, &CLOCK, None);
    assert_eq!(result.err(), Some(crate::xhci::XhciError::HaltTimeout));
}

// =============================================================================
// Enumeration
// =============================================================================

#[test]
fn enumerates_boot_keyboard_present_at_start() {
    for ctx64 in [false, true] {
        let (hc, hid) = started_with_keyboard(ctx64);
        assert!(hc.is_running());
        assert_eq!(hc.context_size(), if ctx64 { 64 } else { 32 });

        let dev = hc.device(1).expect("slot 1");
        assert_eq!(dev.port_id, 1);
        assert_eq!(dev.speed, UsbSpeed::Full);
        assert_eq!(dev.vendor_id, 0x0627);
        assert_eq!(dev.product_id, 0x0001);
        assert!(dev.configured);
        assert_eq!(dev.interface_protocol, HID_PROTOCOL_KEYBOARD);
        assert_eq!(dev.interrupt_ep, 1);
        assert_eq!(dev.interrupt_max_packet, 8);
        assert_eq!(dev.interrupt_interval, 10);
        assert_eq!(dev.interrupt_enqueue, 1);
        assert_eq!(hc.devices().len(), 1);

        let attached: Vec<(u8, u8)> = hid
            .attached
            .lock()
            .iter()
            .map(|d| (d.slot_id, d.interface_protocol))
            .collect();
        assert_eq!(attached, [(1, HID_PROTOCOL_KEYBOARD)]);
        assert!(hc.regs().has_pending_report(1));
        assert_ne!(hc.regs().dcbaa_entry(1), 0);

        let emu = hc.regs().emu.lock();
        assert_eq!(
            emu.commands,
            [TRB_ENABLE_SLOT, TRB_ADDRESS_DEVICE, TRB_CONFIGURE_ENDPOINT]
        );
        let requests: Vec<u8> = emu.requests.iter().map(|r| r.request).collect();
        assert_eq!(
            requests,
            [
                REQ_GET_DESCRIPTOR,
                REQ_GET_DESCRIPTOR,
                REQ_GET_DESCRIPTOR,
                REQ_SET_CONFIGURATION,
                HID_REQ_SET_PROTOCOL,
                HID_REQ_SET_IDLE,
            ]
        );
        assert_eq!(emu.requests[0].length, DEVICE_DESCRIPTOR_LEN);
        assert_eq!(emu.requests[1].length, CONFIG_HEADER_LEN);
        assert_eq!(emu.requests[2].length, KEYBOARD_CONFIG.len() as u16);
        assert_eq!(emu.requests[3].value, 1);
        assert_eq!(emu.requests[5].value, HID_IDLE_RATE << 8);
        assert_eq!(emu.root_ports.get(&1), Some(&1));
    }
}

#[test]
fn reports_reach_handler_and_transfer_is_rearmed() {
    let (hc, hid) = started_with_keyboard(false);
    let before = hc.device(1).expect("slot 1").interrupt_enqueue;

    assert!(hc.regs().send_report(1, &[0x02, 0, 0x04, 0, 0, 0, 0, 0]));
    assert_eq!(hc.poll_events(), 1);
    assert_eq!(hid.reports.lock().as_slice(), &[vec![0x02, 0, 0x04, 0, 0, 0, 0, 0]]);
    assert!(hc.regs().has_pending_report(1));
    assert_eq!(hc.device(1).expect("slot 1").interrupt_enqueue, before + 1);

    // Short packet: only the bytes actually transferred are delivered.
    assert!(hc.regs().send_report(1, &[0x00, 0x00, 0x00]));
    hc.handle_interrupt();
    assert_eq!(hid.reports.lock().last().map(|r| r.len()), Some(3));
    assert_eq!(hc.regs().regs.get(USBSTS) & USBSTS_EINT, 0);
    assert_eq!(hc.regs().regs.get(IMAN) & IMAN_IP, 0);
}

#[test]
fn queue_interrupt_transfer_does_not_double_queue() {
    let (hc, _hid) = started_with_keyboard(false);
    let before = hc.device(1).expect("slot 1").interrupt_enqueue;
    assert!(hc.queue_interrupt_transfer(1));
    assert_eq!(hc.device(1).expect("slot 1").interrupt_enqueue, before);
    assert!(!hc.queue_interrupt_transfer(7));
}

#[test]
fn hotplug_is_deferred_until_process_deferred_work() {
    let hid = recorder();
    let hc = controller(FakeXhci::new(false), hid);
    hc.start().expect("start");
    assert!(hc.devices().is_empty());

    hc.regs().connect(3, UsbSpeed::High);
    hc.handle_interrupt();
    assert!(hc.device(1).is_none());

    hc.process_deferred_work();
    let dev = hc.device(1).expect("enumerated");
    assert_eq!(dev.port_id, 3);
    assert_eq!(dev.speed, UsbSpeed::High);
    assert_eq!(hid.attached.lock().len(), 1);

    hc.regs().disconnect(3);
    assert_eq!(hc.poll_events(), 1);
    assert!(hc.device(1).is_some());
    hc.process_deferred_work();

    assert!(hc.device(1).is_none());
    assert_eq!(hid.detached.lock().as_slice(), &[1]);
    assert_eq!(hc.regs().emu.lock().commands.last(), Some(&TRB_DISABLE_SLOT));
    assert_eq!(hc.regs().dcbaa_entry(1), 0);
}

#[test]
fn device_without_hid_interface_is_addressed_only() {
    let fake = FakeXhci::new(false);
    // Interface class: mass storage.
    fake.emu.lock().config[9 + 5] = 0x08;
    fake.plug(2, UsbSpeed::High);
    let hid = recorder();
    let hc = controller(fake, hid);
    hc.start().expect("start");

    let dev = hc.device(1).expect("addressed");
    assert!(!dev.configured);
    assert_eq!(dev.interrupt_ep, 0);
    assert!(hid.attached.lock().is_empty());
    assert!(!hc.regs().has_pending_report(1));
    assert_eq!(hc.regs().emu.lock().requests.len(), 3);
}

#[test]
fn stalled_set_idle_does_not_fail_enumeration() {
    let fake = FakeXhci::new(false);
    fake.emu.lock().stall_request = Some(HID_REQ_SET_IDLE);
    fake.plug(1, UsbSpeed::Low);
    let hid = recorder();
    let hc = controller(fake, hid);
    hc.start().expect("start");

    assert!(hc.device(1).is_some_and(|d| d.configured));
    assert_eq!(hid.attached.lock().len(), 1);
}

#[test]
fn failed_enumeration_releases_the_slot() {
    let fake = FakeXhci::new(false);
    fake.emu.lock().stall_request = Some(REQ_SET_CONFIGURATION);
    fake.plug(1, UsbSpeed::Full);
    let hid = recorder();
    let hc = controller(fake, hid);
    hc.start().expect("start");

    assert!(hc.device(1).is_none());
    assert!(hid.attached.lock().is_empty());
    assert_eq!(hc.regs().emu.lock().commands.last(), Some(&TRB_DISABLE_SLOT));
}

// =============================================================================
// Commands and control transfers
// =============================================================================

#[test]
fn command_timeout_returns_invalid_code() {
    let fake = FakeXhci::new(false);
    fake.emu.lock().mute_commands = true;
    let hc = controller(fake, recorder());
    assert_eq!(hc.send_command(Trb::noop_command()), CC_INVALID);
}

/// Posts a port change every few reads once `FLOODED` is set, so events
/// keep arriving while the driver spins on a command.
struct FloodClock {
    inner: SteppingClock,
    reads: AtomicUsize,
}

impl Clock for FloodClock {
    fn now_us(&self) -> u64 {
        if let Some(hc) = FLOODED.get() {
            if self.reads.fetch_add(1, Ordering::Relaxed) % 4 == 0 {
                hc.regs().post_port_change(2);
            }
        }
        self.inner.now_us()
    }
}

static FLOOD_CLOCK: FloodClock = FloodClock {
    inner: SteppingClock::new(10),
    reads: AtomicUsize::new(0),
};
static FLOODED: Once<&'static XhciController<FakeXhci>> = Once::new();

#[test]
fn events_during_a_command_wait_do_not_overflow_the_ring() {
    let fake = FakeXhci::new(false);
    fake.emu.lock().mute_commands = true;
    let hid: &'static dyn HidHandler = recorder();
    let hc = XhciController::bring_up(fake, &HeapDma, &FLOOD_CLOCK, Some(hid)).expect("bring-up");
    hc.start().expect("start");
    let hc: &'static XhciController<FakeXhci> = Box::leak(Box::new(hc));
    FLOODED.call_once(|| hc);

    assert_eq!(hc.send_command(Trb::noop_command()), CC_INVALID);
    let emu = hc.regs().emu.lock();
    let ev = emu.events.as_ref().expect("event ring");
    assert!(FLOOD_CLOCK.reads.load(Ordering::Relaxed) / 4 > ev.size, "more events than slots");
    assert_eq!(emu.overflows, 0);
}

#[test]
fn noop_command_completes() {
    let hc = controller(FakeXhci::new(false), recorder());
    assert_eq!(hc.send_command(Trb::noop_command()), CC_SUCCESS);
    assert_eq!(hc.regs().emu.lock().commands, [TRB_NOOP_CMD]);
}

#[test]
fn control_transfer_edge_cases() {
    let (hc, _hid) = started_with_keyboard(false);
    let mut buf = [0u8; 18];

    assert_eq!(
        hc.control_transfer(9, get_descriptor(DESC_DEVICE, 0, 18), &mut buf),
        CC_INVALID
    );
    assert_eq!(
        hc.control_transfer(1, get_descriptor(DESC_DEVICE, 0, 64), &mut buf),
        CC_INVALID
    );
    // String descriptors are not emulated: the device stalls.
    assert_eq!(hc.control_transfer(1, get_descriptor(3, 0, 4), &mut buf), CC_STALL);

    // EP0 keeps working after the stall.
    assert_eq!(
        hc.control_transfer(1, get_descriptor(DESC_DEVICE, 0, 18), &mut buf),
        CC_SUCCESS
    );
    assert_eq!(buf, KEYBOARD_DEVICE);
}
