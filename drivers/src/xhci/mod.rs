//! xHCI host controller.
//!
//! One controller, one interrupter, one event ring. Port connect and
//! disconnect events are only recorded from interrupt context; enumeration
//! (which issues commands and waits for their completions) runs later from
//! [`XhciController::process_deferred_work`]. Interrupt IN completions are
//! handed straight to the registered [`HidHandler`] and re-armed.

pub mod context;
pub mod descriptors;
pub mod regs;
pub mod trb;

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use kestrel_lib::clock::{Deadline, wait_for};
use kestrel_lib::{Clock, IrqMutex, klog_debug, klog_error, klog_info, klog_warn};
use spin::Once;

use crate::hw::{DmaAllocator, DmaRegion, InterruptMode, IrqRouter, MmioRegion, Platform, RegisterIo};
use crate::msi::select_interrupt_mode;
use crate::pci::{ConfigAccess, PciBus};
use crate::pci_defs::{PCI_CLASS_SERIAL_BUS, PciDevice};

use context::{EP_TYPE_CONTROL, EP_TYPE_INTERRUPT_IN, EndpointConfig, InputContext, endpoint_dci, xhci_interval};
use descriptors::*;
use regs::*;
use trb::*;

const PCI_SUBCLASS_USB: u8 = 0x03;
const PCI_PROGIF_XHCI: u8 = 0x30;

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XhciError {
    NoController,
    NoMmioBar,
    MapFailed,
    OutOfMemory,
    HaltTimeout,
    ResetTimeout,
    StartTimeout,
    CommandTimeout,
    CommandFailed(u8),
    TransferFailed(u8),
    NoFreeSlot,
    PortResetTimeout,
    PortDisabled,
    BadDescriptor,
    AlreadyInitialized,
}

impl fmt::Display for XhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoController => f.write_str("no xHCI controller"),
            Self::NoMmioBar => f.write_str("BAR0 is not memory mapped"),
            Self::MapFailed => f.write_str("failed to map registers"),
            Self::OutOfMemory => f.write_str("out of DMA memory"),
            Self::HaltTimeout => f.write_str("controller did not halt"),
            Self::ResetTimeout => f.write_str("controller reset timed out"),
            Self::StartTimeout => f.write_str("controller did not start"),
            Self::CommandTimeout => f.write_str("command timed out"),
            Self::CommandFailed(cc) => write!(f, "command failed (cc={})", cc),
            Self::TransferFailed(cc) => write!(f, "control transfer failed (cc={})", cc),
            Self::NoFreeSlot => f.write_str("no device slot available"),
            Self::PortResetTimeout => f.write_str("port reset timed out"),
            Self::PortDisabled => f.write_str("port not enabled after reset"),
            Self::BadDescriptor => f.write_str("malformed descriptor"),
            Self::AlreadyInitialized => f.write_str("already initialized"),
        }
    }
}

// =============================================================================
// Devices
// =============================================================================

/// Snapshot of an addressed device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub slot_id: u8,
    pub port_id: u8,
    pub speed: UsbSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub configured: bool,
    pub interface_number: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    /// Endpoint number of the interrupt IN endpoint, 0 if none.
    pub interrupt_ep: u8,
    pub interrupt_max_packet: u16,
    pub interrupt_interval: u8,
    pub ep0_enqueue: usize,
    pub ep0_cycle: bool,
    pub interrupt_enqueue: usize,
    pub interrupt_cycle: bool,
}

/// Receiver for HID devices found during enumeration.
pub trait HidHandler: Sync {
    /// A boot-protocol HID interface was configured on `dev`.
    fn attach(&self, dev: &UsbDeviceInfo);
    fn detach(&self, dev: &UsbDeviceInfo);
    /// One interrupt IN report. Called with the controller lock held.
    fn report(&self, dev: &UsbDeviceInfo, data: &[u8]);
}

struct SlotState {
    info: UsbDeviceInfo,
    output_ctx: DmaRegion,
    input_ctx: DmaRegion,
    ep0: TrbRing,
    interrupt: Option<TrbRing>,
    ctrl_buf: DmaRegion,
    report_buf: DmaRegion,
    /// TRB of the outstanding interrupt transfer.
    pending_report: Option<u64>,
}

impl SlotState {
    fn snapshot(&self) -> UsbDeviceInfo {
        let mut info = self.info;
        info.ep0_enqueue = self.ep0.enqueue_index();
        info.ep0_cycle = self.ep0.cycle();
        if let Some(ring) = &self.interrupt {
            info.interrupt_enqueue = ring.enqueue_index();
            info.interrupt_cycle = ring.cycle();
        }
        info
    }

    fn report_len(&self) -> usize {
        (self.info.interrupt_max_packet as usize).clamp(1, REPORT_BUFFER_SIZE)
    }

    fn regions(&self) -> impl Iterator<Item = DmaRegion> + '_ {
        [
            self.output_ctx,
            self.input_ctx,
            self.ep0.region(),
            self.ctrl_buf,
            self.report_buf,
        ]
        .into_iter()
        .chain(self.interrupt.as_ref().map(|r| r.region()))
    }
}

struct XhciState {
    dcbaa: DmaRegion,
    commands: TrbRing,
    events: EventRing,
    slots: [Option<SlotState>; MAX_SLOTS + 1],
    /// Bit N set: port N reported a change not yet serviced.
    port_changes: u32,
}

impl XhciState {
    fn slot(&self, slot: u8) -> Option<&SlotState> {
        if slot == 0 {
            return None;
        }
        self.slots.get(slot as usize).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, slot: u8) -> Option<&mut SlotState> {
        if slot == 0 {
            return None;
        }
        self.slots.get_mut(slot as usize).and_then(|s| s.as_mut())
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct XhciController<R: RegisterIo> {
    regs: R,
    op: usize,
    rt: usize,
    db: usize,
    hci_version: u16,
    max_slots: u8,
    max_ports: u8,
    ctx_size: usize,
    dma: &'static dyn DmaAllocator,
    clock: &'static (dyn Clock + Sync),
    hid: Option<&'static dyn HidHandler>,
    mode: InterruptMode,
    running: AtomicBool,
    state: IrqMutex<XhciState>,
}

impl<R: RegisterIo> XhciController<R> {
    /// Halt, reset and program the controller. It is left halted with its
    /// rings in place; [`start`](Self::start) sets it running.
    pub fn bring_up(
        regs: R,
        dma: &'static dyn DmaAllocator,
        clock: &'static (dyn Clock + Sync),
        hid: Option<&'static dyn HidHandler>,
    ) -> Result<Self, XhciError> {
        let cap = regs.read32(CAP_CAPLENGTH);
        let op = (cap & 0xFF) as usize;
        let hci_version = (cap >> 16) as u16;
        let hcs1 = regs.read32(CAP_HCSPARAMS1);
        let max_slots = ((hcs1 & 0xFF) as usize).min(MAX_SLOTS) as u8;
        let max_ports = (((hcs1 >> 24) & 0xFF) as usize).min(MAX_PORTS) as u8;
        let ctx_size = if regs.read32(CAP_HCCPARAMS1) & HCCPARAMS1_CSZ != 0 {
            64
        } else {
            32
        };
        let db = (regs.read32(CAP_DBOFF) & !0x3) as usize;
        let rt = (regs.read32(CAP_RTSOFF) & !0x1F) as usize;

        let cmd = regs.read32(op + OP_USBCMD);
        if cmd & USBCMD_RS != 0 {
            regs.write32(op + OP_USBCMD, cmd & !(USBCMD_RS | USBCMD_INTE));
            if !wait_for(clock, Duration::from_millis(HALT_TIMEOUT_MS), || {
                regs.read32(op + OP_USBSTS) & USBSTS_HCH != 0
            }) {
                return Err(XhciError::HaltTimeout);
            }
        }

        regs.write32(op + OP_USBCMD, USBCMD_HCRST);
        if !wait_for(clock, Duration::from_millis(RESET_TIMEOUT_MS), || {
            regs.read32(op + OP_USBCMD) & USBCMD_HCRST == 0
                && regs.read32(op + OP_USBSTS) & USBSTS_CNR == 0
        }) {
            return Err(XhciError::ResetTimeout);
        }

        regs.write32(op + OP_CONFIG, max_slots as u32);

        let dcbaa = dma
            .alloc((MAX_SLOTS + 1) * 8, 64)
            .ok_or(XhciError::OutOfMemory)?;
        let scratchpads = scratchpad_count(regs.read32(CAP_HCSPARAMS2));
        if scratchpads > 0 {
            let page_size = ((regs.read32(op + OP_PAGESIZE) & 0xFFFF) as usize) << 12;
            let array = dma
                .alloc(scratchpads * 8, 64)
                .ok_or(XhciError::OutOfMemory)?;
            for i in 0..scratchpads {
                let page = dma
                    .alloc(page_size, page_size)
                    .ok_or(XhciError::OutOfMemory)?;
                array.write::<u64>(i * 8, page.phys);
            }
            dcbaa.write::<u64>(0, array.phys);
        }
        regs.write64(op + OP_DCBAAP, dcbaa.phys);

        let commands = TrbRing::new(dma, CMD_RING_SIZE).ok_or(XhciError::OutOfMemory)?;
        regs.write64(op + OP_CRCR, commands.phys() | CRCR_RCS);

        let events = EventRing::new(dma, EVT_RING_SIZE).ok_or(XhciError::OutOfMemory)?;
        regs.write32(rt + IR0_ERSTSZ, 1);
        regs.write64(rt + IR0_ERDP, events.dequeue_phys());
        regs.write64(rt + IR0_ERSTBA, events.erst_phys());
        regs.write32(rt + IR0_IMOD, IMOD_DEFAULT);

        klog_info!(
            "xhci: version {:x}.{:02x}, {} slots, {} ports, {}-byte contexts, {} scratchpads",
            hci_version >> 8,
            hci_version & 0xFF,
            max_slots,
            max_ports,
            ctx_size,
            scratchpads
        );

        Ok(Self {
            regs,
            op,
            rt,
            db,
            hci_version,
            max_slots,
            max_ports,
            ctx_size,
            dma,
            clock,
            hid,
            mode: InterruptMode::Polling,
            running: AtomicBool::new(false),
            state: IrqMutex::new(XhciState {
                dcbaa,
                commands,
                events,
                slots: [const { None }; MAX_SLOTS + 1],
                port_changes: 0,
            }),
        })
    }

    /// MSI, then the legacy line, then polling.
    pub fn select_interrupt_mode(
        &mut self,
        cfg: &dyn ConfigAccess,
        dev: &PciDevice,
        router: &dyn IrqRouter,
        handler: fn(),
        allow_interrupts: bool,
    ) -> InterruptMode {
        self.mode = if allow_interrupts {
            select_interrupt_mode(cfg, dev, router, handler)
        } else {
            InterruptMode::Polling
        };
        klog_info!("xhci: using {}", self.mode.name());
        self.mode
    }

    /// Run the controller and enumerate whatever is already plugged in.
    pub fn start(&self) -> Result<(), XhciError> {
        self.regs.write32(self.rt + IR0_IMAN, IMAN_IE | IMAN_IP);
        let mut cmd = self.op_read(OP_USBCMD) | USBCMD_RS;
        if self.mode != InterruptMode::Polling {
            cmd |= USBCMD_INTE;
        }
        self.op_write(OP_USBCMD, cmd);
        if !wait_for(self.clock, Duration::from_millis(HALT_TIMEOUT_MS), || {
            self.op_read(OP_USBSTS) & USBSTS_HCH == 0
        }) {
            return Err(XhciError::StartTimeout);
        }
        self.running.store(true, Ordering::Release);

        {
            let mut st = self.state.lock();
            for port in 1..=self.max_ports {
                if self.regs.read32(self.portsc_offset(port)) & PORTSC_CCS != 0 {
                    st.port_changes |= 1 << port;
                }
            }
        }
        self.process_deferred_work();
        Ok(())
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        self.mode
    }

    pub fn hci_version(&self) -> u16 {
        self.hci_version
    }

    pub fn max_slots(&self) -> u8 {
        self.max_slots
    }

    pub fn max_ports(&self) -> u8 {
        self.max_ports
    }

    pub fn context_size(&self) -> usize {
        self.ctx_size
    }

    #[inline]
    fn op_read(&self, reg: usize) -> u32 {
        self.regs.read32(self.op + reg)
    }

    #[inline]
    fn op_write(&self, reg: usize, value: u32) {
        self.regs.write32(self.op + reg, value)
    }

    #[inline]
    fn portsc_offset(&self, port: u8) -> usize {
        self.op + OP_PORTSC_BASE + (port as usize - 1) * OP_PORTSC_STRIDE
    }

    /// Doorbell 0 target 0 is the command ring; slot doorbells take a DCI.
    pub fn ring_doorbell(&self, slot: u8, target: u8) {
        self.regs.write32(self.db + slot as usize * 4, target as u32);
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    fn update_erdp(&self, st: &XhciState) {
        self.regs
            .write64(self.rt + IR0_ERDP, st.events.dequeue_phys() | ERDP_EHB);
    }

    /// Consume events until `matches` accepts one, dispatching the rest.
    fn wait_for_event(
        &self,
        st: &mut XhciState,
        timeout_ms: u64,
        mut matches: impl FnMut(&Trb) -> bool,
    ) -> Option<Trb> {
        let deadline = Deadline::after(self.clock, Duration::from_millis(timeout_ms));
        let found = deadline.spin_until(self.clock, || {
            let mut consumed = 0;
            while let Some(ev) = st.events.pop() {
                if matches(&ev) {
                    return Some(ev);
                }
                self.dispatch_event(st, ev);
                consumed += 1;
            }
            // Hand the slots back before spinning again.
            if consumed > 0 {
                self.update_erdp(st);
            }
            None
        });
        self.update_erdp(st);
        found.ok()
    }

    fn dispatch_event(&self, st: &mut XhciState, ev: Trb) {
        match ev.trb_type() {
            TRB_PORT_STATUS_CHANGE => {
                let port = ev.port_id();
                if (1..=self.max_ports).contains(&port) {
                    st.port_changes |= 1 << port;
                }
            }
            TRB_TRANSFER_EVENT => self.complete_interrupt_transfer(st, ev),
            TRB_COMMAND_COMPLETION => {
                klog_debug!("xhci: stray command completion cc={}", ev.completion_code())
            }
            other => klog_debug!("xhci: ignoring event type {}", other),
        }
    }

    fn complete_interrupt_transfer(&self, st: &mut XhciState, ev: Trb) {
        let slot = ev.slot_id();
        let Some(dev) = st.slot_mut(slot) else {
            return;
        };
        if dev.pending_report != Some(ev.param) {
            return;
        }
        dev.pending_report = None;

        let cc = ev.completion_code();
        if cc != CC_SUCCESS && cc != CC_SHORT_PACKET {
            klog_warn!("xhci: slot {} interrupt transfer failed (cc={})", slot, cc);
            return;
        }
        let got = dev.report_len().saturating_sub(ev.residual_length() as usize);
        if let Some(hid) = self.hid {
            let info = dev.snapshot();
            if let Some(report) = dev.report_buf.bytes(0, got) {
                hid.report(&info, report);
            }
        }
        self.arm_interrupt(st, slot);
    }

    /// Drain the event ring. Returns the number of events handled.
    pub fn poll_events(&self) -> usize {
        let mut st = self.state.lock();
        let mut handled = 0;
        while let Some(ev) = st.events.pop() {
            self.dispatch_event(&mut st, ev);
            handled += 1;
        }
        if handled > 0 {
            self.update_erdp(&st);
        }
        handled
    }

    pub fn handle_interrupt(&self) {
        let sts = self.op_read(OP_USBSTS);
        if sts & USBSTS_HSE != 0 {
            klog_error!("xhci: host system error");
        }
        let ack = sts & (USBSTS_EINT | USBSTS_PCD);
        if ack != 0 {
            self.op_write(OP_USBSTS, ack);
        }
        let iman = self.regs.read32(self.rt + IR0_IMAN);
        if iman & IMAN_IP != 0 {
            self.regs.write32(self.rt + IR0_IMAN, iman | IMAN_IP);
        }
        self.poll_events();
    }

    // -------------------------------------------------------------------------
    // Commands and transfers
    // -------------------------------------------------------------------------

    fn command(&self, trb: Trb) -> Option<Trb> {
        let mut st = self.state.lock();
        let phys = st.commands.push(trb);
        self.ring_doorbell(0, 0);
        let ev = self.wait_for_event(&mut st, COMMAND_TIMEOUT_MS, |ev| {
            ev.trb_type() == TRB_COMMAND_COMPLETION && ev.param == phys
        });
        if ev.is_none() {
            klog_warn!("xhci: command type {} timed out", trb.trb_type());
        }
        ev
    }

    /// Issue a command and wait for its completion. Returns the completion
    /// code, or [`CC_INVALID`] on timeout.
    pub fn send_command(&self, trb: Trb) -> u8 {
        self.command(trb).map_or(CC_INVALID, |ev| ev.completion_code())
    }

    /// Run a control transfer on EP0 of `slot`.
    ///
    /// IN data lands in `data[..setup.length]`; OUT data is taken from it.
    /// Returns the completion code ([`CC_INVALID`] on timeout or bad args).
    pub fn control_transfer(&self, slot: u8, setup: SetupPacket, data: &mut [u8]) -> u8 {
        let len = setup.length as usize;
        if len > CONTROL_BUFFER_SIZE || data.len() < len {
            return CC_INVALID;
        }
        let mut st = self.state.lock();
        let Some(dev) = st.slot_mut(slot) else {
            return CC_INVALID;
        };
        let dir_in = setup.is_in();
        if !dir_in && len > 0 {
            dev.ctrl_buf.copy_in(0, &data[..len]);
        }
        dev.ep0.push(Trb::setup_stage(setup));
        if len > 0 {
            dev.ep0
                .push(Trb::data_stage(dev.ctrl_buf.phys, setup.length, dir_in));
        }
        let status_trb = dev.ep0.push(Trb::status_stage(dir_in, len > 0));
        let ctrl_buf = dev.ctrl_buf;
        self.ring_doorbell(slot, 1);

        let ev = self.wait_for_event(&mut st, TRANSFER_TIMEOUT_MS, |ev| {
            ev.trb_type() == TRB_TRANSFER_EVENT
                && ev.slot_id() == slot
                && ev.endpoint_id() == 1
                && (ev.param == status_trb || ev.completion_code() != CC_SUCCESS)
        });
        let Some(ev) = ev else {
            klog_warn!(
                "xhci: slot {} control request {:#04x} timed out",
                slot,
                setup.request
            );
            return CC_INVALID;
        };
        let cc = ev.completion_code();
        if cc == CC_SUCCESS && dir_in && len > 0 {
            if let Some(bytes) = ctrl_buf.bytes(0, len) {
                data[..len].copy_from_slice(bytes);
            }
        }
        cc
    }

    fn control(&self, slot: u8, setup: SetupPacket, data: &mut [u8]) -> Result<(), XhciError> {
        match self.control_transfer(slot, setup, data) {
            CC_SUCCESS => Ok(()),
            cc => Err(XhciError::TransferFailed(cc)),
        }
    }

    fn arm_interrupt(&self, st: &mut XhciState, slot: u8) -> bool {
        let Some(dev) = st.slot_mut(slot) else {
            return false;
        };
        let len = dev.report_len() as u32;
        let buffer = dev.report_buf.phys;
        let Some(ring) = dev.interrupt.as_mut() else {
            return false;
        };
        dev.pending_report = Some(ring.push(Trb::normal(buffer, len)));
        self.ring_doorbell(slot, endpoint_dci(dev.info.interrupt_ep, true));
        true
    }

    /// Queue one interrupt IN transfer into the device's report buffer.
    pub fn queue_interrupt_transfer(&self, slot: u8) -> bool {
        let mut st = self.state.lock();
        if st.slot(slot).is_some_and(|d| d.pending_report.is_some()) {
            return true;
        }
        self.arm_interrupt(&mut st, slot)
    }

    // -------------------------------------------------------------------------
    // Ports and enumeration
    // -------------------------------------------------------------------------

    /// Service port changes recorded by the interrupt path.
    pub fn process_deferred_work(&self) {
        let changes = core::mem::take(&mut self.state.lock().port_changes);
        for port in 1..=self.max_ports {
            if changes & (1 << port) != 0 {
                self.service_port(port);
            }
        }
    }

    fn slot_on_port(&self, port: u8) -> Option<u8> {
        let st = self.state.lock();
        st.slots
            .iter()
            .flatten()
            .find(|d| d.info.port_id == port)
            .map(|d| d.info.slot_id)
    }

    fn service_port(&self, port: u8) {
        let off = self.portsc_offset(port);
        let portsc = self.regs.read32(off);
        self.regs
            .write32(off, (portsc & PORTSC_PRESERVE) | (portsc & PORTSC_CHANGE_BITS));

        let connected = portsc & PORTSC_CCS != 0;
        match (connected, self.slot_on_port(port)) {
            (true, None) => {
                if let Err(e) = self.attach_port(port) {
                    klog_warn!("xhci: port {} enumeration failed: {}", port, e);
                }
            }
            (false, Some(slot)) => self.detach_slot(slot),
            _ => {}
        }
    }

    fn reset_port(&self, port: u8) -> Result<UsbSpeed, XhciError> {
        let off = self.portsc_offset(port);
        let portsc = self.regs.read32(off);
        // USB3 ports train to enabled on their own.
        if portsc & PORTSC_PED == 0 {
            self.regs.write32(off, (portsc & PORTSC_PRESERVE) | PORTSC_PR);
            if !wait_for(self.clock, Duration::from_millis(PORT_RESET_TIMEOUT_MS), || {
                self.regs.read32(off) & PORTSC_PRC != 0
            }) {
                return Err(XhciError::PortResetTimeout);
            }
            let now = self.regs.read32(off);
            self.regs.write32(off, (now & PORTSC_PRESERVE) | PORTSC_PRC);
        }
        let portsc = self.regs.read32(off);
        if portsc & PORTSC_PED == 0 {
            return Err(XhciError::PortDisabled);
        }
        Ok(UsbSpeed::from_portsc(portsc))
    }

    fn alloc_slot_state(&self, slot: u8, port: u8, speed: UsbSpeed) -> Result<SlotState, XhciError> {
        let oom = XhciError::OutOfMemory;
        let ctx_bytes = InputContext::byte_len(self.ctx_size);
        Ok(SlotState {
            info: UsbDeviceInfo {
                slot_id: slot,
                port_id: port,
                speed,
                ..UsbDeviceInfo::default()
            },
            output_ctx: self.dma.alloc(ctx_bytes, 64).ok_or(oom)?,
            input_ctx: self.dma.alloc(ctx_bytes, 64).ok_or(oom)?,
            ep0: TrbRing::new(self.dma, XFER_RING_SIZE).ok_or(oom)?,
            interrupt: None,
            ctrl_buf: self.dma.alloc(CONTROL_BUFFER_SIZE, 64).ok_or(oom)?,
            report_buf: self.dma.alloc(REPORT_BUFFER_SIZE, 64).ok_or(oom)?,
            pending_report: None,
        })
    }

    fn attach_port(&self, port: u8) -> Result<u8, XhciError> {
        let speed = self.reset_port(port)?;
        let ev = self
            .command(Trb::enable_slot())
            .ok_or(XhciError::CommandTimeout)?;
        if ev.completion_code() != CC_SUCCESS {
            return Err(XhciError::CommandFailed(ev.completion_code()));
        }
        let slot = ev.slot_id();
        if slot == 0 || slot > self.max_slots {
            self.send_command(Trb::disable_slot(slot));
            return Err(XhciError::NoFreeSlot);
        }
        klog_info!("xhci: port {} {} device in slot {}", port, speed.name(), slot);

        let dev = match self.alloc_slot_state(slot, port, speed) {
            Ok(dev) => dev,
            Err(e) => {
                self.send_command(Trb::disable_slot(slot));
                return Err(e);
            }
        };
        let input_phys = {
            let input = InputContext::new(&dev.input_ctx, self.ctx_size);
            input.add_flags(0b11);
            input.set_slot(speed, port, 1);
            input.set_endpoint(&EndpointConfig {
                dci: 1,
                ep_type: EP_TYPE_CONTROL,
                max_packet: speed.default_ep0_max_packet(),
                interval: 0,
                dequeue: dev.ep0.phys(),
                cycle: true,
                average_trb_length: 8,
            });
            dev.input_ctx.phys
        };
        {
            let mut st = self.state.lock();
            st.dcbaa.write::<u64>(slot as usize * 8, dev.output_ctx.phys);
            st.slots[slot as usize] = Some(dev);
        }

        let result = self.configure_device(slot, input_phys);
        if result.is_err() {
            self.release_slot(slot);
        }
        result.map(|()| slot)
    }

    fn configure_device(&self, slot: u8, input_phys: u64) -> Result<(), XhciError> {
        match self.send_command(Trb::address_device(input_phys, slot)) {
            CC_SUCCESS => {}
            CC_INVALID => return Err(XhciError::CommandTimeout),
            cc => return Err(XhciError::CommandFailed(cc)),
        }

        let mut desc = [0u8; DEVICE_DESCRIPTOR_LEN as usize];
        self.control(slot, get_descriptor(DESC_DEVICE, 0, DEVICE_DESCRIPTOR_LEN), &mut desc)?;
        let device = DeviceDescriptor::parse(&desc).ok_or(XhciError::BadDescriptor)?;

        let mut header = [0u8; CONFIG_HEADER_LEN as usize];
        self.control(slot, get_descriptor(DESC_CONFIGURATION, 0, CONFIG_HEADER_LEN), &mut header)?;
        let total = config_total_length(&header)
            .ok_or(XhciError::BadDescriptor)?
            .clamp(CONFIG_HEADER_LEN, CONTROL_BUFFER_SIZE as u16);
        let mut config = vec![0u8; total as usize];
        self.control(slot, get_descriptor(DESC_CONFIGURATION, 0, total), &mut config)?;

        {
            let mut st = self.state.lock();
            if let Some(dev) = st.slot_mut(slot) {
                dev.info.vendor_id = device.vendor_id;
                dev.info.product_id = device.product_id;
            }
        }

        let Some(hid) = find_hid_interface(&config) else {
            klog_info!(
                "xhci: slot {} ({:04x}:{:04x}) has no HID interface",
                slot,
                device.vendor_id,
                device.product_id
            );
            return Ok(());
        };

        self.control(slot, set_configuration(hid.configuration_value), &mut [])?;
        self.configure_interrupt_endpoint(slot, &hid)?;

        if hid.subclass == HID_SUBCLASS_BOOT {
            self.control(slot, hid_set_boot_protocol(hid.interface_number), &mut [])?;
        }
        // Mice commonly stall SET_IDLE.
        let idle_rate = if hid.protocol == HID_PROTOCOL_KEYBOARD { HID_IDLE_RATE } else { 0 };
        if let Err(e) = self.control(slot, hid_set_idle(hid.interface_number, idle_rate), &mut []) {
            klog_debug!("xhci: slot {} SET_IDLE: {}", slot, e);
        }

        let info = {
            let mut st = self.state.lock();
            let Some(dev) = st.slot_mut(slot) else {
                return Err(XhciError::NoFreeSlot);
            };
            dev.info.configured = true;
            dev.snapshot()
        };
        klog_info!(
            "xhci: slot {} HID {}/{}/{} on EP{} IN, {} byte reports",
            slot,
            hid.class,
            hid.subclass,
            hid.protocol,
            hid.endpoint,
            hid.max_packet
        );
        if let Some(handler) = self.hid {
            handler.attach(&info);
        }
        self.queue_interrupt_transfer(slot);
        Ok(())
    }

    fn configure_interrupt_endpoint(&self, slot: u8, hid: &HidInterface) -> Result<(), XhciError> {
        let dci = endpoint_dci(hid.endpoint, true);
        let input_phys = {
            let mut st = self.state.lock();
            let Some(dev) = st.slot_mut(slot) else {
                return Err(XhciError::NoFreeSlot);
            };
            let ring = TrbRing::new(self.dma, XFER_RING_SIZE).ok_or(XhciError::OutOfMemory)?;
            let speed = dev.info.speed;
            let input = InputContext::new(&dev.input_ctx, self.ctx_size);
            input.add_flags(1 | (1 << dci));
            input.set_slot(speed, dev.info.port_id, dci);
            input.set_endpoint(&EndpointConfig {
                dci,
                ep_type: EP_TYPE_INTERRUPT_IN,
                max_packet: hid.max_packet,
                interval: xhci_interval(speed, hid.interval),
                dequeue: ring.phys(),
                cycle: true,
                average_trb_length: hid.max_packet,
            });
            dev.interrupt = Some(ring);
            dev.info.interface_number = hid.interface_number;
            dev.info.interface_class = hid.class;
            dev.info.interface_subclass = hid.subclass;
            dev.info.interface_protocol = hid.protocol;
            dev.info.interrupt_ep = hid.endpoint;
            dev.info.interrupt_max_packet = hid.max_packet;
            dev.info.interrupt_interval = hid.interval;
            dev.input_ctx.phys
        };
        match self.send_command(Trb::configure_endpoint(input_phys, slot)) {
            CC_SUCCESS => Ok(()),
            CC_INVALID => Err(XhciError::CommandTimeout),
            cc => Err(XhciError::CommandFailed(cc)),
        }
    }

    /// Disable the slot and free everything it owned.
    fn release_slot(&self, slot: u8) -> Option<UsbDeviceInfo> {
        let cc = self.send_command(Trb::disable_slot(slot));
        if cc != CC_SUCCESS {
            klog_debug!("xhci: disable slot {} cc={}", slot, cc);
        }
        let dev = {
            let mut st = self.state.lock();
            st.dcbaa.write::<u64>(slot as usize * 8, 0);
            st.slots.get_mut(slot as usize).and_then(Option::take)
        }?;
        let info = dev.snapshot();
        for region in dev.regions() {
            self.dma.release(region);
        }
        Some(info)
    }

    fn detach_slot(&self, slot: u8) {
        let Some(info) = self.release_slot(slot) else {
            return;
        };
        klog_info!("xhci: slot {} on port {} disconnected", slot, info.port_id);
        if info.configured {
            if let Some(handler) = self.hid {
                handler.detach(&info);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn device(&self, slot: u8) -> Option<UsbDeviceInfo> {
        self.state.lock().slot(slot).map(SlotState::snapshot)
    }

    pub fn devices(&self) -> Vec<UsbDeviceInfo> {
        self.state
            .lock()
            .slots
            .iter()
            .flatten()
            .map(SlotState::snapshot)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn regs(&self) -> &R {
        &self.regs
    }
}

/// Max Scratchpad Buffers, split across HCSPARAMS2 hi (9:5) and lo (4:0).
fn scratchpad_count(hcs2: u32) -> usize {
    let hi = (hcs2 >> 21) & 0x1F;
    let lo = (hcs2 >> 27) & 0x1F;
    ((hi << 5) | lo) as usize
}

// =============================================================================
// Global controller
// =============================================================================

static XHCI: Once<XhciController<MmioRegion>> = Once::new();

fn xhci_irq_handler() {
    if let Some(hc) = XHCI.get() {
        hc.handle_interrupt();
    }
}

/// Bring up the first xHCI controller on `bus` and enumerate its ports.
pub fn xhci_init(
    bus: &PciBus,
    platform: &Platform<'static>,
    hid: &'static dyn HidHandler,
    force_polling: bool,
) -> Result<&'static XhciController<MmioRegion>, XhciError> {
    if XHCI.is_completed() {
        return Err(XhciError::AlreadyInitialized);
    }
    let dev = bus
        .find_by_class(PCI_CLASS_SERIAL_BUS, PCI_SUBCLASS_USB, PCI_PROGIF_XHCI)
        .copied()
        .ok_or(XhciError::NoController)?;
    klog_info!(
        "xhci: controller {:04x}:{:04x} at {}",
        dev.vendor_id,
        dev.device_id,
        dev.addr
    );

    let bar = dev.bars[0];
    if !bar.is_mmio() {
        return Err(XhciError::NoMmioBar);
    }
    let regs = platform
        .mmio
        .map_mmio(bar.base, bar.size as usize)
        .ok_or(XhciError::MapFailed)?;
    bus.enable_bus_master(dev.addr);

    let mut hc = XhciController::bring_up(regs, platform.dma, platform.clock, Some(hid))?;
    hc.select_interrupt_mode(bus.config(), &dev, platform.irq, xhci_irq_handler, !force_polling);

    let hc = XHCI.call_once(|| hc);
    hc.start()?;
    Ok(hc)
}

pub fn xhci_controller() -> Option<&'static XhciController<MmioRegion>> {
    XHCI.get()
}

pub fn xhci_is_initialized() -> bool {
    XHCI.get().is_some_and(|hc| hc.is_running())
}

/// Enumerate or tear down devices whose ports changed since the last call.
pub fn xhci_process_deferred_work() {
    if let Some(hc) = XHCI.get() {
        hc.process_deferred_work();
    }
}

/// Poll-mode substitute for the interrupt handler.
pub fn xhci_poll() -> usize {
    XHCI.get().map_or(0, |hc| hc.poll_events())
}

pub fn xhci_device(slot: u8) -> Option<UsbDeviceInfo> {
    XHCI.get().and_then(|hc| hc.device(slot))
}
