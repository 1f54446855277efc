//! Intel E1000/E1000E gigabit Ethernet.
//!
//! Bring-up runs once on the boot CPU:
//!
//! ```text
//! Uninitialized -> Resetting -> PhyNegotiating -> RingsConfigured
//!               -> InterruptsSelected -> Running
//! ```
//!
//! After that the data path is `send_packet` (TX ring, its own lock) and
//! `poll` (RX ring, its own lock, behind a reentry gate so a receive
//! callback that ends up polling again backs off instead of deadlocking).

pub mod regs;
pub mod ring;

use core::fmt;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU8, Ordering};
use core::time::Duration;

use kestrel_lib::clock::{Deadline, delay};
use kestrel_lib::{Clock, IrqMutex, ReentryGuard, klog_debug, klog_info, klog_warn};
use spin::Once;

use crate::hw::{InterruptMode, IrqRouter, MmioRegion, Platform, RegisterIo};
use crate::msi::select_interrupt_mode;
use crate::net::netdev::{ETH_FRAME_MAX, NetDevice, NetDeviceFeatures, NetDeviceStats, StatsCounters};
use crate::net::types::{MacAddr, NetError};
use crate::pci::{ConfigAccess, PciBus};
use crate::pci_defs::PciDevice;

use regs::*;
use ring::{RxRing, TxRing};

/// Called once per received frame, in ring order.
pub type RxCallback = fn(&[u8]);

// =============================================================================
// Errors and state
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum E1000eError {
    NoDevice,
    NoMmioBar,
    MapFailed,
    OutOfMemory,
    ResetTimeout,
    PhyTimeout,
    EepromTimeout,
    AlreadyInitialized,
    NotReady,
    InvalidLength,
    TxRingFull,
}

impl fmt::Display for E1000eError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NoDevice => "no supported controller found",
            Self::NoMmioBar => "BAR0 is not a memory BAR",
            Self::MapFailed => "failed to map BAR0",
            Self::OutOfMemory => "DMA allocation failed",
            Self::ResetTimeout => "device reset did not complete",
            Self::PhyTimeout => "MDIC access timed out",
            Self::EepromTimeout => "EEPROM read timed out",
            Self::AlreadyInitialized => "already initialized",
            Self::NotReady => "device not running",
            Self::InvalidLength => "invalid frame length",
            Self::TxRingFull => "TX ring full",
        };
        f.write_str(msg)
    }
}

impl From<E1000eError> for NetError {
    fn from(e: E1000eError) -> Self {
        match e {
            E1000eError::InvalidLength => NetError::InvalidArgument,
            E1000eError::TxRingFull => NetError::NoBufferSpace,
            _ => NetError::DeviceNotReady,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NicState {
    Uninitialized = 0,
    Resetting = 1,
    PhyNegotiating = 2,
    RingsConfigured = 3,
    InterruptsSelected = 4,
    Running = 5,
}

impl NicState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Resetting,
            2 => Self::PhyNegotiating,
            3 => Self::RingsConfigured,
            4 => Self::InterruptsSelected,
            5 => Self::Running,
            _ => Self::Uninitialized,
        }
    }
}

// =============================================================================
// Bring-up helpers
// =============================================================================

/// Register-level init steps that only need the BAR and a clock.
struct Bringup<'a> {
    regs: &'a dyn RegisterIo,
    clock: &'a dyn Clock,
    variant: NicVariant,
}

impl Bringup<'_> {
    fn mask_and_ack(&self) {
        self.regs.write32(REG_IMC, 0xFFFF_FFFF);
        let _ = self.regs.read32(REG_ICR);
    }

    fn try_set_bit(&self, reg: usize, bit: u32) -> bool {
        for _ in 0..SEMAPHORE_ATTEMPTS {
            self.regs.set_bits32(reg, bit);
            if self.regs.read32(reg) & bit != 0 {
                return true;
            }
            spin_loop();
        }
        false
    }

    /// Take SMBI then SWFLAG so the management engine keeps off the PHY.
    fn acquire_sw_semaphore(&self) -> bool {
        if !self.try_set_bit(REG_SWSM, SWSM_SMBI) {
            klog_warn!("e1000e: SWSM.SMBI not granted, resetting anyway");
            return false;
        }
        if !self.try_set_bit(REG_EXTCNF_CTRL, EXTCNF_CTRL_SWFLAG) {
            self.regs.clear_bits32(REG_SWSM, SWSM_SMBI);
            klog_warn!("e1000e: EXTCNF_CTRL.SWFLAG not granted, resetting anyway");
            return false;
        }
        true
    }

    fn release_sw_semaphore(&self) {
        self.regs.clear_bits32(REG_EXTCNF_CTRL, EXTCNF_CTRL_SWFLAG);
        self.regs.clear_bits32(REG_SWSM, SWSM_SMBI);
    }

    fn reset(&self) -> Result<(), E1000eError> {
        self.mask_and_ack();

        let owned = self.variant.has_fw_semaphore() && self.acquire_sw_semaphore();

        self.regs.set_bits32(REG_CTRL, CTRL_RST);
        delay(self.clock, Duration::from_micros(RESET_SETTLE_US));
        let done = Deadline::after(self.clock, Duration::from_millis(RESET_TIMEOUT_MS))
            .spin_until(self.clock, || (self.regs.read32(REG_CTRL) & CTRL_RST == 0).then_some(()));

        if owned {
            self.release_sw_semaphore();
        }
        done.map_err(|_| E1000eError::ResetTimeout)?;

        self.mask_and_ack();

        let ctrl = self.regs.read32(REG_CTRL);
        let ctrl = (ctrl | CTRL_SLU) & !(CTRL_FRCSPD | CTRL_FRCDPLX | CTRL_LRST | CTRL_PHY_RST | CTRL_ILOS);
        self.regs.write32(REG_CTRL, ctrl);
        Ok(())
    }

    fn mdic(&self, command: u32) -> Result<u16, E1000eError> {
        self.regs.write32(REG_MDIC, command);
        let v = Deadline::after(self.clock, Duration::from_millis(MDIC_TIMEOUT_MS))
            .spin_until(self.clock, || {
                let v = self.regs.read32(REG_MDIC);
                (v & MDIC_READY != 0).then_some(v)
            })
            .map_err(|_| E1000eError::PhyTimeout)?;
        if v & MDIC_ERROR != 0 {
            return Err(E1000eError::PhyTimeout);
        }
        Ok((v & MDIC_DATA_MASK) as u16)
    }

    fn phy_read(&self, reg: u32) -> Result<u16, E1000eError> {
        self.mdic((reg << MDIC_REG_SHIFT) | (PHY_ADDR << MDIC_PHY_SHIFT) | MDIC_OP_READ)
    }

    fn phy_write(&self, reg: u32, value: u16) -> Result<(), E1000eError> {
        self.mdic(value as u32 | (reg << MDIC_REG_SHIFT) | (PHY_ADDR << MDIC_PHY_SHIFT) | MDIC_OP_WRITE)
            .map(|_| ())
    }

    /// Reset the PHY, advertise 10/100/1000 and restart autonegotiation.
    fn init_phy(&self) -> Result<(), E1000eError> {
        self.phy_write(PHY_CONTROL, PHY_CTRL_RESET)?;
        let mut last = Ok(PHY_CTRL_RESET);
        let settled = Deadline::after(self.clock, Duration::from_millis(PHY_RESET_TIMEOUT_MS)).spin_until(
            self.clock,
            || {
                last = self.phy_read(PHY_CONTROL);
                matches!(last, Ok(v) if v & PHY_CTRL_RESET == 0).then_some(())
            },
        );
        last?;
        settled.map_err(|_| E1000eError::PhyTimeout)?;

        let anar = self.phy_read(PHY_AUTONEG_ADV)?;
        self.phy_write(PHY_AUTONEG_ADV, anar | PHY_ANAR_10_100)?;
        let gbcr = self.phy_read(PHY_1000T_CTRL)?;
        self.phy_write(PHY_1000T_CTRL, gbcr | PHY_GBCR_1000)?;
        self.phy_write(PHY_CONTROL, PHY_CTRL_AUTONEG_EN | PHY_CTRL_RESTART_AN)
    }

    fn eeprom_read(&self, word: u8) -> Result<u16, E1000eError> {
        self.regs.write32(REG_EERD, self.variant.eerd_request(word));
        let done = self.variant.eerd_done();
        Deadline::after(self.clock, Duration::from_millis(EEPROM_TIMEOUT_MS))
            .spin_until(self.clock, || {
                let v = self.regs.read32(REG_EERD);
                (v & done != 0).then_some((v >> 16) as u16)
            })
            .map_err(|_| E1000eError::EepromTimeout)
    }

    /// Prefer the address firmware left in RAL/RAH, fall back to EEPROM words 0..2.
    fn read_mac(&self) -> Result<MacAddr, E1000eError> {
        let ral = self.regs.read32(REG_RAL);
        let mut mac = [0u8; 6];
        if ral != 0 {
            let rah = self.regs.read32(REG_RAH);
            mac[..4].copy_from_slice(&ral.to_le_bytes());
            mac[4..].copy_from_slice(&rah.to_le_bytes()[..2]);
        } else {
            for word in 0..3u8 {
                let w = self.eeprom_read(word)?.to_le_bytes();
                mac[word as usize * 2] = w[0];
                mac[word as usize * 2 + 1] = w[1];
            }
        }
        Ok(MacAddr(mac))
    }

    fn program_mac(&self, mac: MacAddr) {
        let m = mac.0;
        self.regs.write32(REG_RAL, u32::from_le_bytes([m[0], m[1], m[2], m[3]]));
        self.regs
            .write32(REG_RAH, u32::from_le_bytes([m[4], m[5], 0, 0]) | RAH_AV);
    }

    fn clear_multicast_table(&self) {
        for i in 0..MTA_ENTRIES {
            self.regs.write32(REG_MTA + i * 4, 0);
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

pub struct E1000e<R: RegisterIo> {
    regs: R,
    model: &'static SupportedNic,
    mac: MacAddr,
    state: AtomicU8,
    mode: InterruptMode,
    rx: IrqMutex<RxRing>,
    tx: IrqMutex<TxRing>,
    rx_guard: ReentryGuard,
    rx_callback: Once<RxCallback>,
    stats: StatsCounters,
}

impl<R: RegisterIo> E1000e<R> {
    /// Reset the controller, negotiate the PHY and program both rings.
    ///
    /// Leaves the device in `RingsConfigured` with every interrupt masked.
    pub fn bring_up(
        regs: R,
        model: &'static SupportedNic,
        dma: &dyn crate::hw::DmaAllocator,
        clock: &dyn Clock,
    ) -> Result<Self, E1000eError> {
        let rx = RxRing::allocate(dma)?;
        let tx = TxRing::allocate(dma)?;

        let mut nic = Self {
            regs,
            model,
            mac: MacAddr::ZERO,
            state: AtomicU8::new(NicState::Uninitialized as u8),
            mode: InterruptMode::Polling,
            rx: IrqMutex::new(rx),
            tx: IrqMutex::new(tx),
            rx_guard: ReentryGuard::new(),
            rx_callback: Once::new(),
            stats: StatsCounters::new(),
        };

        let hw = Bringup {
            regs: &nic.regs,
            clock,
            variant: model.variant,
        };

        nic.state.store(NicState::Resetting as u8, Ordering::Release);
        hw.reset()?;

        nic.state.store(NicState::PhyNegotiating as u8, Ordering::Release);
        if let Err(e) = hw.init_phy() {
            klog_warn!("e1000e: PHY init failed ({}), relying on firmware defaults", e);
        }

        let mac = hw.read_mac()?;
        hw.program_mac(mac);
        hw.clear_multicast_table();
        nic.mac = mac;

        nic.rx.get_mut().program(&nic.regs);
        nic.regs.write32(
            REG_RCTL,
            RCTL_EN | RCTL_BAM | RCTL_SECRC | RCTL_BSIZE_4096 | RCTL_BSEX,
        );
        nic.tx.get_mut().program(&nic.regs);
        nic.regs.write32(
            REG_TCTL,
            TCTL_EN | TCTL_PSP | (15 << TCTL_CT_SHIFT) | (64 << TCTL_COLD_SHIFT),
        );
        nic.regs.write32(REG_TIPG, TIPG_DEFAULT);
        nic.state.store(NicState::RingsConfigured as u8, Ordering::Release);

        klog_info!("e1000e: {} MAC {}", model.name, mac);
        Ok(nic)
    }

    /// Pick MSI, then legacy INTx, then polling. Interrupts stay masked
    /// until [`start`](Self::start).
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
        self.state
            .store(NicState::InterruptsSelected as u8, Ordering::Release);
        self.mode
    }

    /// Unmask the selected interrupt causes and mark the device running.
    pub fn start(&self) {
        if self.mode != InterruptMode::Polling {
            let _ = self.regs.read32(REG_ICR);
            self.regs.write32(REG_IMS, IMS_DEFAULT);
        }
        self.state.store(NicState::Running as u8, Ordering::Release);
        klog_info!(
            "e1000e: {} running, link {}, {}",
            self.model.name,
            if self.is_link_up() { "up" } else { "down" },
            self.mode.name()
        );
    }

    #[inline]
    pub fn state(&self) -> NicState {
        NicState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == NicState::Running
    }

    #[inline]
    pub fn interrupt_mode(&self) -> InterruptMode {
        self.mode
    }

    #[inline]
    pub fn model(&self) -> &'static SupportedNic {
        self.model
    }

    #[inline]
    pub fn mac_address(&self) -> MacAddr {
        self.mac
    }

    pub fn is_link_up(&self) -> bool {
        self.regs.read32(REG_STATUS) & STATUS_LU != 0
    }

    /// Register the frame consumer used by [`poll`](Self::poll) and the
    /// interrupt path. Only the first registration takes effect.
    pub fn set_rx_callback(&self, callback: RxCallback) -> bool {
        let mut installed = false;
        self.rx_callback.call_once(|| {
            installed = true;
            callback
        });
        if !installed {
            klog_warn!("e1000e: RX callback already registered");
        }
        installed
    }

    /// Queue one frame. Fails without blocking if the device is not running,
    /// the length is out of range or the slot at the tail is still in flight.
    pub fn send_packet(&self, frame: &[u8]) -> Result<(), E1000eError> {
        if !self.is_running() {
            return Err(E1000eError::NotReady);
        }
        if frame.is_empty() || frame.len() > ETH_FRAME_MAX {
            self.stats.record_tx_drop();
            return Err(E1000eError::InvalidLength);
        }
        let result = self.tx.lock().enqueue(frame, &self.regs);
        match result {
            Ok(()) => self.stats.record_tx(frame.len()),
            Err(E1000eError::TxRingFull) => {
                self.stats.record_tx_drop();
                klog_debug!("e1000e: TX ring full");
            }
            Err(_) => self.stats.record_tx_drop(),
        }
        result
    }

    /// Drain the RX ring into the registered callback.
    pub fn poll(&self) -> usize {
        let callback = self.rx_callback.get().copied();
        self.poll_with(&mut |frame| {
            if let Some(cb) = callback {
                cb(frame);
            }
        })
    }

    /// Drain the RX ring into `sink`. Returns 0 immediately if a poll is
    /// already in progress on this device.
    pub fn poll_with(&self, sink: &mut dyn FnMut(&[u8])) -> usize {
        if self.state() < NicState::RingsConfigured {
            return 0;
        }
        let Some(_token) = self.rx_guard.try_enter() else {
            return 0;
        };
        let mut rx = self.rx.lock();
        let mut delivered = 0;
        while let Some(done) = rx.next_completed() {
            let buf = rx.buffer(done.index);
            match buf.bytes(0, done.length as usize) {
                Some(frame) if done.is_whole_frame() && !frame.is_empty() => {
                    self.stats.record_rx(frame.len());
                    sink(frame);
                    delivered += 1;
                }
                _ => self.stats.record_rx_drop(),
            }
            rx.recycle(done.index, &self.regs);
        }
        delivered
    }

    /// Read-to-clear ICR and service the causes. Returns the cause bits.
    pub fn handle_interrupt(&self) -> u32 {
        let icr = self.regs.read32(REG_ICR);
        if icr == 0 {
            return 0;
        }
        if icr & ICR_LSC != 0 {
            klog_info!(
                "e1000e: link {}",
                if self.is_link_up() { "up" } else { "down" }
            );
        }
        if icr & ICR_RXO != 0 {
            klog_debug!("e1000e: RX overrun");
        }
        if icr & (ICR_RXT0 | ICR_RXDMT0 | ICR_RXO) != 0 {
            self.poll();
        }
        icr
    }

    pub fn statistics(&self) -> NetDeviceStats {
        self.stats.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn regs(&self) -> &R {
        &self.regs
    }
}

impl<R: RegisterIo + Send> NetDevice for E1000e<R> {
    fn send_frame(&self, frame: &[u8]) -> Result<(), NetError> {
        self.send_packet(frame).map_err(NetError::from)
    }

    fn poll_frames(&self, sink: &mut dyn FnMut(&[u8])) -> usize {
        self.poll_with(sink)
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn link_up(&self) -> bool {
        self.is_link_up()
    }

    fn stats(&self) -> NetDeviceStats {
        self.stats.snapshot()
    }

    fn features(&self) -> NetDeviceFeatures {
        let mut f = NetDeviceFeatures::INSERT_FCS | NetDeviceFeatures::STRIP_FCS | NetDeviceFeatures::PAD_SHORT;
        if self.mode != InterruptMode::Polling {
            f |= NetDeviceFeatures::RX_INTERRUPT;
        }
        f
    }
}

// =============================================================================
// Kernel singleton
// =============================================================================

static NIC: Once<E1000e<MmioRegion>> = Once::new();

fn e1000e_irq_handler() {
    if let Some(nic) = NIC.get() {
        nic.handle_interrupt();
    }
}

/// Find the first supported controller on `bus` and bring it to `Running`.
pub fn e1000e_init(
    bus: &PciBus,
    platform: &Platform<'_>,
    force_polling: bool,
) -> Result<&'static E1000e<MmioRegion>, E1000eError> {
    if NIC.is_completed() {
        return Err(E1000eError::AlreadyInitialized);
    }
    let (dev, model) = bus
        .devices()
        .iter()
        .find_map(|d| lookup_nic(d.vendor_id, d.device_id).map(|m| (*d, m)))
        .ok_or(E1000eError::NoDevice)?;

    klog_info!(
        "e1000e: found {} ({:04x}:{:04x}) at {}",
        model.name,
        dev.vendor_id,
        dev.device_id,
        dev.addr
    );

    let bar = dev.bars[0];
    if !bar.is_mmio() {
        return Err(E1000eError::NoMmioBar);
    }
    let regs = platform
        .mmio
        .map_mmio(bar.base, bar.size as usize)
        .ok_or(E1000eError::MapFailed)?;
    bus.enable_bus_master(dev.addr);

    let mut nic = E1000e::bring_up(regs, model, platform.dma, platform.clock)?;
    nic.select_interrupt_mode(
        bus.config(),
        &dev,
        platform.irq,
        e1000e_irq_handler,
        !force_polling,
    );

    let nic = NIC.call_once(|| nic);
    nic.start();
    Ok(nic)
}

pub fn e1000e_device() -> Option<&'static E1000e<MmioRegion>> {
    NIC.get()
}

pub fn e1000e_is_initialized() -> bool {
    NIC.get().is_some_and(|n| n.is_running())
}

pub fn e1000e_send_packet(frame: &[u8]) -> bool {
    NIC.get().is_some_and(|n| n.send_packet(frame).is_ok())
}

pub fn e1000e_set_rx_callback(callback: RxCallback) -> bool {
    NIC.get().is_some_and(|n| n.set_rx_callback(callback))
}

pub fn e1000e_poll() -> usize {
    NIC.get().map_or(0, |n| n.poll())
}

pub fn e1000e_mac() -> Option<MacAddr> {
    NIC.get().map(|n| n.mac_address())
}
