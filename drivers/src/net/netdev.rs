//! Network device abstraction.
//!
//! The boundary between drivers (which move frames) and the stack (which
//! understands protocols). Methods take `&self`; drivers keep their ring
//! state behind interior locks so a frame handler may transmit while the
//! receive side is being drained.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::types::{MacAddr, NetError};

/// Largest Ethernet frame without FCS (14-byte header + 1500 payload + 4 VLAN).
pub const ETH_FRAME_MAX: usize = 1518;
pub const ETH_MTU: u16 = 1500;

pub trait NetDevice: Send + Sync {
    /// Queue one frame for transmission. Never blocks; a full ring is
    /// reported as `NoBufferSpace`.
    fn send_frame(&self, frame: &[u8]) -> Result<(), NetError>;

    /// Drain received frames in ring order, handing each to `sink`.
    ///
    /// Returns the number of frames delivered. A nested call made from
    /// inside `sink` returns 0 without touching the ring.
    fn poll_frames(&self, sink: &mut dyn FnMut(&[u8])) -> usize;

    fn mac(&self) -> MacAddr;

    fn mtu(&self) -> u16 {
        ETH_MTU
    }

    fn link_up(&self) -> bool;

    fn stats(&self) -> NetDeviceStats;

    fn features(&self) -> NetDeviceFeatures {
        NetDeviceFeatures::empty()
    }
}

impl<T: NetDevice + ?Sized> NetDevice for &T {
    fn send_frame(&self, frame: &[u8]) -> Result<(), NetError> {
        (**self).send_frame(frame)
    }

    fn poll_frames(&self, sink: &mut dyn FnMut(&[u8])) -> usize {
        (**self).poll_frames(sink)
    }

    fn mac(&self) -> MacAddr {
        (**self).mac()
    }

    fn mtu(&self) -> u16 {
        (**self).mtu()
    }

    fn link_up(&self) -> bool {
        (**self).link_up()
    }

    fn stats(&self) -> NetDeviceStats {
        (**self).stats()
    }

    fn features(&self) -> NetDeviceFeatures {
        (**self).features()
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetDeviceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    /// Frames refused because the TX ring was full or the frame was invalid.
    pub tx_dropped: u64,
}

impl fmt::Display for NetDeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx: {} pkts/{} bytes, tx: {} pkts/{} bytes, drop: {}/{}",
            self.rx_packets,
            self.rx_bytes,
            self.tx_packets,
            self.tx_bytes,
            self.rx_dropped,
            self.tx_dropped
        )
    }
}

/// Lock-free counters a driver bumps from its data path.
#[derive(Default)]
pub struct StatsCounters {
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_dropped: AtomicU64,
    tx_dropped: AtomicU64,
}

impl StatsCounters {
    pub const fn new() -> Self {
        Self {
            rx_packets: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            tx_dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rx_drop(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tx_drop(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetDeviceStats {
        NetDeviceStats {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
        }
    }
}

bitflags! {
    /// Capability flags advertised by a network device.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NetDeviceFeatures: u32 {
        /// Hardware appends the Ethernet FCS.
        const INSERT_FCS   = 1 << 0;
        /// Hardware strips the FCS before handing frames up.
        const STRIP_FCS    = 1 << 1;
        /// Short frames are padded to 60 bytes by the device.
        const PAD_SHORT    = 1 << 2;
        /// Interrupt driven receive; without it the stack must poll.
        const RX_INTERRUPT = 1 << 3;
    }
}
