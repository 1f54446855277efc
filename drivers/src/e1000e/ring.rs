//! Legacy 16-byte RX/TX descriptor rings.
//!
//! ```text
//! RX: addr u64 | length u16 | checksum u16 | status u8 | errors u8 | special u16
//! TX: addr u64 | length u16 | cso u8 | cmd u8 | status u8 | css u8 | special u16
//! ```

use alloc::vec::Vec;

use crate::hw::{DmaAllocator, DmaRegion, RegisterIo};

use super::E1000eError;
use super::regs::*;

const DESC_ADDR: usize = 0;
const DESC_LENGTH: usize = 8;
const RX_DESC_ERRORS: usize = 13;
const TX_DESC_CMD: usize = 11;
const DESC_STATUS: usize = 12;

const RING_ALIGN: usize = 128;
const BUFFER_ALIGN: usize = 16;

fn alloc_buffers(dma: &dyn DmaAllocator, count: usize) -> Result<Vec<DmaRegion>, E1000eError> {
    let mut buffers = Vec::with_capacity(count);
    for _ in 0..count {
        buffers.push(
            dma.alloc(PACKET_BUFFER_SIZE, BUFFER_ALIGN)
                .ok_or(E1000eError::OutOfMemory)?,
        );
    }
    Ok(buffers)
}

// =============================================================================
// Receive
// =============================================================================

/// A completed receive descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxCompletion {
    pub index: usize,
    pub length: u16,
    pub status: u8,
    pub errors: u8,
}

impl RxCompletion {
    #[inline]
    pub fn is_whole_frame(&self) -> bool {
        self.status & RXSTA_EOP != 0 && self.errors == 0
    }
}

pub struct RxRing {
    descs: DmaRegion,
    buffers: Vec<DmaRegion>,
    /// Last descriptor handed to hardware (mirrors RDT).
    tail: usize,
}

impl RxRing {
    pub fn allocate(dma: &dyn DmaAllocator) -> Result<Self, E1000eError> {
        let descs = dma
            .alloc(RX_DESC_COUNT * DESC_SIZE, RING_ALIGN)
            .ok_or(E1000eError::OutOfMemory)?;
        let buffers = alloc_buffers(dma, RX_DESC_COUNT)?;
        for (i, buf) in buffers.iter().enumerate() {
            let d = i * DESC_SIZE;
            descs.write::<u64>(d + DESC_ADDR, buf.phys);
            descs.write::<u8>(d + DESC_STATUS, 0);
        }
        Ok(Self {
            descs,
            buffers,
            tail: RX_DESC_COUNT - 1,
        })
    }

    /// Point the device at the ring; every descriptor but one is owned by hardware.
    pub fn program(&self, regs: &dyn RegisterIo) {
        regs.write32(REG_RDBAL, self.descs.phys as u32);
        regs.write32(REG_RDBAH, (self.descs.phys >> 32) as u32);
        regs.write32(REG_RDLEN, (RX_DESC_COUNT * DESC_SIZE) as u32);
        regs.write32(REG_RDH, 0);
        regs.write32(REG_RDT, self.tail as u32);
    }

    /// The descriptor after the tail, if hardware has finished with it.
    pub fn next_completed(&self) -> Option<RxCompletion> {
        let index = (self.tail + 1) % RX_DESC_COUNT;
        let d = index * DESC_SIZE;
        let status = self.descs.read::<u8>(d + DESC_STATUS);
        if status & RXSTA_DD == 0 {
            return None;
        }
        Some(RxCompletion {
            index,
            length: self.descs.read::<u16>(d + DESC_LENGTH),
            status,
            errors: self.descs.read::<u8>(d + RX_DESC_ERRORS),
        })
    }

    #[inline]
    pub fn buffer(&self, index: usize) -> DmaRegion {
        self.buffers[index]
    }

    /// Hand descriptor `index` back to hardware and advance RDT to it.
    pub fn recycle(&mut self, index: usize, regs: &dyn RegisterIo) {
        let d = index * DESC_SIZE;
        self.descs.write::<u8>(d + DESC_STATUS, 0);
        self.descs.write::<u8>(d + RX_DESC_ERRORS, 0);
        self.descs.write::<u16>(d + DESC_LENGTH, 0);
        self.tail = index;
        regs.write32(REG_RDT, index as u32);
    }

    #[inline]
    pub fn tail(&self) -> usize {
        self.tail
    }
}

// =============================================================================
// Transmit
// =============================================================================

pub struct TxRing {
    descs: DmaRegion,
    buffers: Vec<DmaRegion>,
    /// Next descriptor software fills (mirrors TDT).
    tail: usize,
}

impl TxRing {
    pub fn allocate(dma: &dyn DmaAllocator) -> Result<Self, E1000eError> {
        let descs = dma
            .alloc(TX_DESC_COUNT * DESC_SIZE, RING_ALIGN)
            .ok_or(E1000eError::OutOfMemory)?;
        let buffers = alloc_buffers(dma, TX_DESC_COUNT)?;
        for (i, buf) in buffers.iter().enumerate() {
            let d = i * DESC_SIZE;
            descs.write::<u64>(d + DESC_ADDR, buf.phys);
            // Software owns every slot until it queues a frame.
            descs.write::<u8>(d + DESC_STATUS, TXSTA_DD);
        }
        Ok(Self {
            descs,
            buffers,
            tail: 0,
        })
    }

    pub fn program(&self, regs: &dyn RegisterIo) {
        regs.write32(REG_TDBAL, self.descs.phys as u32);
        regs.write32(REG_TDBAH, (self.descs.phys >> 32) as u32);
        regs.write32(REG_TDLEN, (TX_DESC_COUNT * DESC_SIZE) as u32);
        regs.write32(REG_TDH, 0);
        regs.write32(REG_TDT, 0);
    }

    /// Whether the slot at the tail is free for software.
    #[inline]
    pub fn has_room(&self) -> bool {
        self.descs.read::<u8>(self.tail * DESC_SIZE + DESC_STATUS) & TXSTA_DD != 0
    }

    /// Copy `frame` into the tail slot and bump TDT.
    pub fn enqueue(&mut self, frame: &[u8], regs: &dyn RegisterIo) -> Result<(), E1000eError> {
        if !self.has_room() {
            return Err(E1000eError::TxRingFull);
        }
        let index = self.tail;
        if !self.buffers[index].copy_in(0, frame) {
            return Err(E1000eError::InvalidLength);
        }
        let d = index * DESC_SIZE;
        self.descs.write::<u16>(d + DESC_LENGTH, frame.len() as u16);
        self.descs.write::<u8>(d + TX_DESC_CMD, TXCMD_EOP | TXCMD_IFCS | TXCMD_RS);
        self.descs.write::<u8>(d + DESC_STATUS, 0);
        self.tail = (index + 1) % TX_DESC_COUNT;
        regs.write32(REG_TDT, self.tail as u32);
        Ok(())
    }

    #[inline]
    pub fn tail(&self) -> usize {
        self.tail
    }
}
