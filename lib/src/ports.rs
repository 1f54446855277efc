//! Fixed x86 I/O port assignments and the raw UART primitives behind the
//! early klog backend.  Port access goes through `x86_64::instructions::port`.

use x86_64::instructions::port::{PortReadOnly, PortWriteOnly};

pub const COM1: u16 = 0x3F8;

pub const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
pub const PCI_CONFIG_DATA: u16 = 0xCFC;

pub const UART_REG_THR: u16 = 0;
pub const UART_REG_IER: u16 = 1;
pub const UART_REG_FCR: u16 = 2;
pub const UART_REG_LCR: u16 = 3;
pub const UART_REG_MCR: u16 = 4;
pub const UART_REG_LSR: u16 = 5;

pub const UART_LCR_DLAB: u8 = 0x80;
pub const UART_LCR_8N1: u8 = 0x03;
pub const UART_FCR_ENABLE_CLEAR_14: u8 = 0xC7;
pub const UART_LSR_TX_EMPTY: u8 = 0x20;
pub const UART_MCR_DTR_RTS_OUT2: u8 = 0x0B;

/// 115200 / 3 = 38400 baud.
const UART_DIVISOR_38400: u8 = 3;

/// Program a 16550 for 38400 8N1 with FIFOs enabled.
///
/// # Safety
///
/// Port I/O.  `base` must be a 16550-compatible UART.
pub unsafe fn serial_init(base: u16) {
    unsafe {
        PortWriteOnly::<u8>::new(base + UART_REG_IER).write(0);
        PortWriteOnly::<u8>::new(base + UART_REG_LCR).write(UART_LCR_DLAB);
        PortWriteOnly::<u8>::new(base).write(UART_DIVISOR_38400);
        PortWriteOnly::<u8>::new(base + 1).write(0);
        PortWriteOnly::<u8>::new(base + UART_REG_LCR).write(UART_LCR_8N1);
        PortWriteOnly::<u8>::new(base + UART_REG_FCR).write(UART_FCR_ENABLE_CLEAR_14);
        PortWriteOnly::<u8>::new(base + UART_REG_MCR).write(UART_MCR_DTR_RTS_OUT2);
    }
}

/// Write one byte, polling LSR until the holding register drains.
///
/// # Safety
///
/// Port I/O.  Caller serialises access to the UART.
#[inline(always)]
pub unsafe fn serial_putc(base: u16, byte: u8) {
    let mut lsr = PortReadOnly::<u8>::new(base + UART_REG_LSR);
    let mut thr = PortWriteOnly::<u8>::new(base + UART_REG_THR);
    unsafe {
        while (lsr.read() & UART_LSR_TX_EMPTY) == 0 {
            core::hint::spin_loop();
        }
        thr.write(byte);
    }
}

/// Write bytes, expanding `\n` to `\r\n`.
///
/// # Safety
///
/// Same requirements as [`serial_putc`].
#[inline]
pub unsafe fn serial_write_bytes(base: u16, bytes: &[u8]) {
    for &b in bytes {
        if b == b'\n' {
            unsafe { serial_putc(base, b'\r') };
        }
        unsafe { serial_putc(base, b) };
    }
}
