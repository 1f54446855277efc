#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod e1000e;
pub mod hw;
pub mod input_event;
pub mod msi;
pub mod net;
pub mod pci;
pub mod pci_defs;
pub mod usb_hid;
pub mod xhci;

#[cfg(test)]
mod test_fixtures;

#[cfg(test)]
mod net_tests;
#[cfg(test)]
mod xhci_tests;

pub use usb_hid::{keyboard, mouse};
