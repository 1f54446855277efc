//! Kestrel kernel ABI types
//!
//! Shared definitions between the network/input core and its consumers.
//! Everything here is `#[repr(C)]` so the layout is stable across the
//! syscall boundary.

#![no_std]
#![forbid(unsafe_code)]

pub mod input;
pub mod net;

pub use input::*;
pub use net::*;
