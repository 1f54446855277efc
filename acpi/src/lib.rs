//! ACPI table lookup for Kestrel.
//!
//! Zero-allocation walking of the RSDP/XSDT/RSDT hierarchy. Consumers see
//! validated tables as byte slices and parse their own layouts on top.
//!
//! - [`tables`]: RSDP validation, XSDT/RSDT traversal, lookup by signature.
//! - [`mcfg`]: PCI Express ECAM allocation entries.
//!
//! ```ignore
//! let tables = AcpiTables::from_xsdt(xsdt_phys, &mapper)?;
//! let mcfg = Mcfg::from_tables(&tables)?;
//! ```

#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod mcfg;
pub mod tables;

pub use mcfg::{Mcfg, McfgEntry};
pub use tables::{AcpiTable, AcpiTables, IdentityMapper, OffsetMapper, PhysMapper, SDT_HEADER_LEN};
