//! MCFG (PCI Express memory-mapped configuration space) parsing.
//!
//! Each 16-byte allocation entry after the 8 reserved bytes names the ECAM
//! window of one segment group's bus range. The PCI layer uses the primary
//! entry for ECAM access and falls back to port I/O when there is none.

use kestrel_lib::klog_info;

use crate::tables::{AcpiTable, AcpiTables};

const MCFG_SIGNATURE: &[u8; 4] = b"MCFG";

/// Reserved bytes between the SDT header and the first entry.
const MCFG_RESERVED_SIZE: usize = 8;
const MCFG_ENTRY_SIZE: usize = 16;

/// Most systems have one entry; multi-segment servers a handful.
const MAX_MCFG_ENTRIES: usize = 16;

/// One ECAM allocation.
///
/// Function address:
///   `base_phys + ((bus - bus_start) << 20) | (device << 15) | (function << 12) | reg`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct McfgEntry {
    pub base_phys: u64,
    pub segment: u16,
    pub bus_start: u8,
    /// Inclusive.
    pub bus_end: u8,
}

impl McfgEntry {
    /// 1 MiB per bus (32 devices x 8 functions x 4 KiB).
    pub fn region_size(&self) -> u64 {
        let bus_count = (self.bus_end as u64) - (self.bus_start as u64) + 1;
        bus_count << 20
    }

    /// Offset of a function's 4 KiB config page, `None` outside this entry.
    pub fn ecam_offset(&self, bus: u8, device: u8, function: u8) -> Option<u64> {
        if bus < self.bus_start || bus > self.bus_end || device >= 32 || function >= 8 {
            return None;
        }
        let relative_bus = (bus - self.bus_start) as u64;
        Some((relative_bus << 20) | ((device as u64) << 15) | ((function as u64) << 12))
    }
}

pub struct Mcfg {
    entries: [McfgEntry; MAX_MCFG_ENTRIES],
    count: usize,
}

impl Mcfg {
    /// Look up `"MCFG"` and parse it. `None` if absent or truncated.
    pub fn from_tables(tables: &AcpiTables<'_>) -> Option<Self> {
        let Some(table) = tables.find_table(MCFG_SIGNATURE) else {
            klog_info!("ACPI: MCFG table not found");
            return None;
        };
        Self::parse(&table)
    }

    pub fn parse(table: &AcpiTable<'_>) -> Option<Self> {
        let payload = table.payload();
        if payload.len() < MCFG_RESERVED_SIZE {
            klog_info!("ACPI: MCFG table too short ({} bytes)", table.bytes().len());
            return None;
        }

        let raw = &payload[MCFG_RESERVED_SIZE..];
        let entry_count = raw.len() / MCFG_ENTRY_SIZE;
        if entry_count > MAX_MCFG_ENTRIES {
            klog_info!(
                "ACPI: MCFG has {} entries, capping at {}",
                entry_count,
                MAX_MCFG_ENTRIES
            );
        }

        let mut mcfg = Self {
            entries: [McfgEntry::default(); MAX_MCFG_ENTRIES],
            count: 0,
        };

        for (i, chunk) in raw
            .chunks_exact(MCFG_ENTRY_SIZE)
            .take(MAX_MCFG_ENTRIES)
            .enumerate()
        {
            let mut base = [0u8; 8];
            base.copy_from_slice(&chunk[0..8]);
            let entry = McfgEntry {
                base_phys: u64::from_le_bytes(base),
                segment: u16::from_le_bytes([chunk[8], chunk[9]]),
                bus_start: chunk[10],
                bus_end: chunk[11],
            };

            if entry.base_phys == 0 {
                klog_info!("ACPI: MCFG entry {} has zero base address, skipping", i);
                continue;
            }
            if entry.bus_end < entry.bus_start {
                klog_info!(
                    "ACPI: MCFG entry {} has invalid bus range ({}..={}), skipping",
                    i,
                    entry.bus_start,
                    entry.bus_end
                );
                continue;
            }

            mcfg.entries[mcfg.count] = entry;
            mcfg.count += 1;
        }

        Some(mcfg)
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn entries(&self) -> &[McfgEntry] {
        &self.entries[..self.count]
    }

    pub fn find_entry(&self, segment: u16, bus: u8) -> Option<&McfgEntry> {
        self.entries()
            .iter()
            .find(|e| e.segment == segment && bus >= e.bus_start && bus <= e.bus_end)
    }

    /// Segment 0, which is the only segment on most machines.
    pub fn primary_entry(&self) -> Option<&McfgEntry> {
        self.entries().iter().find(|e| e.segment == 0)
    }
}
