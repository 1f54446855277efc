use core::mem;
use core::slice;

use kestrel_lib::klog_info;

#[repr(C, packed)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_address: u32,
    pub length: u32,
    pub xsdt_address: u64,
    pub extended_checksum: u8,
    pub reserved: [u8; 3],
}

/// Length of the common system description table header.
pub const SDT_HEADER_LEN: usize = 36;

const RSDP_V1_LEN: usize = 20;

/// Translates firmware physical addresses into readable kernel pointers.
///
/// # Safety
///
/// A returned pointer must stay readable for as long as the mapper lives,
/// for at least as many bytes as the table found there declares.
pub unsafe trait PhysMapper {
    fn map(&self, phys: u64) -> Option<*const u8>;
}

/// Physical == virtual (early boot identity map, host tests).
pub struct IdentityMapper;

unsafe impl PhysMapper for IdentityMapper {
    fn map(&self, phys: u64) -> Option<*const u8> {
        if phys == 0 {
            None
        } else {
            Some(phys as usize as *const u8)
        }
    }
}

/// Fixed-offset direct map (higher-half window over all of physical memory).
pub struct OffsetMapper {
    pub offset: u64,
}

unsafe impl PhysMapper for OffsetMapper {
    fn map(&self, phys: u64) -> Option<*const u8> {
        if phys == 0 {
            return None;
        }
        phys.checked_add(self.offset).map(|v| v as usize as *const u8)
    }
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[off..off + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(raw)
}

/// A checksum-validated ACPI table.
#[derive(Clone, Copy)]
pub struct AcpiTable<'a> {
    bytes: &'a [u8],
}

impl<'a> AcpiTable<'a> {
    pub fn signature(&self) -> [u8; 4] {
        [self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]
    }

    pub fn revision(&self) -> u8 {
        self.bytes[8]
    }

    /// Whole table including the header.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Everything after the 36-byte header.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[SDT_HEADER_LEN..]
    }
}

/// Map and validate the table header found at `phys`.
///
/// # Safety
///
/// Relies on the [`PhysMapper`] contract for the mapped range.
unsafe fn map_table<'a>(mapper: &'a dyn PhysMapper, phys: u64) -> Option<AcpiTable<'a>> {
    let ptr = mapper.map(phys)?;
    let head = slice::from_raw_parts(ptr, SDT_HEADER_LEN);
    let length = read_u32(head, 4) as usize;
    if length < SDT_HEADER_LEN {
        return None;
    }
    let bytes = slice::from_raw_parts(ptr, length);
    if checksum(bytes) != 0 {
        return None;
    }
    Some(AcpiTable { bytes })
}

#[derive(Clone, Copy)]
enum Root {
    Xsdt(u64),
    Rsdt(u64),
}

/// Validated handle to the ACPI table hierarchy.
pub struct AcpiTables<'m> {
    mapper: &'m dyn PhysMapper,
    roots: [Option<Root>; 2],
}

impl<'m> AcpiTables<'m> {
    /// Validate an RSDP and prepare XSDT-then-RSDT lookups.
    ///
    /// # Safety
    ///
    /// `rsdp` must point at readable firmware memory.
    pub unsafe fn from_rsdp(rsdp: *const Rsdp, mapper: &'m dyn PhysMapper) -> Option<Self> {
        if rsdp.is_null() {
            return None;
        }
        let v1 = slice::from_raw_parts(rsdp as *const u8, RSDP_V1_LEN);
        if &v1[..8] != b"RSD PTR " || checksum(v1) != 0 {
            klog_info!("ACPI: RSDP checksum failed");
            return None;
        }
        let rsdp_ref = &*rsdp;
        let revision = rsdp_ref.revision;
        let length = rsdp_ref.length as usize;
        let mut roots = [None, None];
        if revision >= 2 && length >= mem::size_of::<Rsdp>() {
            let full = slice::from_raw_parts(rsdp as *const u8, length);
            if checksum(full) != 0 {
                klog_info!("ACPI: RSDP extended checksum failed");
                return None;
            }
            let xsdt = rsdp_ref.xsdt_address;
            if xsdt != 0 {
                roots[0] = Some(Root::Xsdt(xsdt));
            }
        }
        let rsdt = rsdp_ref.rsdt_address;
        if rsdt != 0 {
            roots[1] = Some(Root::Rsdt(rsdt as u64));
        }
        Some(Self { mapper, roots })
    }

    /// Start directly from an XSDT physical address (what the boot protocol hands over).
    pub fn from_xsdt(xsdt_phys: u64, mapper: &'m dyn PhysMapper) -> Option<Self> {
        let tables = Self {
            mapper,
            roots: [Some(Root::Xsdt(xsdt_phys)), None],
        };
        // SAFETY: mapper contract.
        let root = unsafe { map_table(mapper, xsdt_phys) }?;
        if &root.signature() != b"XSDT" {
            klog_info!("ACPI: XSDT signature mismatch");
            return None;
        }
        Some(tables)
    }

    /// Find a table by its 4-byte signature, skipping entries with a bad checksum.
    pub fn find_table(&self, signature: &[u8; 4]) -> Option<AcpiTable<'m>> {
        for root in self.roots.iter().flatten() {
            let (phys, entry_size) = match *root {
                Root::Xsdt(p) => (p, 8),
                Root::Rsdt(p) => (p, 4),
            };
            // SAFETY: mapper contract.
            let Some(sdt) = (unsafe { map_table(self.mapper, phys) }) else {
                continue;
            };
            if let Some(hit) = self.scan(sdt, entry_size, signature) {
                return Some(hit);
            }
        }
        None
    }

    fn scan(&self, sdt: AcpiTable<'m>, entry_size: usize, signature: &[u8; 4]) -> Option<AcpiTable<'m>> {
        let payload = sdt.payload();
        for i in 0..payload.len() / entry_size {
            let off = i * entry_size;
            let phys = if entry_size == 8 {
                read_u64(payload, off)
            } else {
                read_u32(payload, off) as u64
            };
            let Some(ptr) = self.mapper.map(phys) else {
                continue;
            };
            // SAFETY: mapper contract covers at least the header.
            let sig = unsafe { slice::from_raw_parts(ptr, 4) };
            if sig != signature {
                continue;
            }
            match unsafe { map_table(self.mapper, phys) } {
                Some(table) => return Some(table),
                None => klog_info!("ACPI: Found table with invalid checksum, skipping"),
            }
        }
        None
    }
}
