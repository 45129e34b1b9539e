use core::fmt;

/// Magic signature at the start of every dt_table image, stored big-endian
/// like every other field in the format.
pub const DT_TABLE_MAGIC: u32 = 0xd7b7_ab1e;

/// Wire size of the image header.
pub const DT_TABLE_HEADER_SIZE: usize = 32;

/// Wire size of one entry record. An image advertising a different entry
/// size uses a record layout this parser does not understand.
pub const DT_TABLE_ENTRY_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtTableError {
    InvalidHeader,
    InvalidMagic,
    BufferTooSmall,
    UnsupportedEntrySize,
    TruncatedTable,
    IndexOutOfRange,
    InvalidFilter,
    NotFound,
}

type Result<T> = core::result::Result<T, DtTableError>;

/// Extract big-endian u32 from bytes + offset
fn bytes_to_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let bs = bytes.get(offset..offset + 4)?;
    Some(u32::from_be_bytes(bs.try_into().ok()?))
}

/// Check whether the buffer holds a well-formed table image. This is the
/// same validation every constructor performs; callers that repoint their
/// base address simply run it again, nothing is cached between calls.
pub fn check_header(data: &[u8]) -> bool {
    DtTableImage::new(data).is_ok()
}

/// dt_table image header, as laid out at the start of the image.
#[derive(Debug)]
struct DtTableHeader {
    magic: u32,
    total_size: u32,
    header_size: u32,
    dt_entry_size: u32,
    dt_entry_count: u32,
    dt_entries_offset: u32,
    page_size: u32,
    version: u32,
}

impl DtTableHeader {
    /// Read DtTableHeader from the buffer, returning it in a Result if it
    /// passes validation, otherwise returns an error.
    /// Set ignore_size to true if only the header portion of the image is
    /// mapped so far (e.g. in order to learn total_size before forming the
    /// full slice).
    fn new(data: &[u8], ignore_size: bool) -> Result<Self> {
        fn new_header(data: &[u8]) -> Option<DtTableHeader> {
            Some(DtTableHeader {
                magic: bytes_to_u32(data, 0)?,
                total_size: bytes_to_u32(data, 4)?,
                header_size: bytes_to_u32(data, 8)?,
                dt_entry_size: bytes_to_u32(data, 12)?,
                dt_entry_count: bytes_to_u32(data, 16)?,
                dt_entries_offset: bytes_to_u32(data, 20)?,
                page_size: bytes_to_u32(data, 24)?,
                version: bytes_to_u32(data, 28)?,
            })
        }

        let len = data.len() as u64;
        new_header(data)
            .ok_or(DtTableError::InvalidHeader)
            .and_then(|h| {
                (h.magic == DT_TABLE_MAGIC).then_some(h).ok_or(DtTableError::InvalidMagic)
            })
            .and_then(|h| {
                (h.dt_entry_size as usize == DT_TABLE_ENTRY_SIZE)
                    .then_some(h)
                    .ok_or(DtTableError::UnsupportedEntrySize)
            })
            .and_then(|h| {
                (len == h.total_size as u64 || ignore_size)
                    .then_some(h)
                    .ok_or(DtTableError::BufferTooSmall)
            })
            .and_then(|h| {
                // The whole entry table must lie inside the image. 64-bit
                // arithmetic so a hostile entry count cannot wrap.
                let end = h.dt_entries_offset as u64
                    + h.dt_entry_count as u64 * h.dt_entry_size as u64;
                (end <= h.total_size as u64).then_some(h).ok_or(DtTableError::TruncatedTable)
            })
    }
}

/// One record in the entry table. id and rev are opaque to the parser;
/// callers assign their meaning. The custom words are carried for display
/// only and never matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtTableEntry {
    pub dt_size: u32,
    pub dt_offset: u32,
    pub id: u32,
    pub rev: u32,
    pub custom: [u32; 4],
}

impl DtTableEntry {
    fn new(data: &[u8], offset: usize) -> Option<Self> {
        Some(DtTableEntry {
            dt_size: bytes_to_u32(data, offset)?,
            dt_offset: bytes_to_u32(data, offset + 4)?,
            id: bytes_to_u32(data, offset + 8)?,
            rev: bytes_to_u32(data, offset + 12)?,
            custom: [
                bytes_to_u32(data, offset + 16)?,
                bytes_to_u32(data, offset + 20)?,
                bytes_to_u32(data, offset + 24)?,
                bytes_to_u32(data, offset + 28)?,
            ],
        })
    }
}

/// Metadata query for dtb_by_field. Fields left as None are not compared,
/// so an entry whose id or rev legitimately is 0 stays matchable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntryFilter {
    pub id: Option<u32>,
    pub rev: Option<u32>,
}

impl EntryFilter {
    pub const fn by_id(id: u32) -> Self {
        EntryFilter { id: Some(id), rev: None }
    }

    pub const fn by_rev(rev: u32) -> Self {
        EntryFilter { id: None, rev: Some(rev) }
    }

    /// Build a filter from the raw wire convention, where a zero field
    /// means "unused".
    pub const fn from_raw(id: u32, rev: u32) -> Self {
        EntryFilter {
            id: if id != 0 { Some(id) } else { None },
            rev: if rev != 0 { Some(rev) } else { None },
        }
    }

    fn is_empty(&self) -> bool {
        self.id.is_none() && self.rev.is_none()
    }

    fn matches(&self, entry: &DtTableEntry) -> bool {
        self.id.map_or(true, |id| id == entry.id)
            && self.rev.map_or(true, |rev| rev == entry.rev)
    }
}

/// Absolute location of one embedded device-tree blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtbRegion {
    pub addr: u64,
    pub size: u32,
}

/// Result of a metadata lookup: blob location plus the index it was found at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtbMatch {
    pub addr: u64,
    pub size: u32,
    pub index: u32,
}

/// DtTableImage is the entrypoint to the table image operations: a validated
/// view over the image bytes. The bytes are borrowed, never copied, and every
/// accessor reads through the borrow, so nothing here can go stale if the
/// caller repoints its base address and constructs a fresh view.
#[derive(Debug)]
pub struct DtTableImage<'a> {
    data: &'a [u8],
    header: DtTableHeader,
}

impl<'a> DtTableImage<'a> {
    /// Create a new DtTableImage over the bytes pointed to by data.
    /// Result is an error if the header can't be validated.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        DtTableHeader::new(data, false).map(|header| Self { data, header })
    }

    /// Given a pointer to a table image as a u64, return a DtTableImage.
    ///
    /// # Safety
    ///
    /// ptr must point to readable memory holding a complete image: at least
    /// DT_TABLE_HEADER_SIZE bytes, then at least total_size bytes as read
    /// from that header, none of it mutated for the lifetime of the result.
    pub unsafe fn from_u64(ptr: u64) -> Result<Self> {
        let u8ptr = ptr as *const u8;

        // Extract the real length from the header
        let header_buf: &[u8] =
            unsafe { core::slice::from_raw_parts(u8ptr, DT_TABLE_HEADER_SIZE) };
        let len = DtTableHeader::new(header_buf, true)?.total_size as usize;

        // Extract the buffer for real
        let data: &[u8] = unsafe { core::slice::from_raw_parts(u8ptr, len) };
        DtTableHeader::new(data, false).map(|header| Self { data, header })
    }

    pub fn entry_count(&self) -> u32 {
        self.header.dt_entry_count
    }

    pub fn total_size(&self) -> u32 {
        self.header.total_size
    }

    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    /// Absolute address of the image base. Blob addresses handed back to
    /// callers are offsets from this.
    fn base_addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    /// Byte offset of entry `index` within the image. Leaf arithmetic only:
    /// callers check index against dt_entry_count, and header validation has
    /// already proven the whole table in-bounds.
    fn entry_offset(&self, index: u32) -> usize {
        self.header.dt_entries_offset as usize
            + index as usize * self.header.dt_entry_size as usize
    }

    /// Bounds-checked read of entry `index`.
    pub fn entry(&self, index: u32) -> Result<DtTableEntry> {
        if index >= self.header.dt_entry_count {
            return Err(DtTableError::IndexOutOfRange);
        }
        DtTableEntry::new(self.data, self.entry_offset(index)).ok_or(DtTableError::TruncatedTable)
    }

    /// Linearly iterate over the entry records in index order
    pub fn entries(&self) -> impl Iterator<Item = DtTableEntry> + '_ {
        let mut index = 0;
        core::iter::from_fn(move || {
            let entry = self.entry(index).ok()?;
            index += 1;
            Some(entry)
        })
    }

    /// Check that the blob an entry points at lies inside the image, then
    /// resolve it to an absolute region.
    fn checked_region(&self, entry: &DtTableEntry) -> Result<DtbRegion> {
        let end = entry.dt_offset as u64 + entry.dt_size as u64;
        if end > self.header.total_size as u64 {
            return Err(DtTableError::TruncatedTable);
        }
        Ok(DtbRegion { addr: self.base_addr() + entry.dt_offset as u64, size: entry.dt_size })
    }

    /// Look up the blob at `index`: O(1) positional access for callers that
    /// have already enumerated the table.
    pub fn dtb_by_index(&self, index: u32) -> Result<DtbRegion> {
        self.entry(index).and_then(|e| self.checked_region(&e))
    }

    /// Look up the first blob whose metadata matches the filter. Linear scan
    /// in ascending index order; the first match wins, even if a later entry
    /// would match more of the filter's fields.
    pub fn dtb_by_field(&self, filter: EntryFilter) -> Result<DtbMatch> {
        if filter.is_empty() {
            return Err(DtTableError::InvalidFilter);
        }
        for index in 0..self.header.dt_entry_count {
            let entry = self.entry(index)?;
            if filter.matches(&entry) {
                let region = self.checked_region(&entry)?;
                return Ok(DtbMatch { addr: region.addr, size: region.size, index });
            }
        }
        Err(DtTableError::NotFound)
    }
}

impl fmt::Display for DtTableImage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        writeln!(f, "dt_table_header:")?;
        writeln!(f, "{:>20} = {:08x}", "magic", h.magic)?;
        writeln!(f, "{:>20} = {:#x} ({})", "total_size", h.total_size, h.total_size)?;
        writeln!(f, "{:>20} = {:#x} ({})", "header_size", h.header_size, h.header_size)?;
        writeln!(f, "{:>20} = {:#x} ({})", "dt_entry_size", h.dt_entry_size, h.dt_entry_size)?;
        writeln!(f, "{:>20} = {:#x} ({})", "dt_entry_count", h.dt_entry_count, h.dt_entry_count)?;
        writeln!(
            f,
            "{:>20} = {:#x} ({})",
            "dt_entries_offset", h.dt_entries_offset, h.dt_entries_offset
        )?;
        writeln!(f, "{:>20} = {:#x} ({})", "page_size", h.page_size, h.page_size)?;
        writeln!(f, "{:>20} = {:#x} ({})", "version", h.version, h.version)?;

        let custom_names = ["custom[0]", "custom[1]", "custom[2]", "custom[3]"];
        for (i, e) in self.entries().enumerate() {
            writeln!(f, "dt_table_entry[{}]:", i)?;
            writeln!(f, "{:>20} = {:#x} ({})", "dt_size", e.dt_size, e.dt_size)?;
            writeln!(f, "{:>20} = {:#x} ({})", "dt_offset", e.dt_offset, e.dt_offset)?;
            writeln!(f, "{:>20} = {:08x}", "id", e.id)?;
            writeln!(f, "{:>20} = {:08x}", "rev", e.rev)?;
            for (name, c) in custom_names.iter().zip(e.custom.iter()) {
                writeln!(f, "{:>20} = {:08x}", name, c)?;
            }
        }
        Ok(())
    }
}
