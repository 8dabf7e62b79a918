//! Instrumentation schema: the ordered descriptor handed to the runtime so
//! it can allocate counter storage.
//!
//! Entries appear in flowgraph-traversal order. A block count probe
//! contributes one entry; a class profile contributes two consecutive
//! entries (histogram count, then the type-handle table). The runtime fills
//! in each entry's byte offset within the allocated buffer.

use std::fmt;

/// Number of type-handle slots in one class-profile histogram.
pub const CLASS_PROFILE_SIZE: u32 = 8;

/// Marks a schema entry as belonging to a class profile.
pub const CLASS_FLAG: u32 = 0x8000_0000;

/// Marks a class profile at an interface (virtual-stub) call site.
pub const INTERFACE_FLAG: u32 = 0x4000_0000;

/// Fixed size of one encoded schema record.
pub const SCHEMA_RECORD_SIZE: usize = 20;

// =============================================================================
// Schema Entries
// =============================================================================

/// What a schema entry's counter slots hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SchemaKind {
    /// One 32-bit execution counter for a basic block.
    BlockIntCount = 1,
    /// One 32-bit sample counter for a class-profile histogram.
    TypeHandleHistogramCount = 2,
    /// The histogram's table of observed receiver type handles.
    TypeHandleHistogramTypeHandle = 3,
}

impl SchemaKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::BlockIntCount),
            2 => Some(Self::TypeHandleHistogramCount),
            3 => Some(Self::TypeHandleHistogramTypeHandle),
            _ => None,
        }
    }

    /// Byte width of a single slot of this kind.
    pub fn slot_width(self) -> usize {
        match self {
            Self::BlockIntCount | Self::TypeHandleHistogramCount => 4,
            Self::TypeHandleHistogramTypeHandle => 8,
        }
    }
}

/// One record in the instrumentation schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaEntry {
    pub kind: SchemaKind,
    /// IL offset this entry describes.
    pub il_offset: i32,
    /// Number of slots.
    pub count: u32,
    /// Kind-specific flags (`CLASS_FLAG`, `INTERFACE_FLAG`).
    pub other: u32,
    /// Byte offset of the first slot within the profile buffer; assigned by
    /// the runtime during allocation.
    pub offset: u32,
}

impl SchemaEntry {
    /// Entry for a basic-block execution counter.
    pub fn block_count(il_offset: u32) -> Self {
        Self {
            kind: SchemaKind::BlockIntCount,
            il_offset: il_offset as i32,
            count: 1,
            other: 0,
            offset: 0,
        }
    }

    /// The two consecutive entries describing one class-profile histogram.
    pub fn class_histogram(il_offset: u32, interface_site: bool) -> [Self; 2] {
        let mut other = CLASS_FLAG;
        if interface_site {
            other |= INTERFACE_FLAG;
        }
        let head = Self {
            kind: SchemaKind::TypeHandleHistogramCount,
            il_offset: il_offset as i32,
            count: 1,
            other,
            offset: 0,
        };
        let table = Self {
            kind: SchemaKind::TypeHandleHistogramTypeHandle,
            count: CLASS_PROFILE_SIZE,
            ..head
        };
        [head, table]
    }

    /// Total bytes of counter storage this entry needs.
    pub fn slot_size(&self) -> usize {
        self.kind.slot_width() * self.count as usize
    }
}

/// Bytes of counter storage an entire schema needs.
pub fn buffer_size(schema: &[SchemaEntry]) -> usize {
    schema.iter().map(SchemaEntry::slot_size).sum()
}

// =============================================================================
// Wire Format
// =============================================================================

/// Error decoding a serialized schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDecodeError {
    /// Input length is not a whole number of records.
    Truncated,
    /// Unrecognized kind discriminant.
    UnknownKind(u32),
}

impl fmt::Display for SchemaDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "schema bytes truncated"),
            Self::UnknownKind(v) => write!(f, "unknown schema kind {v}"),
        }
    }
}

impl std::error::Error for SchemaDecodeError {}

/// Serialize a schema as fixed-size little-endian records.
pub fn encode_schema(schema: &[SchemaEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(schema.len() * SCHEMA_RECORD_SIZE);
    for entry in schema {
        out.extend_from_slice(&(entry.kind as u32).to_le_bytes());
        out.extend_from_slice(&entry.il_offset.to_le_bytes());
        out.extend_from_slice(&entry.count.to_le_bytes());
        out.extend_from_slice(&entry.other.to_le_bytes());
        out.extend_from_slice(&entry.offset.to_le_bytes());
    }
    out
}

/// Decode a schema previously produced by [`encode_schema`].
pub fn decode_schema(bytes: &[u8]) -> Result<Vec<SchemaEntry>, SchemaDecodeError> {
    if bytes.len() % SCHEMA_RECORD_SIZE != 0 {
        return Err(SchemaDecodeError::Truncated);
    }
    let mut entries = Vec::with_capacity(bytes.len() / SCHEMA_RECORD_SIZE);
    for record in bytes.chunks_exact(SCHEMA_RECORD_SIZE) {
        let word = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&record[i * 4..i * 4 + 4]);
            u32::from_le_bytes(buf)
        };
        let kind = SchemaKind::from_u32(word(0)).ok_or(SchemaDecodeError::UnknownKind(word(0)))?;
        entries.push(SchemaEntry {
            kind,
            il_offset: word(1) as i32,
            count: word(2),
            other: word(3),
            offset: word(4),
        });
    }
    Ok(entries)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_count_entry() {
        let e = SchemaEntry::block_count(16);
        assert_eq!(e.kind, SchemaKind::BlockIntCount);
        assert_eq!(e.il_offset, 16);
        assert_eq!(e.count, 1);
        assert_eq!(e.other, 0);
        assert_eq!(e.slot_size(), 4);
    }

    #[test]
    fn test_class_histogram_entries() {
        let [head, table] = SchemaEntry::class_histogram(9, false);
        assert_eq!(head.kind, SchemaKind::TypeHandleHistogramCount);
        assert_eq!(head.count, 1);
        assert_eq!(head.other, CLASS_FLAG);
        assert_eq!(table.kind, SchemaKind::TypeHandleHistogramTypeHandle);
        assert_eq!(table.count, CLASS_PROFILE_SIZE);
        assert_eq!(table.il_offset, 9);
        assert_eq!(table.slot_size(), 8 * CLASS_PROFILE_SIZE as usize);
    }

    #[test]
    fn test_class_histogram_interface_flag() {
        let [head, table] = SchemaEntry::class_histogram(9, true);
        assert_eq!(head.other, CLASS_FLAG | INTERFACE_FLAG);
        assert_eq!(table.other, CLASS_FLAG | INTERFACE_FLAG);
    }

    #[test]
    fn test_buffer_size() {
        let mut schema = vec![SchemaEntry::block_count(0)];
        schema.extend(SchemaEntry::class_histogram(4, false));
        // 4 + 4 + 8 * CLASS_PROFILE_SIZE
        assert_eq!(buffer_size(&schema), 8 + 8 * CLASS_PROFILE_SIZE as usize);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut schema = vec![SchemaEntry::block_count(0), SchemaEntry::block_count(12)];
        schema.extend(SchemaEntry::class_histogram(7, true));
        schema[1].offset = 4;
        let bytes = encode_schema(&schema);
        assert_eq!(bytes.len(), schema.len() * SCHEMA_RECORD_SIZE);
        let decoded = decode_schema(&bytes).unwrap();
        assert_eq!(decoded, schema);
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(decode_schema(&[0u8; 7]), Err(SchemaDecodeError::Truncated));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut bytes = encode_schema(&[SchemaEntry::block_count(0)]);
        bytes[0] = 0xFF;
        assert!(matches!(
            decode_schema(&bytes),
            Err(SchemaDecodeError::UnknownKind(_))
        ));
    }
}
