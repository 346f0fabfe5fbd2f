//! Endianness aware record codec shared by every table of every header revision.

use binrw::Endian;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::trace;

use crate::error::{Error, Result};
use crate::version::VersionLayout;

/// Location of one integer field inside a fixed size record
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub width: usize,
}

impl Field {
    /// A field the revision does not store
    pub const ABSENT: Field = Field {
        offset: 0,
        width: 0,
    };

    pub const fn new(offset: usize, width: usize) -> Self {
        Self { offset, width }
    }

    pub const fn is_present(&self) -> bool {
        self.width != 0
    }

    pub const fn end(&self) -> usize {
        self.offset + self.width
    }
}

/// Reads and writes [`Field`]s with a fixed byte order
#[derive(Debug, Copy, Clone)]
pub struct RecordCodec {
    endian: Endian,
}

impl RecordCodec {
    pub fn new(endian: Endian) -> Self {
        Self { endian }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Reads an unsigned field, absent fields read as zero
    pub fn get(&self, record: &[u8], field: Field) -> u64 {
        if !field.is_present() {
            return 0;
        }

        let bytes = &record[field.offset..field.end()];
        match self.endian {
            Endian::Little => LittleEndian::read_uint(bytes, field.width),
            Endian::Big => BigEndian::read_uint(bytes, field.width),
        }
    }

    /// Writes an unsigned field, absent fields are skipped
    pub fn put(&self, record: &mut [u8], field: Field, value: u64) -> Result<()> {
        if !field.is_present() {
            return Ok(());
        }

        if field.width < 8 && value >> (field.width * 8) != 0 {
            return Err(Error::invalid_argument(format!(
                "value {value:#x} does not fit in a {} byte field",
                field.width
            )));
        }

        let bytes = &mut record[field.offset..field.end()];
        match self.endian {
            Endian::Little => LittleEndian::write_uint(bytes, value, field.width),
            Endian::Big => BigEndian::write_uint(bytes, value, field.width),
        }
        Ok(())
    }
}

/// A row type of one of the header tables
pub trait TableRecord: Sized {
    /// Size of one record, zero when the revision has no such table
    fn record_size(layout: &VersionLayout) -> usize;

    /// Decodes one record, keeping the record bytes for verbatim re-encoding
    fn decode(codec: &RecordCodec, layout: &VersionLayout, record: &[u8]) -> Self;

    /// Writes the known fields into `record`, which already holds the preserved bytes
    fn encode(&self, codec: &RecordCodec, layout: &VersionLayout, record: &mut [u8]) -> Result<()>;

    /// The bytes this row was decoded from, empty for rows built in memory
    fn preserved(&self) -> &[u8];
}

/// How far a table extends from its start offset
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TableExtent {
    /// A number of records
    Count(usize),
    /// A number of bytes
    Size(usize),
}

/// Returns the slice `[offset, offset + len)` clamped to `buffer`, empty when out of bounds
pub fn table_bytes(buffer: &[u8], offset: u64, len: usize) -> &[u8] {
    let Ok(start) = usize::try_from(offset) else {
        return &[];
    };
    if start >= buffer.len() || len == 0 {
        return &[];
    }
    let end = start.saturating_add(len).min(buffer.len());
    &buffer[start..end]
}

/// Decodes a table of `T` records
///
/// Out of bounds or zero sized requests yield an empty table, and a trailing partial record
/// is ignored, so a slightly damaged header still loads.
pub fn decode_table<T: TableRecord>(
    buffer: &[u8],
    codec: &RecordCodec,
    layout: &VersionLayout,
    offset: u64,
    extent: TableExtent,
) -> Vec<T> {
    let record_size = T::record_size(layout);
    if record_size == 0 {
        return Vec::new();
    }

    let len = match extent {
        TableExtent::Count(count) => count.saturating_mul(record_size),
        TableExtent::Size(size) => size,
    };
    let bytes = table_bytes(buffer, offset, len);
    if bytes.len() < len {
        trace!(offset, len, available = bytes.len(), "table truncated");
    }

    bytes
        .chunks_exact(record_size)
        .map(|record| T::decode(codec, layout, record))
        .collect()
}

/// Encodes a table of `T` records
pub fn encode_table<T: TableRecord>(
    rows: &[T],
    codec: &RecordCodec,
    layout: &VersionLayout,
) -> Result<Vec<u8>> {
    let record_size = T::record_size(layout);
    let mut output = Vec::with_capacity(record_size * rows.len());
    for row in rows {
        let mut record = match row.preserved() {
            preserved if preserved.len() == record_size => preserved.to_vec(),
            _ => vec![0u8; record_size],
        };
        row.encode(codec, layout, &mut record)?;
        output.extend_from_slice(&record);
    }
    Ok(output)
}

#[cfg(test)]
mod test {
    use binrw::Endian;
    use pretty_assertions::assert_eq;

    use crate::codec::{table_bytes, Field, RecordCodec};
    use crate::error::Result;

    #[test]
    fn reads_fields_in_both_byte_orders() {
        let record = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let little = RecordCodec::new(Endian::Little);
        let big = RecordCodec::new(Endian::Big);

        assert_eq!(little.get(&record, Field::new(0, 4)), 0x0403_0201);
        assert_eq!(big.get(&record, Field::new(0, 4)), 0x0102_0304);
        assert_eq!(big.get(&record, Field::new(4, 2)), 0x0506);
        assert_eq!(big.get(&record, Field::ABSENT), 0);
    }

    #[test]
    fn writes_fields_in_both_byte_orders() -> Result<()> {
        let mut record = [0u8; 6];
        RecordCodec::new(Endian::Big).put(&mut record, Field::new(2, 4), 0xAABB_CCDD)?;
        assert_eq!(record, [0x00, 0x00, 0xAA, 0xBB, 0xCC, 0xDD]);

        RecordCodec::new(Endian::Little).put(&mut record, Field::new(0, 2), 0x1234)?;
        assert_eq!(record, [0x34, 0x12, 0xAA, 0xBB, 0xCC, 0xDD]);
        Ok(())
    }

    #[test]
    fn rejects_values_wider_than_the_field() {
        let mut record = [0u8; 2];
        let result = RecordCodec::new(Endian::Little).put(&mut record, Field::new(0, 2), 0x1_0000);
        assert!(result.is_err());
        assert_eq!(record, [0, 0]);
    }

    #[test]
    fn table_bytes_is_bounds_tolerant() {
        let buffer = [1u8, 2, 3, 4];
        assert!(table_bytes(&buffer, 4, 2).is_empty());
        assert!(table_bytes(&buffer, 100, 2).is_empty());
        assert!(table_bytes(&buffer, 1, 0).is_empty());
        assert_eq!(table_bytes(&buffer, 2, 10), &[3, 4]);
    }
}
