//! The offset addressed name table.

use std::cmp::Ordering;

use indexmap::IndexMap;

use crate::codec::table_bytes;
use crate::error::{Error, Result};

/// Compares names ordinally after folding each character to upper case
///
/// This is the order names are stored in, and the order depth-first-by-name traversal visits
/// siblings in.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_uppercase)
        .cmp(b.chars().flat_map(char::to_uppercase))
}

/// Packed NUL terminated names, addressed by their offset from the table start
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    names: IndexMap<u32, String>,
    raw: Vec<u8>,
}

impl NameTable {
    /// Decodes the `len` bytes at `offset` of `buffer`
    pub fn read(buffer: &[u8], offset: u64, len: usize) -> Self {
        Self::decode(table_bytes(buffer, offset, len))
    }

    /// Decodes a name table
    ///
    /// Consecutive NULs produce an empty name, and trailing bytes without a terminator still
    /// form a final name.
    pub fn decode(bytes: &[u8]) -> Self {
        let mut names = IndexMap::new();
        let mut start = 0usize;

        for (position, byte) in bytes.iter().enumerate() {
            if *byte == 0 {
                names.insert(
                    start as u32,
                    String::from_utf8_lossy(&bytes[start..position]).into_owned(),
                );
                start = position + 1;
            }
        }

        if start < bytes.len() {
            names.insert(
                start as u32,
                String::from_utf8_lossy(&bytes[start..]).into_owned(),
            );
        }

        Self {
            names,
            raw: bytes.to_vec(),
        }
    }

    /// Builds a fresh table holding `names` and the volume file name
    ///
    /// Names are sorted by [`compare_names`] and stored once each.
    pub fn build<'a>(names: impl IntoIterator<Item = &'a str>, volume_name: &'a str) -> Result<Self> {
        let mut sorted: Vec<&str> = names.into_iter().chain([volume_name]).collect();
        sorted.sort_by(|a, b| compare_names(a, b).then_with(|| a.cmp(b)));
        sorted.dedup();

        let mut table = Self::default();
        for name in sorted {
            if name.as_bytes().contains(&0) {
                return Err(Error::invalid_argument(format!(
                    "name {name:?} contains a NUL byte"
                )));
            }
            let offset = u32::try_from(table.raw.len())
                .map_err(|_| Error::invalid_argument("name table exceeds 4 GiB"))?;
            table.raw.extend_from_slice(name.as_bytes());
            table.raw.push(0);
            table.names.insert(offset, name.to_owned());
        }

        Ok(table)
    }

    /// Name stored at `offset`
    pub fn get(&self, offset: u32) -> Option<&str> {
        self.names.get(&offset).map(String::as_str)
    }

    /// Offset of `name`, if present
    pub fn offset_of(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .find_map(|(offset, n)| (n == name).then_some(*offset))
    }

    /// Iterates names with their offsets in table order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.names.iter().map(|(offset, name)| (*offset, name.as_str()))
    }

    /// Number of names
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the table holds no names
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Encoded table bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}
