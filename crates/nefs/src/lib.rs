//! This library handles reading from and creating **NeFS** archives used by the EGO engine racing
//! games.
//!
//! # NeFS Archive Format Documentation
//!
//! A NeFS archive packs a hierarchy of files and directories into one or more volume files. Each
//! file is sliced into fixed size chunks which are compressed (zlib or LZSS) and optionally
//! encrypted with a single archive wide AES-256 key. Five header revisions are known:
//!
//! | Revision | Version field | Endianness | Intro + TOC size | Tables |
//! |----------|---------------|------------|------------------|--------|
//! | 0.1.0    | `0x00000100`  | little     | `0x60`           | 5      |
//! | 1.5.0    | `0x00010500`  | little     | `0xA0`           | 7      |
//! | 1.5.1    | `0x00010501`  | big        | `0xA0`           | 7      |
//! | 1.6.0    | `0x00010600`  | little     | `0x100`          | 8      |
//! | 2.0.0    | `0x00020000`  | little     | `0x100`          | 8      |
//!
//! ## File Structure
//!
//! The primary volume starts with the header, followed by the payload at the header size aligned
//! up to 16 bytes.
//!
//! | Part                 | Description                                                    |
//! |----------------------|----------------------------------------------------------------|
//! | Intro                | Magic `NeFS`, hash, header size, version, counts, AES key      |
//! | Table of contents    | Start offset of every table, block size, split size            |
//! | Entry table          | Where each item's stored bytes start, one row per item id      |
//! | Shared-info table    | Parent, first child, name, extracted size; shared by duplicates |
//! | Name table           | NUL terminated names addressed by offset                       |
//! | Block table          | Running stored size of every chunk                             |
//! | Volume-info table    | Name, size and data offset of every volume                     |
//! | Writeable entry      | Volume index and flags of each item (1.5.0 onwards)            |
//! | Writeable shared-info| Sibling and patch ids of each primary item (1.5.0 onwards)     |
//! | Hash digests         | SHA-256 of each payload block (1.6.0 onwards)                  |
//!
//! Tables are placed in table of contents order, each aligned to four bytes. Sizes marked as
//! such are stored shifted right by 15 bits.
//!
//! ### Header Hash
//!
//! The header hash is a SHA-256 over the whole header with the hash field skipped. The AES key
//! field is skipped as well when the header itself is encrypted. Encrypted headers can be read
//! (their tables are not decoded) but not saved.
//!
//! ### Items
//!
//! - **Ids** are entry table rows, ordered depth first by id.
//! - **Duplicates** are later entries sharing the shared-info row of the first member of their
//!   group; the last one is the active patch.
//! - **Block index** of an entry is `0` for directories, `0xFFFFFFFF` for files stored without
//!   chunks and otherwise the index of the item's first block table row.
//!
//! ## Additional Information
//!
//! - **Default block size**: `0x10000`
//! - **Default hash block size**: `0x800000`
//! - **Split volumes**: `name.000`, `name.001`, ... of `split size` bytes each
//!
//! ```no_run
//! use nefs::{progress::NefsProgress, NefsArchive};
//!
//! # fn main() -> nefs::error::Result<()> {
//! let archive = NefsArchive::open("game.nefs")?;
//! let summary = archive.extract_all("out", &NefsProgress::new())?;
//! println!("extracted {} files", summary.extracted);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod codec;
pub mod compression;
pub mod error;
pub mod header;
pub mod item;
pub mod progress;
pub mod read;
pub mod source;
pub mod transform;
pub mod types;
pub mod version;
pub mod write;

pub use archive::NefsArchive;
pub use compression::{NefsTransformer, StandardTransformer};
pub use header::NefsHeader;
pub use item::{NefsItem, NefsItemId, NefsItemList};
pub use read::NefsReader;
pub use version::NefsVersion;
pub use write::NefsWriter;
