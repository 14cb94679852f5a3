// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! # `fdt-topology`
//!
//! A pure-Rust `#![no_std]` crate that turns a Flattened Devicetree into the
//! cross-referenced hardware-topology records a firmware table generator
//! consumes: the processor cache hierarchy and the I/O remapping topology.
//!
//! Both builders share one engine ([`graph`]): every recognized devicetree node
//! becomes a descriptor, descriptors are linked by `phandle`, derived
//! attributes are propagated, output slots and [`Token`]s are allocated for
//! every kind at once, and only then are records populated and handed to an
//! [`ObjectRepository`]. A run either hands over a complete, internally
//! consistent set of records or nothing at all.
//!
//! ## License
//!
//! This crate is licensed under the Mozilla Public License 2.0 (see the LICENSE file).
//!
//! ## Example
//!
//! ```rust,no_run
//! use fdt_topology::{iort, Fdt, InMemoryRepository};
//!
//! fn describe(blob: &[u8]) {
//!     let fdt = Fdt::new(blob).unwrap();
//!     let mut repository = InMemoryRepository::new();
//!
//!     let outcome = iort::build(&fdt, &mut repository, iort::IortConfig::default()).unwrap();
//!     println!("{:?}", outcome);
//!
//!     for entry in repository.entries() {
//!         println!("{:?}: {} record(s)", entry.kind, entry.records.len());
//!     }
//! }
//! ```

#![no_std]

extern crate alloc;

#[cfg(test)]
mod tests;

pub mod cache;
pub mod description;
pub mod error;
pub mod graph;
pub mod iort;
pub mod node;
mod parsing;
pub mod records;
pub mod repository;
pub mod token;

pub use description::{Handle, HardwareDescription, Interrupt, PropertyError, Register, Trigger};
pub use error::Error;
pub use node::{FdtNode, NodeOffset, NodeProperty};
pub use records::{ObjectKind, Record};
pub use repository::{InMemoryRepository, ObjectRepository};
pub use token::{IdentifierAllocator, Token};

use node::NodeTable;
use parsing::{BigEndianU32, FdtData};

/// Possible errors when attempting to create an `Fdt`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdtError {
    /// The FDT had an invalid magic value
    BadMagic,
    /// The slice passed in was too small to fit the given total size of the FDT
    /// structure
    BufferTooSmall,
    /// A block offset in the header points outside of the FDT
    BadOffset,
    /// The structure block contained a token that is invalid at its position
    UnexpectedToken(u32),
    /// The structure block ended before the `FDT_END` token
    UnexpectedEndOfData,
    /// A node or property name was not terminated or not valid UTF-8
    InvalidString,
}

impl core::fmt::Display for FdtError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FdtError::BadMagic => write!(f, "bad FDT magic value"),
            FdtError::BufferTooSmall => {
                write!(f, "the given buffer was too small to contain a FDT header")
            }
            FdtError::BadOffset => write!(f, "FDT header block offsets are out of bounds"),
            FdtError::UnexpectedToken(token) => {
                write!(f, "encountered an unexpected FDT token value ({token:#x}) while parsing")
            }
            FdtError::UnexpectedEndOfData => {
                write!(f, "encountered end of data while parsing but expected more")
            }
            FdtError::InvalidString => write!(f, "cstr was either non-terminated or invalid UTF-8"),
        }
    }
}

impl core::error::Error for FdtError {}

/// A flattened devicetree located somewhere in memory
///
/// The structure block is walked once on construction, so every later query
/// is an index lookup and a malformed structure is reported up front.
#[derive(Clone)]
pub struct Fdt<'a> {
    header: FdtHeader,
    table: NodeTable<'a>,
}

impl core::fmt::Debug for Fdt<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fdt").field("total_size", &self.total_size()).field("nodes", &self.table.len()).finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct FdtHeader {
    /// FDT header magic
    magic: BigEndianU32,
    /// Total size in bytes of the FDT structure
    totalsize: BigEndianU32,
    /// Offset in bytes from the start of the header to the structure block
    off_dt_struct: BigEndianU32,
    /// Offset in bytes from the start of the header to the strings block
    off_dt_strings: BigEndianU32,
    /// FDT version
    version: BigEndianU32,
    /// Last compatible FDT version
    last_comp_version: BigEndianU32,
    /// Length in bytes of the strings block
    size_dt_strings: BigEndianU32,
    /// Length in bytes of the struct block
    size_dt_struct: BigEndianU32,
}

impl FdtHeader {
    fn valid_magic(&self) -> bool {
        self.magic.get() == 0xd00dfeed
    }

    fn struct_range(&self) -> core::ops::Range<usize> {
        let start = self.off_dt_struct.get() as usize;
        let end = start + self.size_dt_struct.get() as usize;

        start..end
    }

    fn strings_range(&self) -> core::ops::Range<usize> {
        let start = self.off_dt_strings.get() as usize;
        let end = start + self.size_dt_strings.get() as usize;

        start..end
    }

    fn from_bytes(bytes: &mut FdtData<'_>) -> Option<Self> {
        let magic = bytes.u32()?;
        let totalsize = bytes.u32()?;
        let off_dt_struct = bytes.u32()?;
        let off_dt_strings = bytes.u32()?;
        // memory reservation block
        bytes.u32()?;
        let version = bytes.u32()?;
        let last_comp_version = bytes.u32()?;
        // boot CPU
        bytes.u32()?;

        Some(Self {
            magic,
            totalsize,
            off_dt_struct,
            off_dt_strings,
            version,
            last_comp_version,
            size_dt_strings: bytes.u32()?,
            size_dt_struct: bytes.u32()?,
        })
    }
}

impl<'a> Fdt<'a> {
    /// Construct a new `Fdt` from a byte buffer
    ///
    /// Note: this function does ***not*** require that the data be 4-byte
    /// aligned
    pub fn new(data: &'a [u8]) -> Result<Self, FdtError> {
        let mut stream = FdtData::new(data);
        let header = FdtHeader::from_bytes(&mut stream).ok_or(FdtError::BufferTooSmall)?;

        if !header.valid_magic() {
            return Err(FdtError::BadMagic);
        } else if data.len() < header.totalsize.get() as usize {
            return Err(FdtError::BufferTooSmall);
        }

        let structs = data.get(header.struct_range()).ok_or(FdtError::BadOffset)?;
        let strings = data.get(header.strings_range()).ok_or(FdtError::BadOffset)?;
        let table = NodeTable::parse(structs, strings)?;

        log::debug!(
            "parsed FDT v{} (last compatible v{}) with {} nodes",
            header.version.get(),
            header.last_comp_version.get(),
            table.len()
        );

        Ok(Self { header, table })
    }

    /// Total size of the devicetree in bytes
    pub fn total_size(&self) -> usize {
        self.header.totalsize.get() as usize
    }

    /// Return the root (`/`) node
    pub fn root(&self) -> FdtNode<'_, 'a> {
        FdtNode { fdt: self, offset: NodeOffset::ROOT }
    }

    /// Returns the node at `offset`, if the offset belongs to this devicetree
    pub fn node(&self, offset: NodeOffset) -> Option<FdtNode<'_, 'a>> {
        (offset.0 < self.table.len()).then_some(FdtNode { fdt: self, offset })
    }

    /// Returns an iterator over all of the nodes in the devicetree, depth-first
    pub fn all_nodes(&self) -> impl Iterator<Item = FdtNode<'_, 'a>> {
        (0..self.table.len()).map(move |index| FdtNode { fdt: self, offset: NodeOffset(index) })
    }

    /// Returns the first node that matches the node path. This will
    /// automatically attempt to resolve aliases if `path` is not found.
    ///
    /// Note: if the address of a node name is left out, the search will find
    /// the first node that has a matching name, ignoring the address portion if
    /// it exists.
    pub fn find_node(&self, path: &str) -> Option<FdtNode<'_, 'a>> {
        if !path.starts_with('/') {
            return self.alias(path).filter(|target| target.starts_with('/')).and_then(|target| self.find_node(target));
        }

        let mut node = self.root();
        for looking_for in path.split('/').filter(|part| !part.is_empty()) {
            let looking_contains_addr = looking_for.contains('@');

            node = node.children().find(|child| {
                let name = child.name();
                match looking_contains_addr {
                    true => name == looking_for,
                    false => name.split('@').next() == Some(looking_for),
                }
            })?;
        }

        Some(node)
    }

    /// Path stored for `alias` in the `/aliases` node
    pub fn alias(&self, alias: &str) -> Option<&'a str> {
        self.root().children().find(|n| n.name() == "aliases")?.property(alias)?.as_str()
    }

    /// Searches for the given `phandle`
    pub fn find_phandle(&self, phandle: u32) -> Option<FdtNode<'_, 'a>> {
        self.all_nodes().find(|n| n.phandle() == Some(phandle))
    }
}
