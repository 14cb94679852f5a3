// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::{string::String, vec::Vec};
use core::ops::Range;

use crate::{
    parsing::{BigEndianU32, CStr, FdtData},
    Fdt, FdtError,
};

pub(crate) const FDT_BEGIN_NODE: u32 = 1;
pub(crate) const FDT_END_NODE: u32 = 2;
pub(crate) const FDT_PROP: u32 = 3;
pub(crate) const FDT_NOP: u32 = 4;
pub(crate) const FDT_END: u32 = 9;

/// Opaque locator of a node inside a parsed devicetree
///
/// Offsets are assigned in depth-first order, so comparing two offsets tells
/// which node comes first in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeOffset(pub(crate) usize);

impl NodeOffset {
    pub const ROOT: Self = NodeOffset(0);

    pub fn index(self) -> usize {
        self.0
    }
}

impl core::fmt::Display for NodeOffset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RawNode<'a> {
    name: &'a str,
    parent: Option<usize>,
    props: Range<usize>,
}

/// Depth-first table of every node in the structure block, built once when the
/// [`Fdt`] is constructed
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeTable<'a> {
    nodes: Vec<RawNode<'a>>,
    props: Vec<NodeProperty<'a>>,
}

impl<'a> NodeTable<'a> {
    pub(crate) fn parse(structs: &'a [u8], strings: &'a [u8]) -> Result<Self, FdtError> {
        let mut table = NodeTable::default();
        let mut stream = FdtData::new(structs);
        let mut parents: Vec<usize> = Vec::new();

        loop {
            stream.skip_nops();

            match stream.u32().ok_or(FdtError::UnexpectedEndOfData)?.get() {
                FDT_BEGIN_NODE => {
                    let unit_name = CStr::new(stream.remaining()).ok_or(FdtError::InvalidString)?;
                    let name = unit_name.as_str().ok_or(FdtError::InvalidString)?;
                    stream.skip_aligned(unit_name.len() + 1);

                    let at = table.props.len();
                    table.nodes.push(RawNode { name, parent: parents.last().copied(), props: at..at });
                    parents.push(table.nodes.len() - 1);
                }
                FDT_PROP => {
                    let current = *parents.last().ok_or(FdtError::UnexpectedToken(FDT_PROP))?;
                    let len = stream.u32().ok_or(FdtError::UnexpectedEndOfData)?.get() as usize;
                    let name_offset = stream.u32().ok_or(FdtError::UnexpectedEndOfData)?.get() as usize;
                    let value = stream.remaining().get(..len).ok_or(FdtError::UnexpectedEndOfData)?;
                    stream.skip_aligned(len);

                    let name = strings
                        .get(name_offset..)
                        .and_then(CStr::new)
                        .and_then(|s| s.as_str())
                        .ok_or(FdtError::InvalidString)?;

                    table.props.push(NodeProperty { name, value });
                    table.nodes[current].props.end = table.props.len();
                }
                FDT_END_NODE => {
                    parents.pop().ok_or(FdtError::UnexpectedToken(FDT_END_NODE))?;
                }
                FDT_END if parents.is_empty() && !table.nodes.is_empty() => break,
                other => return Err(FdtError::UnexpectedToken(other)),
            }
        }

        Ok(table)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// A devicetree node
#[derive(Clone, Copy)]
pub struct FdtNode<'b, 'a: 'b> {
    pub(crate) fdt: &'b Fdt<'a>,
    pub(crate) offset: NodeOffset,
}

impl core::fmt::Debug for FdtNode<'_, '_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FdtNode").field("offset", &self.offset).field("name", &self.name()).finish()
    }
}

impl<'b, 'a: 'b> FdtNode<'b, 'a> {
    fn raw(self) -> &'b RawNode<'a> {
        &self.fdt.table.nodes[self.offset.0]
    }

    /// Full unit name of the node, `/` for the root node
    pub fn name(self) -> &'a str {
        match self.raw().name {
            "" => "/",
            name => name,
        }
    }

    pub fn offset(self) -> NodeOffset {
        self.offset
    }

    pub fn parent(self) -> Option<FdtNode<'b, 'a>> {
        self.raw().parent.map(|index| FdtNode { fdt: self.fdt, offset: NodeOffset(index) })
    }

    /// Returns an iterator over the children of the current node
    pub fn children(self) -> impl Iterator<Item = FdtNode<'b, 'a>> {
        let fdt = self.fdt;
        let me = self.offset.0;

        (me + 1..fdt.table.len())
            .filter(move |&index| fdt.table.nodes[index].parent == Some(me))
            .map(move |index| FdtNode { fdt, offset: NodeOffset(index) })
    }

    /// Returns an iterator over the available properties of the node
    pub fn properties(self) -> impl Iterator<Item = NodeProperty<'a>> + 'b {
        self.fdt.table.props[self.raw().props.clone()].iter().copied()
    }

    /// Attempts to find the a property by its name
    pub fn property(self, name: &str) -> Option<NodeProperty<'a>> {
        self.properties().find(|p| p.name == name)
    }

    /// Absolute path of the node, e.g. `/cpus/cpu@0`
    pub fn path(self) -> String {
        let mut chain = Vec::new();
        let mut node = Some(self);

        while let Some(current) = node {
            if current.raw().parent.is_some() {
                chain.push(current.raw().name);
            }
            node = current.parent();
        }

        if chain.is_empty() {
            return String::from("/");
        }

        let mut path = String::new();
        for name in chain.iter().rev() {
            path.push('/');
            path.push_str(name);
        }

        path
    }

    /// `compatible` property, empty when the node has none
    pub fn compatible(self) -> impl Iterator<Item = &'a str> + 'a {
        self.property("compatible").into_iter().flat_map(NodeProperty::iter_str)
    }

    /// `phandle` property, falling back to the legacy `linux,phandle`
    pub fn phandle(self) -> Option<u32> {
        self.property("phandle").or_else(|| self.property("linux,phandle")).and_then(NodeProperty::as_u32)
    }

    /// Cell sizes for child nodes
    pub fn cell_sizes(self) -> CellSizes {
        let mut cell_sizes = CellSizes::default();

        for property in self.properties() {
            match property.name {
                "#address-cells" => {
                    if let Some(cells) = property.as_u32() {
                        cell_sizes.address_cells = cells as usize;
                    }
                }
                "#size-cells" => {
                    if let Some(cells) = property.as_u32() {
                        cell_sizes.size_cells = cells as usize;
                    }
                }
                _ => {}
            }
        }

        cell_sizes
    }

    /// Cell sizes that apply to this node's own `reg` property
    pub fn parent_cell_sizes(self) -> CellSizes {
        self.parent().map(FdtNode::cell_sizes).unwrap_or_default()
    }
}

/// The number of cells (big endian u32s) that addresses and sizes take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSizes {
    /// Size of values representing an address
    pub address_cells: usize,
    /// Size of values representing a size
    pub size_cells: usize,
}

impl Default for CellSizes {
    fn default() -> Self {
        CellSizes { address_cells: 2, size_cells: 1 }
    }
}

/// A node property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeProperty<'a> {
    /// Property name
    pub name: &'a str,
    /// Property value
    pub value: &'a [u8],
}

impl<'a> NodeProperty<'a> {
    /// Parses the value as a single cell, failing on any other length
    pub fn as_u32(self) -> Option<u32> {
        match self.value.len() {
            4 => BigEndianU32::from_bytes(self.value).map(BigEndianU32::get),
            _ => None,
        }
    }

    /// Attempt to parse the property value as a `&str`
    pub fn as_str(self) -> Option<&'a str> {
        core::str::from_utf8(self.value).map(|s| s.trim_end_matches('\0')).ok()
    }

    /// Attempts to parse the property value as a list of [`&str`].
    pub fn iter_str(self) -> impl Iterator<Item = &'a str> + 'a {
        let mut s = self.as_str().filter(|s| !s.is_empty()).map(|s| s.split('\0'));

        core::iter::from_fn(move || match s.as_mut() {
            Some(s) => s.next(),
            None => None,
        })
    }

    /// Iterator over the value as big-endian cells, `None` if the length is not
    /// a whole number of cells
    pub fn cells(self) -> Option<impl Iterator<Item = u32> + 'a> {
        if self.value.len() % 4 != 0 {
            return None;
        }

        Some(self.value.chunks_exact(4).filter_map(|c| BigEndianU32::from_bytes(c).map(BigEndianU32::get)))
    }
}
