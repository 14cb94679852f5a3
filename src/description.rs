// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Read access to a hardware description document.
//!
//! The topology builders never touch the devicetree encoding directly; they
//! go through [`HardwareDescription`], which [`Fdt`] implements. Every lookup
//! tells a missing property ([`PropertyError::NotFound`]) apart from one that
//! exists with the wrong shape ([`PropertyError::Malformed`]).

use alloc::{string::String, vec::Vec};

use crate::{node::NodeOffset, parsing::read_cells, Error, Fdt};

const GIC_SPI: u32 = 0;
const GIC_PPI: u32 = 1;
const GIC_SPI_BASE: u32 = 32;
const GIC_PPI_BASE: u32 = 16;
const IRQ_TYPE_LEVEL_HIGH: u32 = 4;
const GIC_INTERRUPT_CELLS: u32 = 3;

/// A node's `phandle`
///
/// Handles are not unique: several descriptors built from one node share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Handle(u32);

impl Handle {
    /// Reserved value that never matches any node
    pub const INVALID: Self = Handle(0);

    pub const fn new(raw: u32) -> Self {
        Handle(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl core::fmt::Display for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "<{:#x}>", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyError {
    /// The node has no property with that name
    NotFound,
    /// The property exists but its value has the wrong size or encoding
    Malformed,
}

impl PropertyError {
    /// Attaches the node and property this error came from
    pub fn at(self, node: NodeOffset, property: &'static str) -> Error {
        match self {
            PropertyError::NotFound => Error::NotFound { node, property },
            PropertyError::Malformed => Error::Malformed { node, property },
        }
    }
}

/// One `reg` entry decoded with the parent's cell sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Register {
    pub base: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    #[default]
    Level,
    Edge,
}

impl Trigger {
    /// ACPI interrupt flags word: bit 0 set for edge-triggered
    pub fn flags(self) -> u32 {
        match self {
            Trigger::Level => 0,
            Trigger::Edge => 1,
        }
    }
}

/// A GIC interrupt translated to its global interrupt number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interrupt {
    pub id: u32,
    pub trigger: Trigger,
}

impl Interrupt {
    fn from_gic_cells(cells: &[u32]) -> Result<Self, PropertyError> {
        let [kind, number, flags] = cells else {
            return Err(PropertyError::Malformed);
        };

        let base = match *kind {
            GIC_SPI => GIC_SPI_BASE,
            GIC_PPI => GIC_PPI_BASE,
            _ => return Err(PropertyError::Malformed),
        };

        Ok(Interrupt {
            id: number.checked_add(base).ok_or(PropertyError::Malformed)?,
            trigger: match flags & 0xf {
                IRQ_TYPE_LEVEL_HIGH => Trigger::Level,
                _ => Trigger::Edge,
            },
        })
    }
}

/// Hardware Description Provider
pub trait HardwareDescription {
    /// First node after `after` (or from the start when `None`) accepted by
    /// `predicate`, in document order
    fn next_matching(&self, after: Option<NodeOffset>, predicate: &dyn Fn(NodeOffset) -> bool) -> Option<NodeOffset>;

    /// The node's own handle, [`Handle::INVALID`] if it has none
    fn handle(&self, node: NodeOffset) -> Handle;

    /// Raw property value
    fn property(&self, node: NodeOffset, name: &str) -> Result<&[u8], PropertyError>;

    /// `reg` decoded with the parent's `#address-cells` and `#size-cells`
    fn registers(&self, node: NodeOffset) -> Result<Vec<Register>, PropertyError>;

    /// `interrupts` decoded through the node's interrupt parent
    fn interrupts(&self, node: NodeOffset) -> Result<Vec<Interrupt>, PropertyError>;

    /// Node an `/aliases` entry points at
    fn resolve_alias(&self, alias: &str) -> Option<NodeOffset>;

    fn name(&self, node: NodeOffset) -> &str;

    fn path(&self, node: NodeOffset) -> String;

    fn property_u32(&self, node: NodeOffset, name: &str) -> Result<u32, PropertyError> {
        let value = self.property(node, name)?;
        match value.len() {
            4 => read_cells(value, 1).map(|n| n as u32).ok_or(PropertyError::Malformed),
            _ => Err(PropertyError::Malformed),
        }
    }

    /// Accepts both one- and two-cell encodings
    fn property_u64(&self, node: NodeOffset, name: &str) -> Result<u64, PropertyError> {
        let value = self.property(node, name)?;
        match value.len() {
            4 => read_cells(value, 1).ok_or(PropertyError::Malformed),
            8 => read_cells(value, 2).ok_or(PropertyError::Malformed),
            _ => Err(PropertyError::Malformed),
        }
    }

    fn property_cells(&self, node: NodeOffset, name: &str) -> Result<Vec<u32>, PropertyError> {
        let value = self.property(node, name)?;
        if value.len() % 4 != 0 {
            return Err(PropertyError::Malformed);
        }

        value
            .chunks_exact(4)
            .map(|cell| read_cells(cell, 1).map(|n| n as u32).ok_or(PropertyError::Malformed))
            .collect()
    }

    /// Cells of a property that must hold exactly `count` of them
    fn property_cells_exact(&self, node: NodeOffset, name: &str, count: usize) -> Result<Vec<u32>, PropertyError> {
        let cells = self.property_cells(node, name)?;
        match cells.len() == count {
            true => Ok(cells),
            false => Err(PropertyError::Malformed),
        }
    }

    fn property_str(&self, node: NodeOffset, name: &str) -> Result<&str, PropertyError> {
        let value = self.property(node, name)?;
        core::str::from_utf8(value).map(|s| s.trim_end_matches('\0')).map_err(|_| PropertyError::Malformed)
    }

    fn property_strings(&self, node: NodeOffset, name: &str) -> Result<Vec<&str>, PropertyError> {
        let value = self.property_str(node, name)?;
        Ok(value.split('\0').filter(|s| !s.is_empty()).collect())
    }

    fn has_property(&self, node: NodeOffset, name: &str) -> bool {
        self.property(node, name).is_ok()
    }

    fn is_compatible(&self, node: NodeOffset, with: &[&str]) -> bool {
        self.property_strings(node, "compatible")
            .map(|compats| compats.iter().any(|c| with.contains(c)))
            .unwrap_or(false)
    }

    /// `status` is absent, `"okay"` or `"ok"`
    fn is_enabled(&self, node: NodeOffset) -> bool {
        match self.property_str(node, "status") {
            Ok(status) => status == "okay" || status == "ok",
            Err(PropertyError::NotFound) => true,
            Err(PropertyError::Malformed) => false,
        }
    }

    /// Every node accepted by `predicate`, in document order
    fn all_matching(&self, predicate: &dyn Fn(NodeOffset) -> bool) -> Vec<NodeOffset> {
        let mut found = Vec::new();
        let mut after = None;

        while let Some(node) = self.next_matching(after, predicate) {
            found.push(node);
            after = Some(node);
        }

        found
    }
}

impl<'a> HardwareDescription for Fdt<'a> {
    fn next_matching(&self, after: Option<NodeOffset>, predicate: &dyn Fn(NodeOffset) -> bool) -> Option<NodeOffset> {
        let start = after.map_or(0, |offset| offset.index() + 1);
        self.all_nodes().skip(start).map(|node| node.offset()).find(|&offset| predicate(offset))
    }

    fn handle(&self, node: NodeOffset) -> Handle {
        self.node(node).and_then(|n| n.phandle()).map_or(Handle::INVALID, Handle::new)
    }

    fn property(&self, node: NodeOffset, name: &str) -> Result<&[u8], PropertyError> {
        self.node(node).and_then(|n| n.property(name)).map(|p| p.value).ok_or(PropertyError::NotFound)
    }

    fn registers(&self, node: NodeOffset) -> Result<Vec<Register>, PropertyError> {
        let fdt_node = self.node(node).ok_or(PropertyError::NotFound)?;
        let reg = fdt_node.property("reg").ok_or(PropertyError::NotFound)?;
        let sizes = fdt_node.parent_cell_sizes();

        if !(1..=2).contains(&sizes.address_cells) || sizes.size_cells > 2 {
            return Err(PropertyError::Malformed);
        }

        let address_len = sizes.address_cells * 4;
        let entry_len = address_len + sizes.size_cells * 4;
        if reg.value.is_empty() || reg.value.len() % entry_len != 0 {
            return Err(PropertyError::Malformed);
        }

        reg.value
            .chunks_exact(entry_len)
            .map(|entry| {
                Some(Register {
                    base: read_cells(&entry[..address_len], sizes.address_cells)?,
                    size: read_cells(&entry[address_len..], sizes.size_cells)?,
                })
            })
            .map(|register| register.ok_or(PropertyError::Malformed))
            .collect()
    }

    fn interrupts(&self, node: NodeOffset) -> Result<Vec<Interrupt>, PropertyError> {
        let fdt_node = self.node(node).ok_or(PropertyError::NotFound)?;
        let cells = fdt_node.property("interrupts").ok_or(PropertyError::NotFound)?;

        let mut ancestor = Some(fdt_node);
        let parent_handle = loop {
            match ancestor {
                Some(n) => match n.property("interrupt-parent") {
                    Some(prop) => break prop.as_u32().ok_or(PropertyError::Malformed)?,
                    None => ancestor = n.parent(),
                },
                None => return Err(PropertyError::Malformed),
            }
        };

        let controller = self.find_phandle(parent_handle).ok_or(PropertyError::Malformed)?;
        match controller.property("#interrupt-cells").and_then(|p| p.as_u32()) {
            Some(GIC_INTERRUPT_CELLS) => {}
            _ => return Err(PropertyError::Malformed),
        }

        let cells: Vec<u32> = cells.cells().ok_or(PropertyError::Malformed)?.collect();
        if cells.len() % GIC_INTERRUPT_CELLS as usize != 0 {
            return Err(PropertyError::Malformed);
        }

        cells.chunks_exact(GIC_INTERRUPT_CELLS as usize).map(Interrupt::from_gic_cells).collect()
    }

    fn resolve_alias(&self, alias: &str) -> Option<NodeOffset> {
        let path = self.alias(alias)?;
        self.find_node(path).map(|n| n.offset())
    }

    fn name(&self, node: NodeOffset) -> &str {
        self.node(node).map_or("", |n| n.name())
    }

    fn path(&self, node: NodeOffset) -> String {
        self.node(node).map(|n| n.path()).unwrap_or_default()
    }
}
