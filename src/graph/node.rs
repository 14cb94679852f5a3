// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::vec::Vec;

use crate::{
    description::Handle,
    node::NodeOffset,
    records::{AuxSlice, ObjectKind},
    token::Token,
};

/// Position of a descriptor in the node collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A reservation of entries in a shared auxiliary array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxDemand {
    pub kind: ObjectKind,
    pub count: u32,
    /// Filled in by the slot allocator
    pub slice: AuxSlice,
}

/// What a kind handler produces for one matching document node
#[derive(Debug, Clone)]
pub struct Ingested<S> {
    pub handle: Handle,
    pub scratch: S,
    pub demands: Vec<AuxDemand>,
}

impl<S> Ingested<S> {
    pub fn new(handle: Handle, scratch: S) -> Self {
        Self { handle, scratch, demands: Vec::new() }
    }

    /// Reserves `count` entries of the auxiliary `kind`; reservations are
    /// numbered in the order they are made
    pub fn with_aux(mut self, kind: ObjectKind, count: u32) -> Self {
        self.demands.push(AuxDemand { kind, count, slice: AuxSlice::default() });
        self
    }
}

/// One match of a recognized kind in the hardware description
#[derive(Debug, Clone)]
pub struct DescriptorNode<S> {
    pub kind: ObjectKind,
    pub offset: NodeOffset,
    pub handle: Handle,
    /// 1-based position among the descriptors built from the same document node
    pub instance: u32,
    /// Index of the handler that ingested this node
    pub(crate) handler: usize,
    pub(crate) slot: Option<usize>,
    pub(crate) token: Token,
    pub(crate) demands: Vec<AuxDemand>,
    pub scratch: S,
}

impl<S> DescriptorNode<S> {
    /// Index into this kind's output array, `None` before allocation
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// Token of this node's record, null before allocation
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn demands(&self) -> &[AuxDemand] {
        &self.demands
    }

    /// Slice reserved by the `index`-th auxiliary demand
    pub fn aux(&self, index: usize) -> Option<AuxSlice> {
        self.demands.get(index).map(|demand| demand.slice)
    }

    /// Changes the size of an existing reservation; only meaningful before
    /// allocation
    pub fn set_demand(&mut self, index: usize, count: u32) {
        if let Some(demand) = self.demands.get_mut(index) {
            demand.count = count;
        }
    }
}
