// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::vec::Vec;

use super::{allocator::SlotTable, DescriptorNode, Graph, Ingested, NodeId};
use crate::{
    description::{Handle, HardwareDescription},
    node::NodeOffset,
    records::{AuxSlice, ObjectKind, RecordKind},
    token::{IdentifierAllocator, Token},
    Error,
};

/// Everything the pipeline needs to know about one recognized kind
///
/// Several handlers may share a kind (for example one per named component);
/// their descriptors end up in the same output array.
pub trait KindHandler<S> {
    fn kind(&self) -> ObjectKind;

    /// Kinds whose descriptors must already be ingested when this kind is
    /// ingested, because ingestion looks them up by handle
    fn depends_on(&self) -> &[ObjectKind] {
        &[]
    }

    /// Fixed `/aliases` entry naming the single node of this handler
    fn alias(&self) -> Option<&str> {
        None
    }

    fn matches(&self, description: &dyn HardwareDescription, node: NodeOffset) -> bool;

    /// Builds the descriptors for one enabled, matching document node
    ///
    /// [`Error::NotFound`] and [`Error::Malformed`] skip the node; any other
    /// error aborts the run.
    fn ingest(
        &self,
        description: &dyn HardwareDescription,
        graph: &Graph<S>,
        node: NodeOffset,
    ) -> Result<Vec<Ingested<S>>, Error>;

    /// Computes derived attributes once every kind has been ingested
    fn propagate(&self, _description: &dyn HardwareDescription, _graph: &mut Graph<S>) -> Result<(), Error> {
        Ok(())
    }

    /// Fills the output record of `node`; a second call for the same node
    /// must leave the record untouched
    fn populate(&self, cx: &mut PopulateContext<'_, S>, node: NodeId) -> Result<(), Error>;
}

/// Access handed to [`KindHandler::populate`]
pub struct PopulateContext<'g, S> {
    pub description: &'g dyn HardwareDescription,
    pub graph: &'g Graph<S>,
    table: &'g mut SlotTable,
    identifiers: &'g mut IdentifierAllocator,
}

impl<'g, S> PopulateContext<'g, S> {
    pub(crate) fn new(
        description: &'g dyn HardwareDescription,
        graph: &'g Graph<S>,
        table: &'g mut SlotTable,
        identifiers: &'g mut IdentifierAllocator,
    ) -> Self {
        Self { description, graph, table, identifiers }
    }

    pub fn node(&self, id: NodeId) -> &'g DescriptorNode<S> {
        let graph = self.graph;
        &graph[id]
    }

    /// Whether the record of `id` already carries its token
    pub fn is_populated(&self, id: NodeId) -> bool {
        let node = &self.graph[id];
        node.slot.and_then(|slot| self.table.record(node.kind, slot)).is_some_and(|record| !record.token().is_null())
    }

    pub fn record<T: RecordKind>(&self, id: NodeId) -> Option<&T> {
        let node = &self.graph[id];
        self.table.record(T::KIND, node.slot?).and_then(T::from_record)
    }

    /// Writes the record of `id`, stamping it with the node's token
    pub fn store<T: RecordKind>(&mut self, id: NodeId, mut record: T) -> Result<(), Error> {
        let node = &self.graph[id];
        if node.kind != T::KIND {
            return Err(Error::Internal("record kind does not match its descriptor"));
        }

        let slot = node.slot.ok_or(Error::ResourceExhausted { what: "output slots" })?;
        let target = self.table.record_mut(T::KIND, slot).ok_or(Error::ResourceExhausted { what: "output slots" })?;

        record.set_token(node.token);
        *target = record.into();

        Ok(())
    }

    /// Writes the entries of the `demand`-th auxiliary reservation of `id`
    /// and returns the slice they occupy
    pub fn write_aux<T: RecordKind>(&mut self, id: NodeId, demand: usize, entries: Vec<T>) -> Result<AuxSlice, Error> {
        let node = &self.graph[id];
        let reserved = node
            .demands
            .get(demand)
            .filter(|d| d.kind == T::KIND)
            .ok_or(Error::Internal("undeclared auxiliary reservation"))?;

        if entries.len() > reserved.count as usize {
            log::error!(
                "{:?} at {} produced {} {:?} entries but reserved {}",
                node.kind,
                self.description.path(node.offset),
                entries.len(),
                T::KIND,
                reserved.count
            );
            return Err(Error::ResourceExhausted { what: "auxiliary entries" });
        }

        let slice = AuxSlice { start: reserved.slice.start, count: entries.len() as u32 };
        for (index, entry) in slice.range().zip(entries) {
            let target =
                self.table.record_mut(T::KIND, index).ok_or(Error::ResourceExhausted { what: "auxiliary entries" })?;
            *target = entry.into();
        }

        Ok(slice)
    }

    /// Token of the `instance`-th descriptor carrying `handle`, or the null
    /// token when there is none
    pub fn reference(&self, from: NodeId, handle: Handle, instance: u32) -> Token {
        match self.graph.find(handle, instance) {
            Some(target) => self.graph[target].token,
            None => {
                let node = &self.graph[from];
                log::warn!(
                    "{:?} at {}: no descriptor for handle {} instance {}, using a null reference",
                    node.kind,
                    self.description.path(node.offset),
                    handle,
                    instance
                );
                Token::NULL
            }
        }
    }

    pub fn next_identifier(&mut self) -> Result<u32, Error> {
        self.identifiers.next()
    }
}
