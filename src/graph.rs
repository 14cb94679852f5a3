// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! The handle-resolving graph shared by every table builder.
//!
//! A run goes strictly forward through five stages: ingestion builds one
//! [`DescriptorNode`] per matching document node, propagation computes derived
//! attributes, allocation sizes the output arrays and hands out [`Token`]s,
//! population fills the records and assembly passes the arrays to an
//! [`ObjectRepository`]. Nothing reaches the repository unless every stage
//! succeeded.
//!
//! [`Token`]: crate::Token

mod allocator;
mod index;
mod kind;
mod node;

pub use allocator::{OutputArray, SlotTable};
pub use index::HandleIndex;
pub use kind::{KindHandler, PopulateContext};
pub use node::{AuxDemand, DescriptorNode, Ingested, NodeId};

use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

use crate::{
    description::{Handle, HardwareDescription},
    node::NodeOffset,
    records::ObjectKind,
    repository::ObjectRepository,
    token::IdentifierAllocator,
    Error,
};

/// How a run ended without a fatal error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Record count per kind, in the order the kinds were handed over
    Assembled(Vec<(ObjectKind, usize)>),
    /// The table was left out; nothing was handed to the repository
    Omitted(&'static str),
}

/// The node collection of one run, plus its handle index
#[derive(Debug, Clone)]
pub struct Graph<S> {
    pub(crate) nodes: Vec<DescriptorNode<S>>,
    index: HandleIndex,
}

impl<S> Default for Graph<S> {
    fn default() -> Self {
        Self { nodes: Vec::new(), index: HandleIndex::default() }
    }
}

impl<S> Graph<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&DescriptorNode<S>> {
        self.nodes.get(id.0)
    }

    /// Every node id, in ingestion order
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &DescriptorNode<S>)> {
        self.nodes.iter().enumerate().map(|(index, node)| (NodeId(index), node))
    }

    /// Nodes of `kind`, in ingestion order
    pub fn nodes_of(&self, kind: ObjectKind) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes().filter(move |(_, node)| node.kind == kind).map(|(id, _)| id)
    }

    /// The `instance`-th node (1-based) carrying `handle`, across all kinds
    pub fn find(&self, handle: Handle, instance: u32) -> Option<NodeId> {
        self.index.find(handle, instance)
    }

    pub fn handles(&self) -> &HandleIndex {
        &self.index
    }

    pub(crate) fn push(
        &mut self,
        kind: ObjectKind,
        offset: NodeOffset,
        handler: usize,
        instance: u32,
        ingested: Ingested<S>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.index.insert(ingested.handle, id);
        self.nodes.push(DescriptorNode {
            kind,
            offset,
            handle: ingested.handle,
            instance,
            handler,
            slot: None,
            token: crate::Token::NULL,
            demands: ingested.demands,
            scratch: ingested.scratch,
        });

        id
    }

    /// Checks that no handler is declared ahead of a kind it depends on
    ///
    /// A dependency that is not declared at all is fine: its lookups simply
    /// never match.
    pub fn validate_order(handlers: &[&dyn KindHandler<S>]) -> Result<(), Error> {
        for (position, handler) in handlers.iter().enumerate() {
            for &dependency in handler.depends_on() {
                let earlier = handlers[..position].iter().any(|h| h.kind() == dependency);
                let later = handlers[position + 1..].iter().any(|h| h.kind() == dependency);

                if later && !earlier {
                    log::error!("{:?} is declared before {dependency:?}, which it looks up", handler.kind());
                    return Err(Error::DeclarationOrder { kind: handler.kind(), dependency });
                }
            }
        }

        Ok(())
    }

    /// Builds the node collection, one handler at a time in declaration order
    pub fn ingest(
        &mut self,
        description: &dyn HardwareDescription,
        handlers: &[&dyn KindHandler<S>],
    ) -> Result<(), Error> {
        for (position, handler) in handlers.iter().enumerate() {
            let kind = handler.kind();
            let candidates = match handler.alias() {
                Some(alias) => match description.resolve_alias(alias) {
                    Some(node) if description.is_enabled(node) => alloc::vec![node],
                    Some(node) => {
                        log::debug!("{kind:?}: `{alias}` at {} is disabled", description.path(node));
                        Vec::new()
                    }
                    None => {
                        log::warn!("{kind:?}: alias `{alias}` does not resolve to a node");
                        Vec::new()
                    }
                },
                None => description
                    .all_matching(&|node| handler.matches(description, node) && description.is_enabled(node)),
            };

            for offset in candidates {
                let ingested = match handler.ingest(description, self, offset) {
                    Ok(ingested) => ingested,
                    Err(error) if error.is_node_local() => {
                        log::warn!("skipping {kind:?} at {}: {error}", description.path(offset));
                        continue;
                    }
                    Err(error) => {
                        log::error!("ingesting {kind:?} at {} failed: {error}", description.path(offset));
                        return Err(error);
                    }
                };

                for (instance, entry) in (1u32..).zip(ingested) {
                    let id = self.push(kind, offset, position, instance, entry);
                    log::debug!("{kind:?} #{} from {} (instance {instance})", id.0, description.path(offset));
                }
            }
        }

        Ok(())
    }

    pub fn propagate(
        &mut self,
        description: &dyn HardwareDescription,
        handlers: &[&dyn KindHandler<S>],
    ) -> Result<(), Error> {
        for handler in handlers {
            handler.propagate(description, self)?;
        }

        Ok(())
    }

    /// Sizes the output arrays and assigns every node its slot and token
    pub fn allocate<R: ObjectRepository + ?Sized>(
        &mut self,
        handlers: &[&dyn KindHandler<S>],
        repository: &mut R,
    ) -> Result<SlotTable, Error> {
        SlotTable::allocate(self, &declared_kinds(handlers), repository)
    }

    /// Fills every record, kind by kind in declaration order, each node
    /// through the handler that ingested it
    pub fn populate(
        &self,
        description: &dyn HardwareDescription,
        handlers: &[&dyn KindHandler<S>],
        table: &mut SlotTable,
        identifiers: &mut IdentifierAllocator,
    ) -> Result<(), Error> {
        let mut cx = PopulateContext::new(description, self, table, identifiers);

        for kind in declared_kinds(handlers) {
            for id in self.nodes_of(kind) {
                let node = &self[id];
                let handler = handlers.get(node.handler).ok_or(Error::Internal("node without a handler"))?;

                if let Err(error) = handler.populate(&mut cx, id) {
                    log::error!("populating {kind:?} at {} failed: {error}", description.path(node.offset));
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    /// Runs every stage and hands the result to `repository`
    pub fn run<R: ObjectRepository + ?Sized>(
        description: &dyn HardwareDescription,
        repository: &mut R,
        handlers: &[&dyn KindHandler<S>],
    ) -> Result<Outcome, Error> {
        Self::run_with(description, repository, handlers, |_, _, _| Ok(()))
    }

    /// Like [`Graph::run`], with `finish` called between population and
    /// assembly; it may append arrays of its own to the slot table
    pub fn run_with<R, F>(
        description: &dyn HardwareDescription,
        repository: &mut R,
        handlers: &[&dyn KindHandler<S>],
        finish: F,
    ) -> Result<Outcome, Error>
    where
        R: ObjectRepository + ?Sized,
        F: FnOnce(&Graph<S>, &mut SlotTable, &mut R) -> Result<(), Error>,
    {
        let built = Self::build(description, repository, handlers).and_then(|(graph, mut table)| {
            finish(&graph, &mut table, repository)?;
            Ok(table)
        });

        match built {
            Ok(table) => Ok(Outcome::Assembled(table.assemble(repository)?)),
            Err(Error::Unsupported(reason)) => {
                log::warn!("table omitted: {reason}");
                Ok(Outcome::Omitted(reason))
            }
            Err(error) => Err(error),
        }
    }

    fn build<R: ObjectRepository + ?Sized>(
        description: &dyn HardwareDescription,
        repository: &mut R,
        handlers: &[&dyn KindHandler<S>],
    ) -> Result<(Self, SlotTable), Error> {
        Self::validate_order(handlers)?;

        let mut graph = Self::new();
        graph.ingest(description, handlers)?;
        graph.propagate(description, handlers)?;

        let mut table = graph.allocate(handlers, repository)?;
        graph.populate(description, handlers, &mut table, &mut IdentifierAllocator::default())?;

        Ok((graph, table))
    }
}

/// Each handler's kind once, in declaration order
fn declared_kinds<S>(handlers: &[&dyn KindHandler<S>]) -> Vec<ObjectKind> {
    let mut kinds: Vec<ObjectKind> = Vec::new();
    for handler in handlers {
        if !kinds.contains(&handler.kind()) {
            kinds.push(handler.kind());
        }
    }

    kinds
}

impl<S> Index<NodeId> for Graph<S> {
    type Output = DescriptorNode<S>;

    fn index(&self, id: NodeId) -> &Self::Output {
        &self.nodes[id.0]
    }
}

impl<S> IndexMut<NodeId> for Graph<S> {
    fn index_mut(&mut self, id: NodeId) -> &mut Self::Output {
        &mut self.nodes[id.0]
    }
}
