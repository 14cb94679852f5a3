// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Processor cache hierarchy.
//!
//! Every enabled CPU contributes a level 1 instruction and data cache, every
//! `cache` node one unified cache. CPU locations flow up the
//! `next-level-cache` links, then the caches are grouped by the socket,
//! cluster or core position they ended up at into [`ProcessorCacheList`]
//! records.

mod handlers;
mod propagate;
mod topology;

pub use handlers::{read_cache_data, CacheData, CacheNodeHandler, CacheScratch, CacheType, CpuCacheHandler};
pub use topology::{AffinityTopology, Geometry, Location, Place, PlatformTopology};

use alloc::{collections::BTreeMap, vec::Vec};

use crate::{
    description::HardwareDescription,
    graph::{Graph, KindHandler, Outcome, OutputArray, SlotTable},
    records::{AuxSlice, ObjectKind, ObjectReference, ProcessorCacheList},
    repository::ObjectRepository,
    token::Token,
    Error, Record,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Line size assumed when a cache gives neither a block nor a line size
    pub default_block_size: u32,
    /// Largest cache id a level 3 cache may have
    pub max_l3_id: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { default_block_size: 64, max_l3_id: 0xff }
    }
}

/// The caches found at one position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyEntry {
    pub location: Location,
    /// Token of the [`ProcessorCacheList`] record
    pub list: Token,
    pub caches: Vec<Token>,
}

/// Positions that ended up with at least one cache, coarsest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheHierarchy {
    entries: Vec<HierarchyEntry>,
}

impl CacheHierarchy {
    pub fn entries(&self) -> &[HierarchyEntry] {
        &self.entries
    }

    pub fn at(&self, location: Location) -> Option<&HierarchyEntry> {
        self.entries.iter().find(|entry| entry.location == location)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Socket, cluster and core positions; anything else is not a place a cache
/// list can describe
fn is_position(location: &Location) -> bool {
    matches!(
        (location.socket, location.cluster, location.core),
        (Place::Index(_), Place::Shared, Place::Shared)
            | (Place::Index(_), Place::Index(_), Place::Shared)
            | (Place::Index(_), Place::Index(_), Place::Index(_))
    )
}

fn roll_up<R: ObjectRepository + ?Sized>(
    graph: &Graph<CacheScratch>,
    geometry: Geometry,
    table: &mut SlotTable,
    repository: &mut R,
) -> Result<CacheHierarchy, Error> {
    let mut positions: BTreeMap<Location, Vec<Token>> = BTreeMap::new();
    for id in graph.nodes_of(ObjectKind::CacheInfo) {
        let node = &graph[id];
        let location = node.scratch.location;

        if is_position(&location) && geometry.contains(&location) {
            positions.entry(location).or_default().push(node.token());
        } else {
            log::debug!("cache descriptor #{} at {location:?} is in no cache list", id.index());
        }
    }

    if positions.is_empty() {
        return Ok(CacheHierarchy::default());
    }

    let tokens = repository.allocate_tokens(positions.len())?;
    if tokens.len() != positions.len() || tokens.iter().any(|token| token.is_null()) {
        return Err(Error::Repository {
            kind: ObjectKind::ProcessorCacheList,
            reason: "token batch is short or contains the null token",
        });
    }

    let mut references: Vec<Record> = Vec::new();
    let mut lists: Vec<Record> = Vec::new();
    let mut hierarchy = CacheHierarchy::default();

    for ((location, caches), &list) in positions.into_iter().zip(&tokens) {
        let start = u32::try_from(references.len()).map_err(|_| Error::ResourceExhausted { what: "cache references" })?;
        let count = caches.len() as u32;

        references.extend(caches.iter().map(|&reference| Record::from(ObjectReference { reference })));
        lists.push(ProcessorCacheList { token: list, location, caches: AuxSlice { start, count } }.into());

        log::debug!("{count} cache(s) at {location:?}");
        hierarchy.entries.push(HierarchyEntry { location, list, caches });
    }

    table.push(OutputArray { kind: ObjectKind::ObjectReference, records: references, tokens: None })?;
    table.push(OutputArray { kind: ObjectKind::ProcessorCacheList, records: lists, tokens: Some(tokens) })?;

    Ok(hierarchy)
}

/// Builds the cache records of `description` and hands them to `repository`
///
/// Positions come from `topology`; CPUs it does not report as enabled
/// contribute no caches.
pub fn build<R: ObjectRepository + ?Sized>(
    description: &dyn HardwareDescription,
    topology: &dyn PlatformTopology,
    repository: &mut R,
    config: CacheConfig,
) -> Result<(Outcome, CacheHierarchy), Error> {
    let caches = CacheNodeHandler::new(config);
    let cpus = CpuCacheHandler::new(topology, config);
    let handlers: [&dyn KindHandler<CacheScratch>; 2] = [&caches, &cpus];

    let mut hierarchy = CacheHierarchy::default();
    let outcome = Graph::run_with(description, repository, &handlers, |graph, table, repository| {
        hierarchy = roll_up(graph, topology.geometry(), table, repository)?;
        Ok(())
    })?;

    if let Outcome::Omitted(_) = outcome {
        hierarchy = CacheHierarchy::default();
    }

    Ok((outcome, hierarchy))
}
