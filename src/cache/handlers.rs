// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::{vec, vec::Vec};

use super::{
    propagate::propagate_locations,
    topology::{Location, PlatformTopology},
    CacheConfig,
};
use crate::{
    description::{Handle, HardwareDescription, PropertyError},
    graph::{Graph, Ingested, KindHandler, NodeId, PopulateContext},
    node::NodeOffset,
    records::{CacheAttributes, CacheInfo, ObjectKind},
    token::Token,
    Error,
};

const CACHE_COMPATIBLES: &[&str] = &["cache", "l2-cache", "l3-cache"];

/// Cache type, numbered the way it is packed into a cache id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheType {
    Unified = 0,
    Instruction = 1,
    Data = 2,
}

struct CacheProperties {
    size: &'static str,
    sets: &'static str,
    block_size: &'static str,
    line_size: &'static str,
}

impl CacheType {
    fn properties(self) -> CacheProperties {
        match self {
            CacheType::Unified => CacheProperties {
                size: "cache-size",
                sets: "cache-sets",
                block_size: "cache-block-size",
                line_size: "cache-line-size",
            },
            CacheType::Instruction => CacheProperties {
                size: "i-cache-size",
                sets: "i-cache-sets",
                block_size: "i-cache-block-size",
                line_size: "i-cache-line-size",
            },
            CacheType::Data => CacheProperties {
                size: "d-cache-size",
                sets: "d-cache-sets",
                block_size: "d-cache-block-size",
                line_size: "d-cache-line-size",
            },
        }
    }

    /// Attribute bits; every cache is write-back
    pub fn attributes(self) -> CacheAttributes {
        match self {
            CacheType::Instruction => CacheAttributes::INSTRUCTION,
            CacheType::Data => CacheAttributes::ALLOCATE_READ_WRITE,
            CacheType::Unified => CacheAttributes::ALLOCATE_READ_WRITE | CacheAttributes::UNIFIED,
        }
    }
}

/// Geometry of one cache as read from the devicetree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheData {
    pub cache_type: CacheType,
    pub level: u32,
    pub size: u32,
    pub sets: u32,
    pub line_size: u32,
    pub next_level: Handle,
}

impl CacheData {
    pub fn associativity(&self) -> u32 {
        let way_size = u64::from(self.line_size) * u64::from(self.sets);
        (u64::from(self.size) / way_size.max(1)) as u32
    }

    /// Packed cache id: level, type, core, cluster, then socket + 1
    pub fn cache_id(&self, location: Location, config: &CacheConfig) -> Result<u32, Error> {
        let core = location.core.index().unwrap_or(0);
        let cluster = location.cluster.index().unwrap_or(0);
        let socket = location.socket.index().unwrap_or(0).saturating_add(1);

        if core >= 0x100 || cluster >= 0x100 || socket >= 0x10 {
            return Err(Error::Unsupported("cache position does not fit in a cache id"));
        }

        let id = ((3 - self.level) << 24) | ((self.cache_type as u32) << 20) | (core << 12) | (cluster << 4) | socket;
        if self.level == 3 && id > config.max_l3_id {
            log::warn!("L3 cache id {id:#x} is above the platform limit {:#x}", config.max_l3_id);
            return Err(Error::Unsupported("L3 cache id above the platform limit"));
        }

        Ok(id)
    }
}

/// Per-descriptor state of the cache instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheScratch {
    pub data: CacheData,
    /// Set at ingestion for CPU caches, by propagation for everything else
    pub location: Location,
}

impl CacheScratch {
    /// CPU caches start the `next_level` chains
    pub fn is_leaf(&self) -> bool {
        self.data.cache_type != CacheType::Unified
    }
}

fn optional_u32(
    description: &dyn HardwareDescription,
    node: NodeOffset,
    name: &'static str,
    default: u32,
) -> Result<u32, Error> {
    match description.property_u32(node, name) {
        Ok(value) => Ok(value),
        Err(PropertyError::NotFound) => Ok(default),
        Err(error) => Err(error.at(node, name)),
    }
}

fn cache_level(description: &dyn HardwareDescription, node: NodeOffset) -> Result<u32, Error> {
    let level = match description.property_u32(node, "cache-level") {
        Ok(level) => level,
        Err(PropertyError::Malformed) => return Err(PropertyError::Malformed.at(node, "cache-level")),
        Err(PropertyError::NotFound) => {
            let path = description.path(node);

            if description.property_str(node, "device_type") == Ok("cpu") {
                1
            } else if description.is_compatible(node, &["l2-cache"]) || path.contains("l2c") {
                2
            } else if description.is_compatible(node, &["l3-cache"]) || path.contains("l3c") {
                3
            } else {
                return Err(PropertyError::Malformed.at(node, "cache-level"));
            }
        }
    };

    match (1..=3).contains(&level) {
        true => Ok(level),
        false => Err(PropertyError::Malformed.at(node, "cache-level")),
    }
}

/// Reads the `cache_type` cache described by `node`
///
/// A unified cache has no separate instruction or data cache, so asking for
/// one reports it as not found.
pub fn read_cache_data(
    description: &dyn HardwareDescription,
    node: NodeOffset,
    cache_type: CacheType,
    config: &CacheConfig,
) -> Result<CacheData, Error> {
    let names = cache_type.properties();
    let unified = description.has_property(node, "cache-unified");

    match (unified, cache_type) {
        (true, CacheType::Instruction | CacheType::Data) => {
            return Err(PropertyError::NotFound.at(node, names.size));
        }
        (false, CacheType::Unified) => {
            log::warn!("{} has no `cache-unified`, reading it as unified anyway", description.path(node));
        }
        _ => {}
    }

    let level = cache_level(description, node)?;
    let size = description.property_u32(node, names.size).map_err(|e| e.at(node, names.size))?;
    let sets = description.property_u32(node, names.sets).map_err(|e| e.at(node, names.sets))?;
    let block_size = optional_u32(description, node, names.block_size, config.default_block_size)?;
    let line_size = optional_u32(description, node, names.line_size, block_size)?;

    if sets == 0 {
        return Err(PropertyError::Malformed.at(node, names.sets));
    } else if line_size == 0 || line_size > u32::from(u16::MAX) {
        return Err(PropertyError::Malformed.at(node, names.line_size));
    }

    let next_level = ["next-level-cache", "l2-cache"]
        .into_iter()
        .find_map(|name| description.property_u32(node, name).ok())
        .map_or(Handle::INVALID, Handle::new);

    Ok(CacheData { cache_type, level, size, sets, line_size, next_level })
}

fn populate_cache(cx: &mut PopulateContext<'_, CacheScratch>, id: NodeId, config: &CacheConfig) -> Result<(), Error> {
    if cx.is_populated(id) {
        return Ok(());
    }

    let CacheScratch { data, location } = cx.node(id).scratch;
    let next_level = match data.next_level.is_valid() {
        true => cx.reference(id, data.next_level, 1),
        false => Token::NULL,
    };

    let record = CacheInfo {
        token: Token::NULL,
        next_level,
        size: data.size,
        sets: data.sets,
        associativity: data.associativity(),
        attributes: data.cache_type.attributes(),
        line_size: data.line_size as u16,
        cache_id: data.cache_id(location, config)?,
    };

    cx.store(id, record)
}

/// Stand-alone cache nodes, read as unified caches
#[derive(Debug, Clone, Copy)]
pub struct CacheNodeHandler {
    config: CacheConfig,
}

impl CacheNodeHandler {
    pub fn new(config: CacheConfig) -> Self {
        Self { config }
    }
}

impl KindHandler<CacheScratch> for CacheNodeHandler {
    fn kind(&self) -> ObjectKind {
        ObjectKind::CacheInfo
    }

    fn matches(&self, description: &dyn HardwareDescription, node: NodeOffset) -> bool {
        description.is_compatible(node, CACHE_COMPATIBLES)
    }

    fn ingest(
        &self,
        description: &dyn HardwareDescription,
        _: &Graph<CacheScratch>,
        node: NodeOffset,
    ) -> Result<Vec<Ingested<CacheScratch>>, Error> {
        let data = read_cache_data(description, node, CacheType::Unified, &self.config)?;
        let scratch = CacheScratch { data, location: Location::UNSET };

        Ok(vec![Ingested::new(description.handle(node), scratch)])
    }

    fn populate(&self, cx: &mut PopulateContext<'_, CacheScratch>, node: NodeId) -> Result<(), Error> {
        populate_cache(cx, node, &self.config)
    }
}

/// The level 1 instruction and data caches described on enabled CPU nodes
pub struct CpuCacheHandler<'t> {
    topology: &'t dyn PlatformTopology,
    config: CacheConfig,
}

impl<'t> CpuCacheHandler<'t> {
    pub fn new(topology: &'t dyn PlatformTopology, config: CacheConfig) -> Self {
        Self { topology, config }
    }
}

impl KindHandler<CacheScratch> for CpuCacheHandler<'_> {
    fn kind(&self) -> ObjectKind {
        ObjectKind::CacheInfo
    }

    fn matches(&self, description: &dyn HardwareDescription, node: NodeOffset) -> bool {
        description.property_str(node, "device_type") == Ok("cpu")
    }

    fn ingest(
        &self,
        description: &dyn HardwareDescription,
        _: &Graph<CacheScratch>,
        node: NodeOffset,
    ) -> Result<Vec<Ingested<CacheScratch>>, Error> {
        let registers = description.registers(node).map_err(|e| e.at(node, "reg").into_identity())?;
        let mpidr = registers.first().map(|r| r.base).ok_or(Error::MissingIdentity { node, property: "reg" })?;

        let Some(location) = self.topology.locate(mpidr) else {
            log::debug!("{}: core {mpidr:#x} is not enabled", description.path(node));
            return Ok(Vec::new());
        };

        let handle = description.handle(node);
        let mut ingested = Vec::new();
        let mut first_error = None;

        for cache_type in [CacheType::Instruction, CacheType::Data] {
            match read_cache_data(description, node, cache_type, &self.config) {
                Ok(data) => ingested.push(Ingested::new(handle, CacheScratch { data, location })),
                Err(error) if error.is_node_local() => {
                    log::debug!("{}: no {cache_type:?} cache: {error}", description.path(node));
                    first_error.get_or_insert(error);
                }
                Err(error) => return Err(error),
            }
        }

        match (ingested.is_empty(), first_error) {
            (true, Some(error)) => Err(error),
            _ => Ok(ingested),
        }
    }

    fn propagate(&self, _: &dyn HardwareDescription, graph: &mut Graph<CacheScratch>) -> Result<(), Error> {
        propagate_locations(graph)
    }

    fn populate(&self, cx: &mut PopulateContext<'_, CacheScratch>, node: NodeId) -> Result<(), Error> {
        populate_cache(cx, node, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(cache_type: CacheType, level: u32) -> CacheData {
        CacheData { cache_type, level, size: 0x10000, sets: 256, line_size: 64, next_level: Handle::INVALID }
    }

    #[test]
    fn cache_ids_pack_level_type_and_position() {
        let config = CacheConfig::default();
        let location = Location::core(0, 1, 2);

        assert_eq!(data(CacheType::Instruction, 1).cache_id(location, &config), Ok(0x0210_2011));
        assert_eq!(data(CacheType::Data, 1).cache_id(location, &config), Ok(0x0220_2011));
        assert_eq!(data(CacheType::Unified, 3).cache_id(location.socket_level(), &config), Ok(0x1));
        assert_eq!(data(CacheType::Unified, 3).cache_id(Location::core(1, 0, 0).socket_level(), &config), Ok(0x2));
    }

    #[test]
    fn cache_ids_out_of_range_are_unsupported() {
        let config = CacheConfig { max_l3_id: 0x1, ..CacheConfig::default() };
        let l3 = data(CacheType::Unified, 3);

        assert!(l3.cache_id(Location::core(1, 0, 0).socket_level(), &config).is_err());
        assert!(data(CacheType::Data, 1).cache_id(Location::core(0, 0, 256), &config).is_err());
        assert!(data(CacheType::Data, 1).cache_id(Location::core(15, 0, 0), &config).is_err());
    }

    #[test]
    fn associativity_from_geometry() {
        assert_eq!(data(CacheType::Data, 1).associativity(), 4);
        let huge = CacheData { size: u32::MAX, sets: u32::MAX, line_size: u32::MAX, ..data(CacheType::Data, 1) };
        assert_eq!(huge.associativity(), 0);
    }

    #[test]
    fn attributes_by_type() {
        assert_eq!(CacheType::Instruction.attributes().bits(), 0x4);
        assert_eq!(CacheType::Data.attributes().bits(), 0x2);
        assert_eq!(CacheType::Unified.attributes().bits(), 0xa);
    }
}
