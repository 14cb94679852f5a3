// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::vec::Vec;

use super::handlers::IortScratch;
use crate::{
    description::{Handle, HardwareDescription, PropertyError},
    graph::{Graph, NodeId, PopulateContext},
    node::NodeOffset,
    records::{IdMapping, IdMappingFlags},
    Error,
};

const DMA_RANGES_LEN: usize = 7 * 4;

/// One `msi-map` or `iommu-map` entry: `<input-base target output-base length>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub input_base: u32,
    pub target: Handle,
    pub output_base: u32,
    pub length: u32,
}

impl IdRange {
    pub fn from_cells(cells: &[u32]) -> Option<Self> {
        match *cells {
            [input_base, target, output_base, length] => {
                Some(IdRange { input_base, target: Handle::new(target), output_base, length })
            }
            _ => None,
        }
    }

    /// `num_ids` is one less than the number of IDs in the range
    pub fn num_ids(&self) -> u32 {
        self.length.saturating_sub(1)
    }
}

/// How a device reaches its SMMU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    /// `iommus = <smmu stream-id>`
    Iommus { target: Handle, stream_id: u32 },
    /// `iommu-map = <rid-base smmu stream-base length>`
    IommuMap(IdRange),
}

impl Upstream {
    pub fn target(&self) -> Handle {
        match self {
            Upstream::Iommus { target, .. } => *target,
            Upstream::IommuMap(range) => range.target,
        }
    }
}

/// Reads an optional `count`-cell property; a property of any other size is
/// treated as absent
pub(crate) fn optional_cells(
    description: &dyn HardwareDescription,
    node: NodeOffset,
    name: &'static str,
    count: usize,
) -> Option<Vec<u32>> {
    match description.property_cells_exact(node, name, count) {
        Ok(cells) => Some(cells),
        Err(PropertyError::Malformed) => {
            log::debug!("{}: ignoring `{name}`, expected {count} cells", description.path(node));
            None
        }
        Err(PropertyError::NotFound) => None,
    }
}

/// Address width of the single inbound DMA window in `dma-ranges`, or
/// `default` when there is no such window
pub fn dma_address_bits(description: &dyn HardwareDescription, node: NodeOffset, default: u8) -> Result<u8, Error> {
    let ranges = match description.property(node, "dma-ranges") {
        Ok(ranges) if ranges.len() == DMA_RANGES_LEN => ranges,
        _ => return Ok(default),
    };

    let read = |at: usize| ranges.get(at..at + 8).and_then(|b| b.try_into().ok()).map(u64::from_be_bytes);
    let (Some(start), Some(size)) = (read(12), read(20)) else {
        return Err(PropertyError::Malformed.at(node, "dma-ranges"));
    };

    let end = start.checked_add(size).ok_or(PropertyError::Malformed.at(node, "dma-ranges"))?;
    Ok(match end {
        0 => 0,
        end => (u64::BITS - (end - 1).leading_zeros()) as u8,
    })
}

/// The SMMU a device's `iommus` or `iommu-map` resolves to
pub(crate) fn upstream_smmu(graph: &Graph<IortScratch>, id: NodeId) -> Option<NodeId> {
    graph[id].scratch.upstream.and_then(|upstream| graph.find(upstream.target(), 1))
}

/// Descriptors whose `msi-map` becomes an ID mapping of `smmu`: the SMMU
/// itself and every device behind it, in ingestion order
pub(crate) fn msi_sources(graph: &Graph<IortScratch>, smmu: NodeId) -> Vec<NodeId> {
    graph
        .ids()
        .filter(|&id| graph[id].scratch.msi_map.is_some())
        .filter(|&id| id == smmu || upstream_smmu(graph, id) == Some(smmu))
        .collect()
}

/// ID mappings of an SMMU and the position of its own entry, if it has one
///
/// With `single_own` the SMMU's own entry is flagged as a single mapping.
pub(crate) fn smmu_mappings(
    cx: &PopulateContext<'_, IortScratch>,
    smmu: NodeId,
    single_own: bool,
) -> (Vec<IdMapping>, Option<u32>) {
    let mut own = None;
    let mut mappings = Vec::new();

    for source in msi_sources(cx.graph, smmu) {
        let Some(msi) = cx.node(source).scratch.msi_map else {
            continue;
        };

        let mut mapping = IdMapping {
            input_base: msi.input_base,
            num_ids: msi.num_ids(),
            output_base: msi.output_base,
            output_reference: cx.reference(source, msi.target, 1),
            flags: IdMappingFlags::empty(),
        };

        if source == smmu {
            own = Some(mappings.len() as u32);
            if single_own {
                mapping.flags = IdMappingFlags::SINGLE;
            }
        }

        mappings.push(mapping);
    }

    (mappings, own)
}

/// How a root complex or named component maps its IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EndpointPolicy {
    /// Wired to two SMMU instances sharing one handle
    pub dual: bool,
    /// `iommu-map-mask = <0>`: every requester maps to one ID
    pub single_id: bool,
    /// Root complexes shift the second range by one in single-ID mode;
    /// named components use plain ranges
    pub root_complex: bool,
}

/// ID mappings of a root complex or named component
///
/// `iommus` maps ID 0 (and 1 for the second SMMU instance) to the stream ID;
/// otherwise the `iommu-map` or, failing that, the `msi-map` range is used.
pub(crate) fn endpoint_mappings(
    cx: &PopulateContext<'_, IortScratch>,
    id: NodeId,
    policy: EndpointPolicy,
) -> Vec<IdMapping> {
    let scratch = &cx.node(id).scratch;
    let instances: &[u32] = match policy.dual {
        true => &[1, 2],
        false => &[1],
    };

    if let Some(Upstream::Iommus { target, stream_id }) = scratch.upstream {
        return instances
            .iter()
            .map(|&instance| IdMapping {
                input_base: instance - 1,
                num_ids: 0,
                output_base: stream_id,
                output_reference: cx.reference(id, target, instance),
                flags: IdMappingFlags::SINGLE,
            })
            .collect();
    }

    let range = match scratch.upstream {
        Some(Upstream::IommuMap(range)) => range,
        _ => match scratch.msi_map {
            Some(range) => range,
            None => return Vec::new(),
        },
    };

    let single = policy.root_complex && policy.single_id;
    instances
        .iter()
        .map(|&instance| IdMapping {
            input_base: match single {
                true => range.input_base.wrapping_add(instance - 1),
                false => range.input_base,
            },
            num_ids: match single {
                true => 0,
                false => range.num_ids(),
            },
            output_base: range.output_base,
            output_reference: cx.reference(id, range.target, instance),
            flags: match single {
                true => IdMappingFlags::SINGLE,
                false => IdMappingFlags::empty(),
            },
        })
        .collect()
}
