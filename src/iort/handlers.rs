// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::{string::String, vec, vec::Vec};

use super::{
    mapping::{
        dma_address_bits, endpoint_mappings, msi_sources, optional_cells, smmu_mappings, EndpointPolicy, IdRange,
        Upstream,
    },
    KindEntry,
};
use crate::{
    description::{Handle, HardwareDescription, Interrupt, PropertyError, Register},
    graph::{Graph, Ingested, KindHandler, NodeId, PopulateContext},
    node::NodeOffset,
    records::{
        IdMapping, IdMappingFlags, ItsGroup, ItsIdentifier, MemoryAccessFlags, NamedComponent, ObjectKind, Pmcg,
        RootComplex, SmmuInterrupt, SmmuV1V2, SmmuV1V2Flags, SmmuV3, SmmuV3Flags, ATS_SUPPORTED, COHERENT_ACCESS,
        SMMU_V1V2_MODEL_MMU500, SMMU_V3_MODEL_GENERIC,
    },
    token::Token,
    Error,
};

const PMU_COMPATIBLES: &[&str] = &["arm,cortex-a78-pmu", "arm,armv8-pmuv3"];
const MAX_GLOBAL_INTERRUPTS: u32 = 2;
const MAX_SMMU_V3_INTERRUPTS: usize = 4;

const SMMU_CONTEXT_INTERRUPTS: usize = 0;
const SMMU_PMU_INTERRUPTS: usize = 1;
const SMMU_V1V2_ID_MAPPINGS: usize = 2;
const ID_MAPPINGS: usize = 0;

/// SMMUv1/v2 interrupt wiring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmmuV1V2Interrupts {
    pub global: Option<Interrupt>,
    pub global_config: Option<Interrupt>,
    pub context: Vec<Interrupt>,
    pub pmu: Vec<Interrupt>,
}

/// SMMUv3 wired interrupts, zero when not wired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmmuV3Interrupts {
    pub event: u32,
    pub pri: u32,
    pub gerr: u32,
    pub sync: u32,
}

impl SmmuV3Interrupts {
    pub fn all_wired(&self) -> bool {
        self.event != 0 && self.pri != 0 && self.gerr != 0 && self.sync != 0
    }
}

/// Memory access properties shared by root complexes and named components
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub coherent: bool,
    pub canwbs: bool,
    pub dacs: bool,
    pub ats: bool,
    pub segment: u32,
    pub address_bits: u8,
    pub single_id: bool,
}

impl Endpoint {
    fn read(description: &dyn HardwareDescription, node: NodeOffset, default_address_bits: u8) -> Result<Self, Error> {
        Ok(Endpoint {
            coherent: description.has_property(node, "dma-coherent"),
            canwbs: description.has_property(node, "nvidia,canwbs-supported"),
            dacs: description.has_property(node, "nvidia,dacs-supported"),
            ats: description.has_property(node, "ats-supported"),
            segment: description.property_u32(node, "linux,pci-domain").unwrap_or(0),
            address_bits: dma_address_bits(description, node, default_address_bits)?,
            single_id: description.property_u32(node, "iommu-map-mask") == Ok(0),
        })
    }

    fn cache_coherent(&self) -> u32 {
        match self.coherent {
            true => COHERENT_ACCESS,
            false => 0,
        }
    }
}

/// What a component needs beyond its register and ID ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Detail {
    #[default]
    None,
    SmmuV1V2(SmmuV1V2Interrupts),
    SmmuV3 { interrupts: SmmuV3Interrupts, coherent: bool, proximity_domain: u32 },
    Endpoint(Endpoint),
    Pmcg { page1: u64, overflow: Option<u32>, msi_parent: Option<(Handle, u32)>, devices: Handle },
}

/// Per-descriptor state of the I/O topology instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IortScratch {
    /// The register range this descriptor stands for
    pub register: Register,
    /// `msi-map`, kept only when its interrupt translation service exists
    pub msi_map: Option<IdRange>,
    pub upstream: Option<Upstream>,
    pub detail: Detail,
}

/// `reg` identifies a component, so a node without one stops the build
fn registers(description: &dyn HardwareDescription, node: NodeOffset) -> Result<Vec<Register>, Error> {
    match description.registers(node) {
        Ok(registers) if !registers.is_empty() => Ok(registers),
        Ok(_) => Err(PropertyError::Malformed.at(node, "reg").into_identity()),
        Err(error) => Err(error.at(node, "reg").into_identity()),
    }
}

fn first_register(description: &dyn HardwareDescription, node: NodeOffset) -> Result<Register, Error> {
    registers(description, node).map(|registers| registers[0])
}

/// `msi-map`, if it is well formed and its target was ingested
fn read_msi_map(
    description: &dyn HardwareDescription,
    graph: &Graph<IortScratch>,
    node: NodeOffset,
) -> Result<Option<IdRange>, Error> {
    if graph.nodes_of(ObjectKind::ItsGroup).next().is_none() {
        return Ok(None);
    }

    let range = optional_cells(description, node, "msi-map", 4).and_then(|cells| IdRange::from_cells(&cells));
    let Some(range) = range else {
        return Ok(None);
    };

    match graph.find(range.target, 1) {
        Some(_) => Ok(Some(range)),
        None => Err(PropertyError::NotFound.at(node, "msi-map")),
    }
}

/// `iommus`, else `iommu-map`; a device with neither must at least have an
/// `msi-map`
fn read_upstream(
    description: &dyn HardwareDescription,
    graph: &Graph<IortScratch>,
    node: NodeOffset,
    msi_map: Option<IdRange>,
) -> Result<Option<Upstream>, Error> {
    let iommu_map = || optional_cells(description, node, "iommu-map", 4).and_then(|c| IdRange::from_cells(&c));

    let (upstream, property) = if let Some(cells) = optional_cells(description, node, "iommus", 2) {
        (Upstream::Iommus { target: Handle::new(cells[0]), stream_id: cells[1] }, "iommus")
    } else if let Some(range) = iommu_map() {
        (Upstream::IommuMap(range), "iommu-map")
    } else if msi_map.is_some() {
        return Ok(None);
    } else {
        return Err(PropertyError::NotFound.at(node, "iommu-map"));
    };

    match graph.find(upstream.target(), 1) {
        Some(_) => Ok(Some(upstream)),
        None => Err(PropertyError::NotFound.at(node, property)),
    }
}

pub struct ItsGroupHandler {
    entry: KindEntry,
}

impl ItsGroupHandler {
    pub fn new(entry: KindEntry) -> Self {
        Self { entry }
    }
}

impl KindHandler<IortScratch> for ItsGroupHandler {
    fn kind(&self) -> ObjectKind {
        ObjectKind::ItsGroup
    }

    fn alias(&self) -> Option<&str> {
        self.entry.alias
    }

    fn matches(&self, description: &dyn HardwareDescription, node: NodeOffset) -> bool {
        description.is_compatible(node, &[self.entry.compatible])
    }

    fn ingest(
        &self,
        description: &dyn HardwareDescription,
        _: &Graph<IortScratch>,
        node: NodeOffset,
    ) -> Result<Vec<Ingested<IortScratch>>, Error> {
        let register = first_register(description, node)?;
        let scratch = IortScratch { register, ..IortScratch::default() };

        Ok(vec![Ingested::new(description.handle(node), scratch).with_aux(ObjectKind::ItsIdentifier, 1)])
    }

    fn populate(&self, cx: &mut PopulateContext<'_, IortScratch>, id: NodeId) -> Result<(), Error> {
        if cx.is_populated(id) {
            return Ok(());
        }

        let its_id = cx.node(id).slot().ok_or(Error::ResourceExhausted { what: "output slots" })? as u32;
        let its_ids = cx.write_aux(id, 0, vec![ItsIdentifier { its_id }])?;
        let identifier = cx.next_identifier()?;

        cx.store(id, ItsGroup { token: Token::NULL, its_ids, identifier })
    }
}

pub struct SmmuV1V2Handler {
    entry: KindEntry,
}

impl SmmuV1V2Handler {
    pub fn new(entry: KindEntry) -> Self {
        Self { entry }
    }
}

/// Interrupts of the first enabled PMU, preferring the more specific
/// compatible
fn pmu_interrupts(description: &dyn HardwareDescription) -> Result<Vec<Interrupt>, Error> {
    for &compatible in PMU_COMPATIBLES {
        let enabled_pmu =
            |node: NodeOffset| description.is_compatible(node, &[compatible]) && description.is_enabled(node);
        let found = description.next_matching(None, &enabled_pmu);

        if let Some(pmu) = found {
            return description.interrupts(pmu).map_err(|e| e.at(pmu, "interrupts"));
        }
    }

    log::warn!("no enabled PMU node, SMMU PMU interrupts left empty");
    Ok(Vec::new())
}

fn smmu_interrupt(interrupt: Option<&Interrupt>) -> SmmuInterrupt {
    interrupt.map_or(SmmuInterrupt::default(), |irq| SmmuInterrupt { interrupt: irq.id, flags: irq.trigger.flags() })
}

impl KindHandler<IortScratch> for SmmuV1V2Handler {
    fn kind(&self) -> ObjectKind {
        ObjectKind::SmmuV1V2
    }

    fn depends_on(&self) -> &[ObjectKind] {
        &[ObjectKind::ItsGroup]
    }

    fn alias(&self) -> Option<&str> {
        self.entry.alias
    }

    fn matches(&self, description: &dyn HardwareDescription, node: NodeOffset) -> bool {
        description.is_compatible(node, &[self.entry.compatible])
    }

    fn ingest(
        &self,
        description: &dyn HardwareDescription,
        graph: &Graph<IortScratch>,
        node: NodeOffset,
    ) -> Result<Vec<Ingested<IortScratch>>, Error> {
        let registers = registers(description, node)?;
        let msi_map = read_msi_map(description, graph, node)?;

        let global =
            description.property_u32(node, "#global-interrupts").map_err(|e| e.at(node, "#global-interrupts"))?;
        if global > MAX_GLOBAL_INTERRUPTS {
            log::error!("{}: {global} global interrupts", description.path(node));
            return Err(Error::Unsupported("SMMU with more than two global interrupts"));
        }

        let mut wired = description.interrupts(node).map_err(|e| e.at(node, "interrupts"))?;
        if wired.len() < global as usize {
            return Err(PropertyError::Malformed.at(node, "interrupts"));
        }

        let context = wired.split_off(global as usize);
        let interrupts = SmmuV1V2Interrupts {
            global: wired.first().copied(),
            global_config: wired.get(1).copied(),
            context,
            pmu: pmu_interrupts(description)?,
        };

        let handle = description.handle(node);
        let dual = registers.len() > 1;

        Ok(registers
            .iter()
            .take(match dual {
                true => 2,
                false => 1,
            })
            .map(|&register| {
                let scratch = IortScratch {
                    register,
                    msi_map,
                    upstream: None,
                    detail: Detail::SmmuV1V2(interrupts.clone()),
                };

                Ingested::new(handle, scratch)
                    .with_aux(ObjectKind::SmmuInterrupt, interrupts.context.len() as u32)
                    .with_aux(ObjectKind::SmmuInterrupt, interrupts.pmu.len() as u32)
                    .with_aux(ObjectKind::IdMapping, 0)
            })
            .collect())
    }

    fn propagate(&self, _: &dyn HardwareDescription, graph: &mut Graph<IortScratch>) -> Result<(), Error> {
        count_smmu_mappings(graph, ObjectKind::SmmuV1V2, SMMU_V1V2_ID_MAPPINGS)
    }

    fn populate(&self, cx: &mut PopulateContext<'_, IortScratch>, id: NodeId) -> Result<(), Error> {
        if cx.is_populated(id) {
            return Ok(());
        }

        let scratch = &cx.node(id).scratch;
        let Detail::SmmuV1V2(interrupts) = &scratch.detail else {
            return Err(Error::Internal("SMMUv1/v2 descriptor without interrupt wiring"));
        };

        let to_entries = |list: &[Interrupt]| list.iter().map(|irq| smmu_interrupt(Some(irq))).collect::<Vec<_>>();
        let context_interrupts = cx.write_aux(id, SMMU_CONTEXT_INTERRUPTS, to_entries(&interrupts.context))?;
        let pmu_interrupts = cx.write_aux(id, SMMU_PMU_INTERRUPTS, to_entries(&interrupts.pmu))?;

        let (mappings, _) = smmu_mappings(cx, id, false);
        let id_mappings = cx.write_aux(id, SMMU_V1V2_ID_MAPPINGS, mappings)?;

        let record = SmmuV1V2 {
            token: Token::NULL,
            base_address: scratch.register.base,
            span: scratch.register.size,
            model: SMMU_V1V2_MODEL_MMU500,
            flags: SmmuV1V2Flags::COHERENT_WALK,
            global_interrupt: smmu_interrupt(interrupts.global.as_ref()),
            global_config_interrupt: smmu_interrupt(interrupts.global_config.as_ref()),
            context_interrupts,
            pmu_interrupts,
            id_mappings,
            identifier: cx.next_identifier()?,
        };

        cx.store(id, record)
    }
}

/// Sizes the ID mapping reservation of every SMMU of `kind` now that all
/// devices behind it are known
fn count_smmu_mappings(graph: &mut Graph<IortScratch>, kind: ObjectKind, demand: usize) -> Result<(), Error> {
    let smmus: Vec<NodeId> = graph.nodes_of(kind).collect();

    for smmu in smmus {
        let count = u32::try_from(msi_sources(graph, smmu).len())
            .map_err(|_| Error::ResourceExhausted { what: "ID mappings" })?;
        log::debug!("{kind:?} #{} carries {count} ID mapping(s)", smmu.index());
        graph[smmu].set_demand(demand, count);
    }

    Ok(())
}

pub struct SmmuV3Handler {
    entry: KindEntry,
}

impl SmmuV3Handler {
    pub fn new(entry: KindEntry) -> Self {
        Self { entry }
    }
}

fn smmu_v3_interrupts(description: &dyn HardwareDescription, node: NodeOffset) -> Result<SmmuV3Interrupts, Error> {
    let wired = description.interrupts(node).map_err(|e| e.at(node, "interrupts"))?;
    let names = description.property_strings(node, "interrupt-names").map_err(|e| e.at(node, "interrupt-names"))?;

    if names.len() < wired.len() {
        return Err(PropertyError::NotFound.at(node, "interrupt-names"));
    }

    let mut interrupts = SmmuV3Interrupts::default();
    if names.first() == Some(&"combined") {
        let id = wired.first().map(|irq| irq.id).ok_or(PropertyError::Malformed.at(node, "interrupts"))?;
        return Ok(SmmuV3Interrupts { event: id, pri: id, gerr: id, sync: id });
    }

    if !(1..=MAX_SMMU_V3_INTERRUPTS).contains(&wired.len()) {
        return Err(PropertyError::Malformed.at(node, "interrupts"));
    }

    for (name, irq) in names.iter().zip(&wired) {
        let slot = match *name {
            "eventq" => &mut interrupts.event,
            "priq" => &mut interrupts.pri,
            "gerror" => &mut interrupts.gerr,
            "cmdq-sync" => &mut interrupts.sync,
            _ => return Err(PropertyError::Malformed.at(node, "interrupt-names")),
        };

        *slot = irq.id;
    }

    Ok(interrupts)
}

impl KindHandler<IortScratch> for SmmuV3Handler {
    fn kind(&self) -> ObjectKind {
        ObjectKind::SmmuV3
    }

    fn depends_on(&self) -> &[ObjectKind] {
        &[ObjectKind::ItsGroup]
    }

    fn alias(&self) -> Option<&str> {
        self.entry.alias
    }

    fn matches(&self, description: &dyn HardwareDescription, node: NodeOffset) -> bool {
        description.is_compatible(node, &[self.entry.compatible])
    }

    fn ingest(
        &self,
        description: &dyn HardwareDescription,
        graph: &Graph<IortScratch>,
        node: NodeOffset,
    ) -> Result<Vec<Ingested<IortScratch>>, Error> {
        let register = first_register(description, node)?;
        let scratch = IortScratch {
            register,
            msi_map: read_msi_map(description, graph, node)?,
            upstream: None,
            detail: Detail::SmmuV3 {
                interrupts: smmu_v3_interrupts(description, node)?,
                coherent: description.has_property(node, "dma-coherent"),
                proximity_domain: description.property_u32(node, "numa-node-id").unwrap_or(0),
            },
        };

        Ok(vec![Ingested::new(description.handle(node), scratch).with_aux(ObjectKind::IdMapping, 0)])
    }

    fn propagate(&self, _: &dyn HardwareDescription, graph: &mut Graph<IortScratch>) -> Result<(), Error> {
        count_smmu_mappings(graph, ObjectKind::SmmuV3, ID_MAPPINGS)
    }

    fn populate(&self, cx: &mut PopulateContext<'_, IortScratch>, id: NodeId) -> Result<(), Error> {
        if cx.is_populated(id) {
            return Ok(());
        }

        let scratch = &cx.node(id).scratch;
        let Detail::SmmuV3 { interrupts, coherent, proximity_domain } = scratch.detail else {
            return Err(Error::Internal("SMMUv3 descriptor without interrupt wiring"));
        };

        let (mappings, own) = smmu_mappings(cx, id, true);
        let device_id_mapping_index = match own {
            Some(index) => index,
            None if !interrupts.all_wired() && !mappings.is_empty() => mappings.len() as u32,
            None => 0,
        };
        let id_mappings = cx.write_aux(id, ID_MAPPINGS, mappings)?;

        let mut flags = SmmuV3Flags::PROXIMITY_DOMAIN;
        flags.set(SmmuV3Flags::COHAC_OVERRIDE, coherent);

        let record = SmmuV3 {
            token: Token::NULL,
            base_address: scratch.register.base,
            flags,
            vatos_address: 0,
            model: SMMU_V3_MODEL_GENERIC,
            event_interrupt: interrupts.event,
            pri_interrupt: interrupts.pri,
            gerr_interrupt: interrupts.gerr,
            sync_interrupt: interrupts.sync,
            proximity_domain,
            device_id_mapping_index,
            id_mappings,
            identifier: cx.next_identifier()?,
        };

        cx.store(id, record)
    }
}

/// Ingests a root complex or named component
fn ingest_endpoint(
    description: &dyn HardwareDescription,
    graph: &Graph<IortScratch>,
    node: NodeOffset,
    entry: &KindEntry,
    default_address_bits: u8,
) -> Result<Vec<Ingested<IortScratch>>, Error> {
    let register = first_register(description, node)?;
    let msi_map = read_msi_map(description, graph, node)?;
    let upstream = read_upstream(description, graph, node, msi_map)?;

    let scratch = IortScratch {
        register,
        msi_map,
        upstream,
        detail: Detail::Endpoint(Endpoint::read(description, node, default_address_bits)?),
    };

    let mappings = match entry.dual {
        true => 2,
        false => 1,
    };

    Ok(vec![Ingested::new(description.handle(node), scratch).with_aux(ObjectKind::IdMapping, mappings)])
}

fn endpoint(cx: &PopulateContext<'_, IortScratch>, id: NodeId) -> Result<Endpoint, Error> {
    match cx.node(id).scratch.detail {
        Detail::Endpoint(endpoint) => Ok(endpoint),
        _ => Err(Error::Internal("endpoint descriptor without memory access properties")),
    }
}

pub struct RootComplexHandler {
    entry: KindEntry,
    default_address_bits: u8,
}

impl RootComplexHandler {
    pub fn new(entry: KindEntry, default_address_bits: u8) -> Self {
        Self { entry, default_address_bits }
    }
}

impl KindHandler<IortScratch> for RootComplexHandler {
    fn kind(&self) -> ObjectKind {
        ObjectKind::RootComplex
    }

    fn depends_on(&self) -> &[ObjectKind] {
        &[ObjectKind::ItsGroup, ObjectKind::SmmuV1V2, ObjectKind::SmmuV3]
    }

    fn alias(&self) -> Option<&str> {
        self.entry.alias
    }

    fn matches(&self, description: &dyn HardwareDescription, node: NodeOffset) -> bool {
        description.is_compatible(node, &[self.entry.compatible])
    }

    fn ingest(
        &self,
        description: &dyn HardwareDescription,
        graph: &Graph<IortScratch>,
        node: NodeOffset,
    ) -> Result<Vec<Ingested<IortScratch>>, Error> {
        ingest_endpoint(description, graph, node, &self.entry, self.default_address_bits)
    }

    fn populate(&self, cx: &mut PopulateContext<'_, IortScratch>, id: NodeId) -> Result<(), Error> {
        if cx.is_populated(id) {
            return Ok(());
        }

        let endpoint = endpoint(cx, id)?;
        let policy = EndpointPolicy { dual: self.entry.dual, single_id: endpoint.single_id, root_complex: true };
        let id_mappings = cx.write_aux(id, ID_MAPPINGS, endpoint_mappings(cx, id, policy))?;

        let mut memory_access_flags = MemoryAccessFlags::empty();
        memory_access_flags.set(MemoryAccessFlags::CPM, endpoint.coherent);
        memory_access_flags.set(MemoryAccessFlags::CANWBS, endpoint.canwbs);
        memory_access_flags.set(MemoryAccessFlags::DACS, endpoint.dacs);

        let record = RootComplex {
            token: Token::NULL,
            cache_coherent: endpoint.cache_coherent(),
            allocation_hints: 0,
            memory_access_flags,
            ats_attribute: match endpoint.ats {
                true => ATS_SUPPORTED,
                false => 0,
            },
            pci_segment_number: endpoint.segment,
            memory_address_size: endpoint.address_bits,
            id_mappings,
            identifier: cx.next_identifier()?,
        };

        cx.store(id, record)
    }
}

pub struct NamedComponentHandler {
    entry: KindEntry,
    default_address_bits: u8,
}

impl NamedComponentHandler {
    pub fn new(entry: KindEntry, default_address_bits: u8) -> Self {
        Self { entry, default_address_bits }
    }
}

impl KindHandler<IortScratch> for NamedComponentHandler {
    fn kind(&self) -> ObjectKind {
        ObjectKind::NamedComponent
    }

    fn depends_on(&self) -> &[ObjectKind] {
        &[ObjectKind::ItsGroup, ObjectKind::SmmuV1V2, ObjectKind::SmmuV3]
    }

    fn alias(&self) -> Option<&str> {
        self.entry.alias
    }

    fn matches(&self, description: &dyn HardwareDescription, node: NodeOffset) -> bool {
        description.is_compatible(node, &[self.entry.compatible])
    }

    fn ingest(
        &self,
        description: &dyn HardwareDescription,
        graph: &Graph<IortScratch>,
        node: NodeOffset,
    ) -> Result<Vec<Ingested<IortScratch>>, Error> {
        ingest_endpoint(description, graph, node, &self.entry, self.default_address_bits)
    }

    fn populate(&self, cx: &mut PopulateContext<'_, IortScratch>, id: NodeId) -> Result<(), Error> {
        if cx.is_populated(id) {
            return Ok(());
        }

        let endpoint = endpoint(cx, id)?;
        let policy = EndpointPolicy { dual: self.entry.dual, single_id: endpoint.single_id, root_complex: false };
        let id_mappings = cx.write_aux(id, ID_MAPPINGS, endpoint_mappings(cx, id, policy))?;

        let mut memory_access_flags = MemoryAccessFlags::empty();
        memory_access_flags.set(MemoryAccessFlags::CPM, endpoint.coherent);
        memory_access_flags.set(MemoryAccessFlags::DACS, endpoint.dacs);

        let record = NamedComponent {
            token: Token::NULL,
            cache_coherent: endpoint.cache_coherent(),
            allocation_hints: 0,
            memory_access_flags,
            address_size_limit: endpoint.address_bits,
            object_name: String::from(self.entry.object_name.unwrap_or_default()),
            id_mappings,
            identifier: cx.next_identifier()?,
        };

        cx.store(id, record)
    }
}

pub struct PmcgHandler {
    entry: KindEntry,
}

impl PmcgHandler {
    pub fn new(entry: KindEntry) -> Self {
        Self { entry }
    }
}

impl KindHandler<IortScratch> for PmcgHandler {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Pmcg
    }

    fn depends_on(&self) -> &[ObjectKind] {
        &[
            ObjectKind::ItsGroup,
            ObjectKind::SmmuV1V2,
            ObjectKind::SmmuV3,
            ObjectKind::RootComplex,
            ObjectKind::NamedComponent,
        ]
    }

    fn alias(&self) -> Option<&str> {
        self.entry.alias
    }

    fn matches(&self, description: &dyn HardwareDescription, node: NodeOffset) -> bool {
        description.is_compatible(node, &[self.entry.compatible])
    }

    fn ingest(
        &self,
        description: &dyn HardwareDescription,
        graph: &Graph<IortScratch>,
        node: NodeOffset,
    ) -> Result<Vec<Ingested<IortScratch>>, Error> {
        let registers = registers(description, node)?;
        let msi_map = read_msi_map(description, graph, node)?;

        let devices = description.property_u32(node, "devices").map(Handle::new).map_err(|e| e.at(node, "devices"))?;
        if graph.find(devices, 1).is_none() {
            return Err(PropertyError::NotFound.at(node, "devices"));
        }

        let overflow = match description.interrupts(node) {
            Ok(wired) => wired.first().map(|irq| irq.id),
            Err(PropertyError::NotFound) => None,
            Err(error) => return Err(error.at(node, "interrupts")),
        };

        let msi_parent = match overflow {
            Some(_) => None,
            None => {
                let cells =
                    description.property_cells_exact(node, "msi-parent", 2).map_err(|e| e.at(node, "msi-parent"))?;
                Some((Handle::new(cells[0]), cells[1]))
            }
        };

        let scratch = IortScratch {
            register: registers[0],
            msi_map,
            upstream: None,
            detail: Detail::Pmcg {
                page1: registers.get(1).map_or(0, |r| r.base),
                overflow,
                msi_parent,
                devices,
            },
        };

        let mappings = u32::from(msi_parent.is_some());
        Ok(vec![Ingested::new(description.handle(node), scratch).with_aux(ObjectKind::IdMapping, mappings)])
    }

    fn populate(&self, cx: &mut PopulateContext<'_, IortScratch>, id: NodeId) -> Result<(), Error> {
        if cx.is_populated(id) {
            return Ok(());
        }

        let scratch = &cx.node(id).scratch;
        let Detail::Pmcg { page1, overflow, msi_parent, devices } = scratch.detail else {
            return Err(Error::Internal("PMCG descriptor without counter group details"));
        };

        let mappings: Vec<_> = msi_parent
            .map(|(parent, device_id)| IdMapping {
                input_base: 0,
                num_ids: 0,
                output_base: device_id,
                output_reference: cx.reference(id, parent, 1),
                flags: IdMappingFlags::SINGLE,
            })
            .into_iter()
            .collect();

        let record = Pmcg {
            token: Token::NULL,
            base_address: scratch.register.base,
            page1_base_address: page1,
            overflow_interrupt: overflow.unwrap_or(0),
            reference: cx.reference(id, devices, 1),
            id_mappings: cx.write_aux(id, ID_MAPPINGS, mappings)?,
            identifier: cx.next_identifier()?,
        };

        cx.store(id, record)
    }
}
