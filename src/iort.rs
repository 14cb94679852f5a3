// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! I/O remapping topology.
//!
//! Interrupt translation services, SMMUs, PCIe root complexes, named
//! platform devices and SMMU performance monitors are linked through their
//! `msi-map`, `iommus`, `iommu-map`, `msi-parent` and `devices` references.
//! Each SMMU learns which devices sit behind it before any record is written,
//! so its ID mapping array can be sized up front.

mod handlers;
mod mapping;

pub use handlers::{Detail, Endpoint, IortScratch, SmmuV1V2Interrupts, SmmuV3Interrupts};
pub use mapping::{dma_address_bits, IdRange, Upstream};

use alloc::{boxed::Box, vec::Vec};

use crate::{
    description::HardwareDescription,
    graph::{Graph, KindHandler, Outcome},
    records::ObjectKind,
    repository::ObjectRepository,
    Error,
};
use handlers::{ItsGroupHandler, NamedComponentHandler, PmcgHandler, RootComplexHandler, SmmuV1V2Handler, SmmuV3Handler};

/// The component kinds a devicetree node can be declared as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    ItsGroup,
    SmmuV1V2,
    SmmuV3,
    RootComplex,
    NamedComponent,
    Pmcg,
}

impl ComponentKind {
    pub fn object_kind(self) -> ObjectKind {
        match self {
            ComponentKind::ItsGroup => ObjectKind::ItsGroup,
            ComponentKind::SmmuV1V2 => ObjectKind::SmmuV1V2,
            ComponentKind::SmmuV3 => ObjectKind::SmmuV3,
            ComponentKind::RootComplex => ObjectKind::RootComplex,
            ComponentKind::NamedComponent => ObjectKind::NamedComponent,
            ComponentKind::Pmcg => ObjectKind::Pmcg,
        }
    }
}

/// One line of the kind declaration table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindEntry {
    pub kind: ComponentKind,
    pub compatible: &'static str,
    /// When set, the one node this `/aliases` entry names is used and
    /// `compatible` is not consulted
    pub alias: Option<&'static str>,
    /// ACPI object name of a named component
    pub object_name: Option<&'static str>,
    /// Sits behind two SMMU instances sharing one handle
    pub dual: bool,
}

impl KindEntry {
    pub const fn new(kind: ComponentKind, compatible: &'static str) -> Self {
        Self { kind, compatible, alias: None, object_name: None, dual: false }
    }

    pub const fn alias(mut self, alias: &'static str) -> Self {
        self.alias = Some(alias);
        self
    }

    pub const fn named(mut self, object_name: &'static str) -> Self {
        self.object_name = Some(object_name);
        self
    }

    pub const fn dual(mut self) -> Self {
        self.dual = true;
        self
    }
}

/// Kinds recognized by default, in declaration order
pub const DEFAULT_KINDS: &[KindEntry] = &[
    KindEntry::new(ComponentKind::ItsGroup, "arm,gic-v3-its"),
    KindEntry::new(ComponentKind::SmmuV1V2, "arm,mmu-500"),
    KindEntry::new(ComponentKind::SmmuV1V2, "nvidia,tegra234-smmu"),
    KindEntry::new(ComponentKind::SmmuV3, "arm,smmu-v3"),
    KindEntry::new(ComponentKind::RootComplex, "nvidia,tegra234-pcie").dual(),
    KindEntry::new(ComponentKind::RootComplex, "nvidia,th500-pcie"),
    KindEntry::new(ComponentKind::RootComplex, "pci-host-ecam-generic"),
    KindEntry::new(ComponentKind::NamedComponent, "nvidia,tegra234-nvdla").alias("nvdla0").named("\\_SB.DLA0").dual(),
    KindEntry::new(ComponentKind::NamedComponent, "nvidia,tegra186-qspi").alias("socket0_qspi1").named("\\_SB_.QSP1"),
    KindEntry::new(ComponentKind::NamedComponent, "nvidia,th500-soc-hwpm").named("\\_SB_.HWP0"),
    KindEntry::new(ComponentKind::NamedComponent, "nvidia,th500-psc").named("\\_SB_.PSC0"),
    KindEntry::new(ComponentKind::Pmcg, "arm,smmu-v3-pmcg"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IortConfig {
    /// Build the table at all
    pub enabled: bool,
    /// Build PMCG records; PMCG entries of `kinds` are ignored otherwise
    pub pmcg_supported: bool,
    /// Memory address size of devices without a `dma-ranges` window
    pub default_address_bits: u8,
    pub kinds: Vec<KindEntry>,
}

impl Default for IortConfig {
    fn default() -> Self {
        Self { enabled: true, pmcg_supported: true, default_address_bits: 48, kinds: DEFAULT_KINDS.to_vec() }
    }
}

pub(crate) fn handlers(config: &IortConfig) -> Vec<Box<dyn KindHandler<IortScratch>>> {
    let mut handlers: Vec<Box<dyn KindHandler<IortScratch>>> = Vec::with_capacity(config.kinds.len());

    for &entry in &config.kinds {
        let handler: Box<dyn KindHandler<IortScratch>> = match entry.kind {
            ComponentKind::ItsGroup => Box::new(ItsGroupHandler::new(entry)),
            ComponentKind::SmmuV1V2 => Box::new(SmmuV1V2Handler::new(entry)),
            ComponentKind::SmmuV3 => Box::new(SmmuV3Handler::new(entry)),
            ComponentKind::RootComplex => Box::new(RootComplexHandler::new(entry, config.default_address_bits)),
            ComponentKind::NamedComponent if entry.object_name.is_none() => {
                log::warn!("named component `{}` has no object name, ignoring it", entry.compatible);
                continue;
            }
            ComponentKind::NamedComponent => Box::new(NamedComponentHandler::new(entry, config.default_address_bits)),
            ComponentKind::Pmcg if !config.pmcg_supported => {
                log::debug!("PMCG `{}` ignored, PMCG records are disabled", entry.compatible);
                continue;
            }
            ComponentKind::Pmcg => Box::new(PmcgHandler::new(entry)),
        };

        handlers.push(handler);
    }

    handlers
}

/// Builds the I/O topology records of `description` and hands them to
/// `repository`
pub fn build<R: ObjectRepository + ?Sized>(
    description: &dyn HardwareDescription,
    repository: &mut R,
    config: IortConfig,
) -> Result<Outcome, Error> {
    if !config.enabled {
        log::warn!("I/O topology disabled by configuration");
        return Ok(Outcome::Omitted("I/O topology disabled"));
    }

    let handlers = handlers(&config);
    let handlers: Vec<&dyn KindHandler<IortScratch>> = handlers.iter().map(|handler| handler.as_ref()).collect();

    Graph::run(description, repository, &handlers)
}
