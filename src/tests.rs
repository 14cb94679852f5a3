// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

extern crate std;

use std::{string::String, vec::Vec};

use pretty_assertions::assert_eq;
use vm_fdt::{FdtWriter, FdtWriterResult};

use crate::{
    cache::{self, AffinityTopology, CacheConfig, Location, Place},
    graph::{Graph, Ingested, KindHandler, NodeId, Outcome, PopulateContext},
    iort::{self, ComponentKind, IortConfig, IortScratch, KindEntry},
    records::{
        AuxSlice, CacheInfo, IdMapping, IdMappingFlags, ItsGroup, ItsIdentifier, MemoryAccessFlags, NamedComponent,
        ObjectReference, Pmcg, ProcessorCacheList, RecordKind, RootComplex, SmmuInterrupt, SmmuV1V2, SmmuV1V2Flags,
        SmmuV3, SmmuV3Flags,
    },
    *,
};

const GIC: u32 = 1;
const ITS: u32 = 2;
const SMMU_V3: u32 = 3;
const SMMU_500: u32 = 5;
const L2: u32 = 10;
const L3: u32 = 11;

const SPI: u32 = 0;
const PPI: u32 = 1;
const LEVEL: u32 = 4;
const EDGE: u32 = 1;

fn strings(values: &[&str]) -> Vec<u8> {
    values.iter().flat_map(|value| value.bytes().chain([0])).collect()
}

fn node(
    fdt: &mut FdtWriter,
    name: &str,
    body: impl FnOnce(&mut FdtWriter) -> FdtWriterResult<()>,
) -> FdtWriterResult<()> {
    let node = fdt.begin_node(name)?;
    body(fdt)?;
    fdt.end_node(node)
}

/// Root with two-cell addresses and sizes and a GICv3 as the interrupt parent
fn tree(body: impl FnOnce(&mut FdtWriter) -> FdtWriterResult<()>) -> Vec<u8> {
    let build = || -> FdtWriterResult<Vec<u8>> {
        let mut fdt = FdtWriter::new()?;

        let root = fdt.begin_node("")?;
        fdt.property_string("compatible", "linux,dummy-virt")?;
        fdt.property_u32("#address-cells", 2)?;
        fdt.property_u32("#size-cells", 2)?;
        fdt.property_u32("interrupt-parent", GIC)?;

        node(&mut fdt, "interrupt-controller@8000000", |fdt| {
            fdt.property_string("compatible", "arm,gic-v3")?;
            fdt.property_array_u64("reg", &[0x0800_0000, 0x1_0000])?;
            fdt.property_u32("#interrupt-cells", 3)?;
            fdt.property_null("interrupt-controller")?;
            fdt.property_u32("phandle", GIC)
        })?;

        body(&mut fdt)?;

        fdt.end_node(root)?;
        fdt.finish()
    };

    build().unwrap()
}

fn its(fdt: &mut FdtWriter) -> FdtWriterResult<()> {
    node(fdt, "msi-controller@8080000", |fdt| {
        fdt.property_string("compatible", "arm,gic-v3-its")?;
        fdt.property_array_u64("reg", &[0x0808_0000, 0x2_0000])?;
        fdt.property_null("msi-controller")?;
        fdt.property_u32("phandle", ITS)
    })
}

fn smmu_v3(fdt: &mut FdtWriter, msi_map: bool) -> FdtWriterResult<()> {
    node(fdt, "iommu@5000000", |fdt| {
        fdt.property_string("compatible", "arm,smmu-v3")?;
        fdt.property_array_u64("reg", &[0x0500_0000, 0x2_0000])?;
        fdt.property_array_u32("interrupts", &[SPI, 100, EDGE, SPI, 101, EDGE, SPI, 102, EDGE, SPI, 103, EDGE])?;
        fdt.property("interrupt-names", &strings(&["eventq", "priq", "gerror", "cmdq-sync"]))?;
        fdt.property_null("dma-coherent")?;
        fdt.property_u32("numa-node-id", 1)?;
        if msi_map {
            fdt.property_array_u32("msi-map", &[0, ITS, 0x1_0000, 1])?;
        }
        fdt.property_u32("phandle", SMMU_V3)
    })
}

fn mmu_500(fdt: &mut FdtWriter, global_interrupts: u32) -> FdtWriterResult<()> {
    node(fdt, "iommu@12000000", |fdt| {
        fdt.property_string("compatible", "arm,mmu-500")?;
        fdt.property_array_u64("reg", &[0x1200_0000, 0x80_0000, 0x1100_0000, 0x80_0000])?;
        fdt.property_u32("#global-interrupts", global_interrupts)?;
        fdt.property_array_u32("interrupts", &[SPI, 10, LEVEL, SPI, 11, LEVEL, SPI, 12, LEVEL])?;
        fdt.property_u32("phandle", SMMU_500)
    })?;

    node(fdt, "pmu", |fdt| {
        fdt.property_string("compatible", "arm,armv8-pmuv3")?;
        fdt.property_array_u32("interrupts", &[PPI, 7, LEVEL])
    })
}

fn dma_window(fdt: &mut FdtWriter) -> FdtWriterResult<()> {
    // 1 TiB inbound window at bus and CPU address 0
    fdt.property_array_u32("dma-ranges", &[0x0200_0000, 0, 0, 0, 0, 0x100, 0])
}

fn build_iort(blob: &[u8], config: IortConfig) -> (Result<Outcome, Error>, InMemoryRepository) {
    let fdt = Fdt::new(blob).unwrap();
    let mut repository = InMemoryRepository::new();
    let outcome = iort::build(&fdt, &mut repository, config);

    (outcome, repository)
}

fn records_of<T: RecordKind + Clone>(repository: &InMemoryRepository) -> Vec<T> {
    repository.records(T::KIND).filter_map(T::from_record).cloned().collect()
}

fn slice_of<T: RecordKind + Clone>(repository: &InMemoryRepository, slice: AuxSlice) -> Vec<T> {
    repository
        .records(T::KIND)
        .skip(slice.start as usize)
        .take(slice.count as usize)
        .filter_map(T::from_record)
        .cloned()
        .collect()
}

/// The one record of kind `T`
fn only<T: RecordKind + Clone>(repository: &InMemoryRepository) -> T {
    let records = records_of::<T>(repository);
    assert_eq!(records.len(), 1, "expected exactly one {:?} record", T::KIND);

    records[0].clone()
}

fn kind_at(repository: &InMemoryRepository, token: Token) -> Option<ObjectKind> {
    repository.lookup(token).map(Record::kind)
}

fn assert_no_dangling_references(repository: &InMemoryRepository) {
    for entry in repository.entries() {
        for record in &entry.records {
            for reference in record.references().into_iter().filter(|token| !token.is_null()) {
                assert!(repository.lookup(reference).is_some(), "{:?} refers to unknown {reference:?}", entry.kind);
            }
        }
    }
}

fn assert_counts_match(outcome: &Outcome, repository: &InMemoryRepository) {
    let Outcome::Assembled(counts) = outcome else {
        panic!("expected an assembled table, got {outcome:?}");
    };

    let delivered: Vec<(ObjectKind, usize)> = repository.entries().iter().map(|e| (e.kind, e.records.len())).collect();
    assert_eq!(counts, &delivered);
    assert!(delivered.iter().all(|&(_, count)| count > 0));
}

fn smmu_and_root_complex(fdt: &mut FdtWriter) -> FdtWriterResult<()> {
    its(fdt)?;
    smmu_v3(fdt, true)?;

    node(fdt, "pcie@30000000", |fdt| {
        fdt.property_string("compatible", "pci-host-ecam-generic")?;
        fdt.property_array_u64("reg", &[0x3000_0000, 0x1000_0000])?;
        fdt.property_array_u32("msi-map", &[0, ITS, 0x2_0000, 0x100])?;
        fdt.property_array_u32("iommu-map", &[0, SMMU_V3, 0, 0x100])?;
        fdt.property_u32("linux,pci-domain", 5)?;
        fdt.property_null("dma-coherent")?;
        fdt.property_null("ats-supported")?;
        dma_window(fdt)
    })
}

#[test]
fn smmu_collects_its_own_and_its_clients_msi_ranges() {
    let blob = tree(smmu_and_root_complex);
    let (outcome, repository) = build_iort(&blob, IortConfig::default());
    let outcome = outcome.unwrap();

    assert_counts_match(&outcome, &repository);
    assert_no_dangling_references(&repository);

    let group = only::<ItsGroup>(&repository);
    assert_eq!(slice_of::<ItsIdentifier>(&repository, group.its_ids), [ItsIdentifier { its_id: 0 }]);

    let smmu = only::<SmmuV3>(&repository);
    assert_eq!(smmu.base_address, 0x0500_0000);
    assert_eq!(smmu.flags, SmmuV3Flags::PROXIMITY_DOMAIN | SmmuV3Flags::COHAC_OVERRIDE);
    assert_eq!(smmu.proximity_domain, 1);
    assert_eq!(
        (smmu.event_interrupt, smmu.pri_interrupt, smmu.gerr_interrupt, smmu.sync_interrupt),
        (132, 133, 134, 135)
    );
    assert_eq!(smmu.device_id_mapping_index, 0);

    let mappings = slice_of::<IdMapping>(&repository, smmu.id_mappings);
    assert_eq!(
        mappings,
        [
            IdMapping {
                input_base: 0,
                num_ids: 0,
                output_base: 0x1_0000,
                output_reference: group.token,
                flags: IdMappingFlags::SINGLE
            },
            IdMapping {
                input_base: 0,
                num_ids: 0xff,
                output_base: 0x2_0000,
                output_reference: group.token,
                flags: IdMappingFlags::empty()
            },
        ]
    );

    let root_complex = only::<RootComplex>(&repository);
    assert_eq!(root_complex.pci_segment_number, 5);
    assert_eq!(root_complex.memory_address_size, 40);
    assert_eq!(root_complex.cache_coherent, 1);
    assert_eq!(root_complex.ats_attribute, 1);
    assert_eq!(root_complex.memory_access_flags, MemoryAccessFlags::CPM);
    assert_eq!(
        slice_of::<IdMapping>(&repository, root_complex.id_mappings),
        [IdMapping {
            input_base: 0,
            num_ids: 0xff,
            output_base: 0,
            output_reference: smmu.token,
            flags: IdMappingFlags::empty()
        }]
    );

    let mut identifiers = [group.identifier, smmu.identifier, root_complex.identifier];
    identifiers.sort_unstable();
    assert_eq!(identifiers, [0, 1, 2]);
}

#[test]
fn single_id_root_complexes_map_one_id_per_smmu_instance() {
    let blob = tree(|fdt| {
        its(fdt)?;
        smmu_v3(fdt, false)?;

        node(fdt, "pcie@14100000", |fdt| {
            fdt.property_string("compatible", "nvidia,tegra234-pcie")?;
            fdt.property_array_u64("reg", &[0x1410_0000, 0x2_0000])?;
            fdt.property_array_u32("iommu-map", &[0x40, SMMU_V3, 0x7, 0x1000])?;
            fdt.property_u32("iommu-map-mask", 0)
        })
    });

    let (outcome, repository) = build_iort(&blob, IortConfig::default());
    assert!(matches!(outcome, Ok(Outcome::Assembled(_))));
    assert_no_dangling_references(&repository);

    let smmu = only::<SmmuV3>(&repository);
    let root_complex = only::<RootComplex>(&repository);

    // There is only one SMMU instance behind the handle, so the second
    // mapping's reference stays null
    assert_eq!(
        slice_of::<IdMapping>(&repository, root_complex.id_mappings),
        [
            IdMapping {
                input_base: 0x40,
                num_ids: 0,
                output_base: 0x7,
                output_reference: smmu.token,
                flags: IdMappingFlags::SINGLE
            },
            IdMapping {
                input_base: 0x41,
                num_ids: 0,
                output_base: 0x7,
                output_reference: Token::NULL,
                flags: IdMappingFlags::SINGLE
            },
        ]
    );
    assert_eq!(root_complex.memory_address_size, 48);
    assert!(smmu.id_mappings.is_empty());
}

#[test]
fn dual_smmu_serves_an_aliased_named_component() {
    let blob = tree(|fdt| {
        mmu_500(fdt, 1)?;

        node(fdt, "aliases", |fdt| fdt.property_string("nvdla0", "/dla@15880000"))?;
        node(fdt, "dla@15880000", |fdt| {
            fdt.property_string("compatible", "vendor,accelerator")?;
            fdt.property_array_u64("reg", &[0x1588_0000, 0x4_0000])?;
            fdt.property_array_u32("iommus", &[SMMU_500, 0x800])?;
            fdt.property_null("dma-coherent")?;
            fdt.property_null("nvidia,dacs-supported")
        })
    });

    let (outcome, repository) = build_iort(&blob, IortConfig::default());
    assert_counts_match(&outcome.unwrap(), &repository);
    assert_no_dangling_references(&repository);

    let smmus = records_of::<SmmuV1V2>(&repository);
    assert_eq!(smmus.len(), 2);
    assert_eq!(smmus.iter().map(|s| (s.base_address, s.span)).collect::<Vec<_>>(), [
        (0x1200_0000, 0x80_0000),
        (0x1100_0000, 0x80_0000)
    ]);

    for smmu in &smmus {
        assert_eq!(smmu.model, 3);
        assert_eq!(smmu.flags, SmmuV1V2Flags::COHERENT_WALK);
        assert_eq!(smmu.global_interrupt, SmmuInterrupt { interrupt: 42, flags: 0 });
        assert_eq!(smmu.global_config_interrupt, SmmuInterrupt::default());
        assert_eq!(
            slice_of::<SmmuInterrupt>(&repository, smmu.context_interrupts),
            [SmmuInterrupt { interrupt: 43, flags: 0 }, SmmuInterrupt { interrupt: 44, flags: 0 }]
        );
        assert_eq!(slice_of::<SmmuInterrupt>(&repository, smmu.pmu_interrupts), [SmmuInterrupt {
            interrupt: 23,
            flags: 0
        }]);
    }

    let named = only::<NamedComponent>(&repository);
    assert_eq!(named.object_name, String::from("\\_SB.DLA0"));
    assert_eq!(named.memory_access_flags, MemoryAccessFlags::CPM | MemoryAccessFlags::DACS);
    assert_eq!(named.address_size_limit, 48);

    let references: Vec<Token> =
        slice_of::<IdMapping>(&repository, named.id_mappings).iter().map(|m| m.output_reference).collect();
    assert_eq!(references, [smmus[0].token, smmus[1].token]);
}

#[test]
fn performance_monitors_signal_through_msi_parent_or_interrupt() {
    let blob = tree(|fdt| {
        its(fdt)?;
        smmu_v3(fdt, false)?;

        node(fdt, "pmu@5100000", |fdt| {
            fdt.property_string("compatible", "arm,smmu-v3-pmcg")?;
            fdt.property_array_u64("reg", &[0x0510_0000, 0x1000, 0x0511_0000, 0x1000])?;
            fdt.property_u32("devices", SMMU_V3)?;
            fdt.property_array_u32("msi-parent", &[ITS, 0x55])
        })?;

        node(fdt, "pmu@5200000", |fdt| {
            fdt.property_string("compatible", "arm,smmu-v3-pmcg")?;
            fdt.property_array_u64("reg", &[0x0520_0000, 0x1000])?;
            fdt.property_u32("devices", SMMU_V3)?;
            fdt.property_array_u32("interrupts", &[SPI, 200, EDGE])
        })
    });

    let (outcome, repository) = build_iort(&blob, IortConfig::default());
    assert_counts_match(&outcome.unwrap(), &repository);

    let group = only::<ItsGroup>(&repository);
    let smmu = only::<SmmuV3>(&repository);
    let pmcgs = records_of::<Pmcg>(&repository);
    assert_eq!(pmcgs.len(), 2);
    let (by_msi, by_wire) = (&pmcgs[0], &pmcgs[1]);

    assert_eq!((by_msi.base_address, by_msi.page1_base_address), (0x0510_0000, 0x0511_0000));
    assert_eq!(by_msi.reference, smmu.token);
    assert_eq!(by_msi.overflow_interrupt, 0);
    assert_eq!(
        slice_of::<IdMapping>(&repository, by_msi.id_mappings),
        [IdMapping {
            input_base: 0,
            num_ids: 0,
            output_base: 0x55,
            output_reference: group.token,
            flags: IdMappingFlags::SINGLE
        }]
    );

    assert_eq!((by_wire.page1_base_address, by_wire.overflow_interrupt), (0, 232));
    assert!(by_wire.id_mappings.is_empty());

    let (outcome, repository) = build_iort(&blob, IortConfig { pmcg_supported: false, ..IortConfig::default() });
    assert!(outcome.is_ok());
    assert_eq!(repository.records(ObjectKind::Pmcg).count(), 0);
    assert_eq!(repository.records(ObjectKind::IdMapping).count(), 0);
}

#[test]
fn unreachable_devices_are_skipped() {
    let blob = tree(|fdt| {
        its(fdt)?;

        // No upstream SMMU and no MSI range
        node(fdt, "pcie@20000000", |fdt| {
            fdt.property_string("compatible", "pci-host-ecam-generic")?;
            fdt.property_array_u64("reg", &[0x2000_0000, 0x1000])
        })?;

        // `msi-map` names something that is not an ITS group
        node(fdt, "pcie@21000000", |fdt| {
            fdt.property_string("compatible", "pci-host-ecam-generic")?;
            fdt.property_array_u64("reg", &[0x2100_0000, 0x1000])?;
            fdt.property_array_u32("msi-map", &[0, 0x99, 0, 0x10])
        })?;

        node(fdt, "pcie@22000000", |fdt| {
            fdt.property_string("compatible", "pci-host-ecam-generic")?;
            fdt.property_array_u64("reg", &[0x2200_0000, 0x1000])?;
            fdt.property_string("status", "disabled")?;
            fdt.property_array_u32("msi-map", &[0, ITS, 0, 0x10])
        })?;

        node(fdt, "pcie@23000000", |fdt| {
            fdt.property_string("compatible", "pci-host-ecam-generic")?;
            fdt.property_array_u64("reg", &[0x2300_0000, 0x1000])?;
            fdt.property_array_u32("msi-map", &[0, ITS, 0x300, 0x10])
        })
    });

    let (outcome, repository) = build_iort(&blob, IortConfig::default());
    assert_counts_match(&outcome.unwrap(), &repository);

    let group = only::<ItsGroup>(&repository);
    let root_complex = only::<RootComplex>(&repository);
    assert_eq!(
        slice_of::<IdMapping>(&repository, root_complex.id_mappings),
        [IdMapping {
            input_base: 0,
            num_ids: 0xf,
            output_base: 0x300,
            output_reference: group.token,
            flags: IdMappingFlags::empty()
        }]
    );
}

#[test]
fn kinds_without_descriptors_are_not_handed_over() {
    let blob = tree(its);
    let (outcome, repository) = build_iort(&blob, IortConfig::default());

    assert_eq!(outcome, Ok(Outcome::Assembled(std::vec![(ObjectKind::ItsGroup, 1), (ObjectKind::ItsIdentifier, 1)])));
    assert_eq!(repository.entries().iter().map(|e| e.kind).collect::<Vec<_>>(), [
        ObjectKind::ItsGroup,
        ObjectKind::ItsIdentifier
    ]);
}

#[test]
fn missing_identity_aborts_without_output() {
    let blob = tree(|fdt| {
        its(fdt)?;
        node(fdt, "iommu@6000000", |fdt| fdt.property_string("compatible", "arm,smmu-v3"))
    });

    let (outcome, repository) = build_iort(&blob, IortConfig::default());

    assert!(matches!(outcome, Err(Error::MissingIdentity { property: "reg", .. })));
    assert!(repository.is_empty());
}

#[test]
fn unsupported_smmu_omits_the_table() {
    let blob = tree(|fdt| mmu_500(fdt, 3));
    let (outcome, repository) = build_iort(&blob, IortConfig::default());

    assert!(matches!(outcome, Ok(Outcome::Omitted(_))));
    assert!(repository.is_empty());
}

#[test]
fn disabled_table_touches_nothing() {
    let blob = tree(smmu_and_root_complex);
    let (outcome, repository) = build_iort(&blob, IortConfig { enabled: false, ..IortConfig::default() });

    assert!(matches!(outcome, Ok(Outcome::Omitted(_))));
    assert!(repository.is_empty());
}

#[test]
fn dependencies_must_be_declared_first() {
    let blob = tree(smmu_and_root_complex);
    let config = IortConfig {
        kinds: std::vec![
            KindEntry::new(ComponentKind::ItsGroup, "arm,gic-v3-its"),
            KindEntry::new(ComponentKind::RootComplex, "pci-host-ecam-generic"),
            KindEntry::new(ComponentKind::SmmuV3, "arm,smmu-v3"),
        ],
        ..IortConfig::default()
    };

    let (outcome, repository) = build_iort(&blob, config);

    assert_eq!(
        outcome,
        Err(Error::DeclarationOrder { kind: ObjectKind::RootComplex, dependency: ObjectKind::SmmuV3 })
    );
    assert!(repository.is_empty());
}

#[test]
fn output_does_not_depend_on_the_first_token() {
    let blob = tree(smmu_and_root_complex);
    let fdt = Fdt::new(&blob).unwrap();

    let mut first = InMemoryRepository::new();
    let mut again = InMemoryRepository::new();
    let mut shifted = InMemoryRepository::with_first_token(0x1000);

    iort::build(&fdt, &mut first, IortConfig::default()).unwrap();
    iort::build(&fdt, &mut again, IortConfig::default()).unwrap();
    iort::build(&fdt, &mut shifted, IortConfig::default()).unwrap();

    assert_eq!(first.entries(), again.entries());

    // Same records with every token moved by the same offset
    let shift = |token: Token| match token.is_null() {
        true => token,
        false => Token::new(token.get() + 0x1000 - 1),
    };
    for (a, b) in first.entries().iter().zip(shifted.entries()) {
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.tokens.as_ref().map(|t| t.iter().copied().map(shift).collect::<Vec<_>>()), b.tokens);
        for (x, y) in a.records.iter().zip(&b.records) {
            assert_eq!(x.references().into_iter().map(shift).collect::<Vec<_>>(), y.references());
        }
    }
}

/// Claims SMMUv3 nodes but writes ITS group records for them
struct MislabeledSmmu;

impl KindHandler<()> for MislabeledSmmu {
    fn kind(&self) -> ObjectKind {
        ObjectKind::SmmuV3
    }

    fn matches(&self, description: &dyn HardwareDescription, node: NodeOffset) -> bool {
        description.is_compatible(node, &["arm,smmu-v3"])
    }

    fn ingest(
        &self,
        description: &dyn HardwareDescription,
        _: &Graph<()>,
        node: NodeOffset,
    ) -> Result<Vec<Ingested<()>>, Error> {
        Ok(std::vec![Ingested::new(description.handle(node), ())])
    }

    fn populate(&self, cx: &mut PopulateContext<'_, ()>, node: NodeId) -> Result<(), Error> {
        cx.store(node, ItsGroup::default())
    }
}

#[test]
fn handler_writing_the_wrong_record_kind_fails_the_run() {
    let blob = tree(|fdt| smmu_v3(fdt, false));
    let fdt = Fdt::new(&blob).unwrap();
    let handlers: [&dyn KindHandler<()>; 1] = [&MislabeledSmmu];
    let mut repository = InMemoryRepository::new();

    let outcome = Graph::run(&fdt, &mut repository, &handlers);

    assert_eq!(outcome, Err(Error::Internal("record kind does not match its descriptor")));
    assert!(repository.is_empty());
}

#[test]
fn populating_again_changes_nothing() {
    let blob = tree(smmu_and_root_complex);
    let fdt = Fdt::new(&blob).unwrap();
    let config = IortConfig::default();
    let handlers = iort::handlers(&config);
    let handlers: Vec<&dyn KindHandler<IortScratch>> = handlers.iter().map(|h| h.as_ref()).collect();

    let mut once = InMemoryRepository::new();
    Graph::run(&fdt, &mut once, &handlers).unwrap();

    let mut twice = InMemoryRepository::new();
    Graph::run_with(&fdt, &mut twice, &handlers, |graph, table, _| {
        let populated = table.arrays().to_vec();
        graph.populate(&fdt, &handlers, table, &mut IdentifierAllocator::default())?;

        assert_eq!(table.arrays(), populated.as_slice());
        Ok(())
    })
    .unwrap();

    assert_eq!(once.entries(), twice.entries());
}

/// Accepts every batch except those of one kind
struct RefusingRepository {
    inner: InMemoryRepository,
    refused: ObjectKind,
}

impl ObjectRepository for RefusingRepository {
    fn allocate_tokens(&mut self, count: usize) -> Result<Vec<Token>, Error> {
        self.inner.allocate_tokens(count)
    }

    fn add_records(&mut self, kind: ObjectKind, records: &[Record], tokens: Option<&[Token]>) -> Result<(), Error> {
        if kind == self.refused {
            return Err(Error::Repository { kind, reason: "refused" });
        }

        self.inner.add_records(kind, records, tokens)
    }
}

#[test]
fn refused_batch_stops_the_hand_over() {
    let blob = tree(smmu_and_root_complex);
    let fdt = Fdt::new(&blob).unwrap();
    let mut repository = RefusingRepository { inner: InMemoryRepository::new(), refused: ObjectKind::RootComplex };

    let outcome = iort::build(&fdt, &mut repository, IortConfig::default());

    assert_eq!(outcome, Err(Error::Repository { kind: ObjectKind::RootComplex, reason: "refused" }));
    // Batches ahead of the refused one stay with the repository
    assert_eq!(repository.inner.entries().iter().map(|e| e.kind).collect::<Vec<_>>(), [
        ObjectKind::ItsGroup,
        ObjectKind::SmmuV3
    ]);
}

fn cache_tree(fdt: &mut FdtWriter) -> FdtWriterResult<()> {
    node(fdt, "cpus", |fdt| {
        fdt.property_u32("#address-cells", 1)?;
        fdt.property_u32("#size-cells", 0)?;

        for (name, mpidr) in [("cpu@0", 0x0), ("cpu@100", 0x100), ("cpu@200", 0x200)] {
            node(fdt, name, |fdt| {
                fdt.property_string("device_type", "cpu")?;
                fdt.property_string("compatible", "arm,cortex-a78")?;
                fdt.property_u32("reg", mpidr)?;
                fdt.property_u32("i-cache-size", 0x1_0000)?;
                fdt.property_u32("i-cache-sets", 256)?;
                fdt.property_u32("d-cache-size", 0x1_0000)?;
                fdt.property_u32("d-cache-sets", 256)?;
                fdt.property_u32("next-level-cache", L2)
            })?;
        }

        Ok(())
    })?;

    node(fdt, "l2-cache", |fdt| {
        fdt.property_string("compatible", "cache")?;
        fdt.property_null("cache-unified")?;
        fdt.property_u32("cache-level", 2)?;
        fdt.property_u32("cache-size", 0x10_0000)?;
        fdt.property_u32("cache-sets", 1024)?;
        fdt.property_u32("next-level-cache", L3)?;
        fdt.property_u32("phandle", L2)
    })?;

    node(fdt, "l3-cache", |fdt| {
        fdt.property_string("compatible", "cache")?;
        fdt.property_null("cache-unified")?;
        fdt.property_u32("cache-level", 3)?;
        fdt.property_u32("cache-size", 0x40_0000)?;
        fdt.property_u32("cache-sets", 4096)?;
        fdt.property_u32("cache-line-size", 128)?;
        fdt.property_u32("phandle", L3)
    })
}

#[test]
fn caches_roll_up_to_core_cluster_and_socket_lists() {
    let blob = tree(cache_tree);
    let fdt = Fdt::new(&blob).unwrap();
    let mut repository = InMemoryRepository::new();

    // The third core is present in the devicetree but not enabled
    let topology = AffinityTopology::from_enabled([AffinityTopology::mpidr(0, 0, 0), AffinityTopology::mpidr(0, 0, 1)]);
    let (outcome, hierarchy) = cache::build(&fdt, &topology, &mut repository, CacheConfig::default()).unwrap();

    assert_counts_match(&outcome, &repository);
    assert_no_dangling_references(&repository);
    assert_eq!(records_of::<CacheInfo>(&repository).len(), 6);

    let cluster = Location { core: Place::Shared, ..Location::core(0, 0, 0) };
    let socket = Location::core(0, 0, 0).socket_level();
    let locations: Vec<Location> = hierarchy.entries().iter().map(|entry| entry.location).collect();
    assert_eq!(locations.len(), 4);
    for location in [Location::core(0, 0, 0), Location::core(0, 0, 1), cluster, socket] {
        assert!(locations.contains(&location), "no cache list at {location:?}");
    }

    let cache_at = |token: Token| match repository.lookup(token) {
        Some(Record::CacheInfo(info)) => info.clone(),
        other => panic!("{token:?} is not a cache: {other:?}"),
    };

    let single = |location: Location| match hierarchy.at(location).unwrap().caches[..] {
        [token] => token,
        ref other => panic!("expected one cache at {location:?}, got {other:?}"),
    };
    let (l2_token, l3_token) = (single(cluster), single(socket));
    let (l2, l3) = (cache_at(l2_token), cache_at(l3_token));

    assert_eq!(l2.next_level, l3_token);
    assert_eq!(l2.cache_id, 0x0100_0001);
    assert_eq!(l2.associativity, 16);
    assert_eq!(l3.next_level, Token::NULL);
    assert_eq!(l3.cache_id, 0x1);
    assert_eq!((l3.line_size, l3.associativity), (128, 8));

    let core1 = hierarchy.at(Location::core(0, 0, 1)).unwrap();
    let core1_caches: Vec<CacheInfo> = core1.caches.iter().map(|&token| cache_at(token)).collect();
    assert_eq!(core1_caches.iter().map(|cache| cache.cache_id).collect::<Vec<_>>(), [0x0210_1001, 0x0220_1001]);
    assert!(core1_caches.iter().all(|cache| cache.next_level == l2_token));

    let lists = records_of::<ProcessorCacheList>(&repository);
    assert_eq!(lists.len(), 4);

    let list = lists.iter().find(|list| list.location == cluster).unwrap();
    assert_eq!(slice_of::<ObjectReference>(&repository, list.caches), [ObjectReference { reference: l2_token }]);
    assert_eq!(kind_at(&repository, hierarchy.at(cluster).unwrap().list), Some(ObjectKind::ProcessorCacheList));
}

#[test]
fn caches_shared_across_sockets_omit_the_table() {
    let blob = tree(|fdt| {
        node(fdt, "cpus", |fdt| {
            fdt.property_u32("#address-cells", 2)?;
            fdt.property_u32("#size-cells", 0)?;

            for (name, mpidr) in [("cpu@0", 0x0), ("cpu@100000000", 0x1_0000_0000)] {
                node(fdt, name, |fdt| {
                    fdt.property_string("device_type", "cpu")?;
                    fdt.property_u64("reg", mpidr)?;
                    fdt.property_u32("d-cache-size", 0x1_0000)?;
                    fdt.property_u32("d-cache-sets", 256)?;
                    fdt.property_u32("next-level-cache", L2)
                })?;
            }

            Ok(())
        })?;

        node(fdt, "l2-cache", |fdt| {
            fdt.property_string("compatible", "cache")?;
            fdt.property_null("cache-unified")?;
            fdt.property_u32("cache-level", 2)?;
            fdt.property_u32("cache-size", 0x10_0000)?;
            fdt.property_u32("cache-sets", 1024)?;
            fdt.property_u32("phandle", L2)
        })
    });

    let fdt = Fdt::new(&blob).unwrap();
    let mut repository = InMemoryRepository::new();
    let topology =
        AffinityTopology::from_enabled([AffinityTopology::mpidr(0, 0, 0), AffinityTopology::mpidr(1, 0, 0)]);

    let (outcome, hierarchy) = cache::build(&fdt, &topology, &mut repository, CacheConfig::default()).unwrap();

    assert_eq!(outcome, Outcome::Omitted("cache shared between sockets"));
    assert!(hierarchy.is_empty());
    assert!(repository.is_empty());
}
