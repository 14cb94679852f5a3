// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-layout output records, one type per [`ObjectKind`].
//!
//! Records refer to each other only through [`Token`]s. Variable-length
//! sub-tables (ID mappings, interrupt lists, cache references) live in their
//! own shared arrays and are referenced with an [`AuxSlice`].

use alloc::{string::String, vec, vec::Vec};
use core::ops::Range;

use crate::{cache::Location, token::Token};

/// Starting index and length of a slice of a shared auxiliary array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuxSlice {
    pub start: u32,
    pub count: u32,
}

impl AuxSlice {
    pub fn range(self) -> Range<usize> {
        self.start as usize..(self.start + self.count) as usize
    }

    pub fn is_empty(self) -> bool {
        self.count == 0
    }
}

bitflags::bitflags! {
    /// Cache allocation, type and write policy bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CacheAttributes: u8 {
        const ALLOCATE_WRITE = 1 << 0;
        const ALLOCATE_READ_WRITE = 1 << 1;
        const INSTRUCTION = 1 << 2;
        const UNIFIED = 1 << 3;
        const WRITE_THROUGH = 1 << 4;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SmmuV1V2Flags: u32 {
        const DVM = 1 << 0;
        const COHERENT_WALK = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SmmuV3Flags: u32 {
        const COHAC_OVERRIDE = 1 << 0;
        const HTTU_OVERRIDE = 3 << 1;
        const PROXIMITY_DOMAIN = 1 << 3;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryAccessFlags: u8 {
        const CPM = 1 << 0;
        const DACS = 1 << 1;
        const CANWBS = 1 << 2;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IdMappingFlags: u32 {
        /// Exactly one ID is mapped rather than a range
        const SINGLE = 1 << 0;
    }
}

pub const SMMU_V1V2_MODEL_MMU500: u32 = 3;
pub const SMMU_V3_MODEL_GENERIC: u32 = 0;
pub const COHERENT_ACCESS: u32 = 1;
pub const ATS_SUPPORTED: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheInfo {
    pub token: Token,
    pub next_level: Token,
    pub size: u32,
    pub sets: u32,
    pub associativity: u32,
    pub attributes: CacheAttributes,
    pub line_size: u16,
    pub cache_id: u32,
}

/// Caches located at one socket, cluster or core position
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessorCacheList {
    pub token: Token,
    pub location: Location,
    pub caches: AuxSlice,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectReference {
    pub reference: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItsGroup {
    pub token: Token,
    pub its_ids: AuxSlice,
    pub identifier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItsIdentifier {
    pub its_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmmuInterrupt {
    pub interrupt: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmmuV1V2 {
    pub token: Token,
    pub base_address: u64,
    pub span: u64,
    pub model: u32,
    pub flags: SmmuV1V2Flags,
    pub global_interrupt: SmmuInterrupt,
    pub global_config_interrupt: SmmuInterrupt,
    pub context_interrupts: AuxSlice,
    pub pmu_interrupts: AuxSlice,
    pub id_mappings: AuxSlice,
    pub identifier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmmuV3 {
    pub token: Token,
    pub base_address: u64,
    pub flags: SmmuV3Flags,
    pub vatos_address: u64,
    pub model: u32,
    pub event_interrupt: u32,
    pub pri_interrupt: u32,
    pub gerr_interrupt: u32,
    pub sync_interrupt: u32,
    pub proximity_domain: u32,
    pub device_id_mapping_index: u32,
    pub id_mappings: AuxSlice,
    pub identifier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RootComplex {
    pub token: Token,
    pub cache_coherent: u32,
    pub allocation_hints: u8,
    pub memory_access_flags: MemoryAccessFlags,
    pub ats_attribute: u32,
    pub pci_segment_number: u32,
    pub memory_address_size: u8,
    pub id_mappings: AuxSlice,
    pub identifier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NamedComponent {
    pub token: Token,
    pub cache_coherent: u32,
    pub allocation_hints: u8,
    pub memory_access_flags: MemoryAccessFlags,
    pub address_size_limit: u8,
    pub object_name: String,
    pub id_mappings: AuxSlice,
    pub identifier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pmcg {
    pub token: Token,
    pub base_address: u64,
    pub page1_base_address: u64,
    pub overflow_interrupt: u32,
    pub reference: Token,
    pub id_mappings: AuxSlice,
    pub identifier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdMapping {
    pub input_base: u32,
    pub num_ids: u32,
    pub output_base: u32,
    pub output_reference: Token,
    pub flags: IdMappingFlags,
}

/// Typed access to one variant of [`Record`]
pub trait RecordKind: Sized + Default + Into<Record> {
    const KIND: ObjectKind;

    fn from_record(record: &Record) -> Option<&Self>;
    fn from_record_mut(record: &mut Record) -> Option<&mut Self>;

    /// Own token, null for kinds that only live in auxiliary arrays
    fn token(&self) -> Token {
        Token::NULL
    }

    fn set_token(&mut self, _token: Token) {}

    /// Every token-valued field that points at another record
    fn references(&self) -> Vec<Token> {
        Vec::new()
    }
}

macro_rules! records {
    ($($kind:ident),+ $(,)?) => {
        /// The closed set of record kinds
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum ObjectKind {
            $($kind,)+
        }

        impl ObjectKind {
            pub const ALL: &'static [ObjectKind] = &[$(ObjectKind::$kind,)+];
        }

        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Record {
            $($kind($kind),)+
        }

        impl Record {
            /// Zero-initialized record of `kind`
            pub fn zeroed(kind: ObjectKind) -> Self {
                match kind {
                    $(ObjectKind::$kind => Record::$kind(<$kind>::default()),)+
                }
            }

            pub fn kind(&self) -> ObjectKind {
                match self {
                    $(Record::$kind(_) => ObjectKind::$kind,)+
                }
            }

            pub fn token(&self) -> Token {
                match self {
                    $(Record::$kind(record) => record.token(),)+
                }
            }

            pub fn references(&self) -> Vec<Token> {
                match self {
                    $(Record::$kind(record) => record.references(),)+
                }
            }
        }

        $(
            impl From<$kind> for Record {
                fn from(record: $kind) -> Self {
                    Record::$kind(record)
                }
            }
        )+
    };
}

records! {
    CacheInfo,
    ProcessorCacheList,
    ObjectReference,
    ItsGroup,
    ItsIdentifier,
    SmmuV1V2,
    SmmuInterrupt,
    SmmuV3,
    RootComplex,
    NamedComponent,
    Pmcg,
    IdMapping,
}

macro_rules! record_kind {
    ($kind:ident $(, token: $token:ident)? $(, references: [$($reference:ident),*])?) => {
        impl RecordKind for $kind {
            const KIND: ObjectKind = ObjectKind::$kind;

            fn from_record(record: &Record) -> Option<&Self> {
                match record {
                    Record::$kind(record) => Some(record),
                    _ => None,
                }
            }

            fn from_record_mut(record: &mut Record) -> Option<&mut Self> {
                match record {
                    Record::$kind(record) => Some(record),
                    _ => None,
                }
            }

            $(
                fn token(&self) -> Token {
                    self.$token
                }

                fn set_token(&mut self, token: Token) {
                    self.$token = token;
                }
            )?

            $(
                fn references(&self) -> Vec<Token> {
                    vec![$(self.$reference),*]
                }
            )?
        }
    };
}

record_kind!(CacheInfo, token: token, references: [next_level]);
record_kind!(ProcessorCacheList, token: token);
record_kind!(ObjectReference, references: [reference]);
record_kind!(ItsGroup, token: token);
record_kind!(ItsIdentifier);
record_kind!(SmmuV1V2, token: token);
record_kind!(SmmuInterrupt);
record_kind!(SmmuV3, token: token);
record_kind!(RootComplex, token: token);
record_kind!(NamedComponent, token: token);
record_kind!(Pmcg, token: token, references: [reference]);
record_kind!(IdMapping, references: [output_reference]);
