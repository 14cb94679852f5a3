// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::vec::Vec;

const MPIDR_AFF1_SHIFT: u64 = 8;
const MPIDR_AFF2_SHIFT: u64 = 16;
const MPIDR_AFF3_SHIFT: u64 = 32;
const MPIDR_AFFINITY_MASK: u64 = 0xff_00ff_ffff;

/// One coordinate of a cache's position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Place {
    /// No CPU cache has flowed into this cache yet
    #[default]
    Unset,
    /// Shared by more than one position at this granularity
    Shared,
    Index(u32),
}

impl Place {
    pub fn index(self) -> Option<u32> {
        match self {
            Place::Index(index) => Some(index),
            Place::Unset | Place::Shared => None,
        }
    }
}

/// Socket, cluster and core a cache belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Location {
    pub socket: Place,
    pub cluster: Place,
    pub core: Place,
}

impl Location {
    pub const UNSET: Self = Location { socket: Place::Unset, cluster: Place::Unset, core: Place::Unset };

    /// Location of a single core
    pub const fn core(socket: u32, cluster: u32, core: u32) -> Self {
        Location { socket: Place::Index(socket), cluster: Place::Index(cluster), core: Place::Index(core) }
    }

    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }

    /// The same socket with cluster and core shared
    pub fn socket_level(self) -> Self {
        Location { socket: self.socket, cluster: Place::Shared, core: Place::Shared }
    }
}

/// Highest socket, cluster and core index the platform can have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub max_socket: u32,
    pub max_cluster: u32,
    pub max_core: u32,
}

impl Geometry {
    pub fn contains(&self, location: &Location) -> bool {
        let within = |place: Place, max: u32| place.index().map_or(true, |index| index <= max);

        within(location.socket, self.max_socket)
            && within(location.cluster, self.max_cluster)
            && within(location.core, self.max_core)
    }
}

/// Platform Topology Provider
pub trait PlatformTopology {
    fn geometry(&self) -> Geometry;

    /// MPIDR of every enabled core
    fn enabled_cores(&self) -> &[u64];

    /// Position a core would occupy, whether or not it is enabled
    fn location_of(&self, mpidr: u64) -> Location;

    /// The bits of `mpidr` that identify a core in [`enabled_cores`]
    ///
    /// [`enabled_cores`]: PlatformTopology::enabled_cores
    fn core_id(&self, mpidr: u64) -> u64 {
        mpidr
    }

    /// Position of an enabled core, `None` for cores that are disabled or
    /// outside the platform geometry
    fn locate(&self, mpidr: u64) -> Option<Location> {
        if !self.enabled_cores().contains(&self.core_id(mpidr)) {
            return None;
        }

        Some(self.location_of(mpidr)).filter(|location| self.geometry().contains(location))
    }
}

/// Topology derived from MPIDR affinity fields: Aff3 is the socket, Aff2 the
/// cluster and Aff1 the core
#[derive(Debug, Clone, Default)]
pub struct AffinityTopology {
    geometry: Geometry,
    enabled: Vec<u64>,
}

impl AffinityTopology {
    pub fn new(geometry: Geometry) -> Self {
        Self { geometry, enabled: Vec::new() }
    }

    /// Topology whose geometry is the smallest that holds every given core
    pub fn from_enabled(mpidrs: impl IntoIterator<Item = u64>) -> Self {
        let mut topology = Self::default();
        for mpidr in mpidrs {
            topology = topology.enable(mpidr);
        }

        topology
    }

    /// Marks a core as enabled, growing the geometry to hold it
    pub fn enable(mut self, mpidr: u64) -> Self {
        let mpidr = self.core_id(mpidr);
        let location = self.location_of(mpidr);

        if let (Some(socket), Some(cluster), Some(core)) =
            (location.socket.index(), location.cluster.index(), location.core.index())
        {
            self.geometry.max_socket = self.geometry.max_socket.max(socket);
            self.geometry.max_cluster = self.geometry.max_cluster.max(cluster);
            self.geometry.max_core = self.geometry.max_core.max(core);
        }

        if !self.enabled.contains(&mpidr) {
            self.enabled.push(mpidr);
        }

        self
    }

    /// MPIDR of the core at `socket`, `cluster`, `core`
    pub const fn mpidr(socket: u32, cluster: u32, core: u32) -> u64 {
        ((socket as u64 & 0xff) << MPIDR_AFF3_SHIFT)
            | ((cluster as u64 & 0xff) << MPIDR_AFF2_SHIFT)
            | ((core as u64 & 0xff) << MPIDR_AFF1_SHIFT)
    }
}

impl PlatformTopology for AffinityTopology {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn enabled_cores(&self) -> &[u64] {
        &self.enabled
    }

    fn core_id(&self, mpidr: u64) -> u64 {
        mpidr & MPIDR_AFFINITY_MASK
    }

    fn location_of(&self, mpidr: u64) -> Location {
        let field = |shift: u64| ((mpidr >> shift) & 0xff) as u32;
        Location::core(field(MPIDR_AFF3_SHIFT), field(MPIDR_AFF2_SHIFT), field(MPIDR_AFF1_SHIFT))
    }
}
