// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};

use super::{
    handlers::CacheScratch,
    topology::{Location, Place},
};
use crate::{
    graph::{Graph, NodeId},
    Error,
};

impl Location {
    /// Combines two locations that feed the same cache
    ///
    /// [`Location::UNSET`] is the identity. A cluster disagreement widens the
    /// cluster and the core to [`Place::Shared`], a core disagreement only the
    /// core. Caches shared across sockets cannot be described.
    pub fn merge(self, other: Location) -> Result<Location, Error> {
        if self.is_unset() {
            return Ok(other);
        } else if other.is_unset() {
            return Ok(self);
        }

        if self.socket != other.socket {
            return Err(Error::Unsupported("cache shared between sockets"));
        }

        if self.cluster != other.cluster {
            return Ok(Location { socket: self.socket, cluster: Place::Shared, core: Place::Shared });
        }

        match self.core == other.core {
            true => Ok(self),
            false => Ok(Location { core: Place::Shared, ..self }),
        }
    }
}

/// Flows every CPU cache's location up its chain of `next_level` links
///
/// Locations are computed from the ingested values only and written back in a
/// single step at the end, so the result does not depend on the order leaves
/// are visited in. The last cache of every chain of at least one hop is pinned
/// to socket granularity.
pub(crate) fn propagate_locations(graph: &mut Graph<CacheScratch>) -> Result<(), Error> {
    let leaves: Vec<NodeId> = graph.nodes().filter(|(_, node)| node.scratch.is_leaf()).map(|(id, _)| id).collect();

    let mut merged: BTreeMap<NodeId, Location> = BTreeMap::new();
    let mut tops: BTreeSet<NodeId> = BTreeSet::new();

    for leaf in leaves {
        let location = graph[leaf].scratch.location;
        let mut visited = BTreeSet::from([leaf]);
        let mut last = None;
        let mut next = graph.find(graph[leaf].scratch.data.next_level, 1);

        while let Some(id) = next {
            if !visited.insert(id) {
                log::error!("next-level-cache chain starting at descriptor #{} loops", leaf.index());
                return Err(Error::Unsupported("cache hierarchy contains a cycle"));
            }

            let current = merged.get(&id).copied().unwrap_or(graph[id].scratch.location);
            merged.insert(id, current.merge(location)?);

            last = Some(id);
            next = graph.find(graph[id].scratch.data.next_level, 1);
        }

        tops.extend(last);
    }

    for id in tops {
        if let Some(location) = merged.get_mut(&id) {
            *location = location.socket_level();
        }
    }

    for (id, location) in merged {
        log::debug!("cache descriptor #{} located at {location:?}", id.index());
        graph[id].scratch.location = location;
    }

    Ok(())
}
