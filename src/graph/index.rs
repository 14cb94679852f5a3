// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::{collections::BTreeMap, vec::Vec};

use super::NodeId;
use crate::description::Handle;

/// Maps a handle to every descriptor carrying it, in ingestion order
#[derive(Debug, Clone, Default)]
pub struct HandleIndex {
    entries: BTreeMap<Handle, Vec<NodeId>>,
}

impl HandleIndex {
    pub(crate) fn insert(&mut self, handle: Handle, node: NodeId) {
        if handle.is_valid() {
            self.entries.entry(handle).or_default().push(node);
        }
    }

    /// The `instance`-th descriptor (1-based) carrying `handle`
    pub fn find(&self, handle: Handle, instance: u32) -> Option<NodeId> {
        if !handle.is_valid() || instance == 0 {
            return None;
        }

        self.entries.get(&handle)?.get(instance as usize - 1).copied()
    }

    /// How many descriptors carry `handle`
    pub fn instances(&self, handle: Handle) -> usize {
        self.entries.get(&handle).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_are_one_based_in_insertion_order() {
        let mut index = HandleIndex::default();
        index.insert(Handle::new(5), NodeId(3));
        index.insert(Handle::new(7), NodeId(4));
        index.insert(Handle::new(5), NodeId(9));

        assert_eq!(index.find(Handle::new(5), 1), Some(NodeId(3)));
        assert_eq!(index.find(Handle::new(5), 2), Some(NodeId(9)));
        assert_eq!(index.find(Handle::new(5), 3), None);
        assert_eq!(index.find(Handle::new(5), 0), None);
        assert_eq!(index.instances(Handle::new(5)), 2);
    }

    #[test]
    fn invalid_handle_never_matches() {
        let mut index = HandleIndex::default();
        index.insert(Handle::INVALID, NodeId(0));

        assert_eq!(index.find(Handle::INVALID, 1), None);
        assert_eq!(index.instances(Handle::INVALID), 0);
    }
}
