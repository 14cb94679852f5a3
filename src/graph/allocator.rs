// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use alloc::vec::Vec;

use super::Graph;
use crate::{
    records::{AuxSlice, ObjectKind},
    repository::ObjectRepository,
    token::Token,
    Error, Record,
};

/// One kind's contiguous output array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArray {
    pub kind: ObjectKind,
    pub records: Vec<Record>,
    /// Parallel token array; auxiliary arrays have none
    pub tokens: Option<Vec<Token>>,
}

/// Output arrays of one run, in the order they will be handed over
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    arrays: Vec<OutputArray>,
}

fn zeroed(kind: ObjectKind, count: usize) -> Result<Vec<Record>, Error> {
    let mut records = Vec::new();
    records.try_reserve_exact(count).map_err(|_| Error::ResourceExhausted { what: "output records" })?;
    records.resize(count, Record::zeroed(kind));

    Ok(records)
}

impl SlotTable {
    /// Sizes one array per kind from the surviving descriptors, assigns every
    /// descriptor its slot and token, then lays out the auxiliary arrays
    ///
    /// Kinds without descriptors get no array. On error every array built so
    /// far is dropped with the partial table.
    pub(crate) fn allocate<S, R: ObjectRepository + ?Sized>(
        graph: &mut Graph<S>,
        kinds: &[ObjectKind],
        repository: &mut R,
    ) -> Result<Self, Error> {
        let mut table = SlotTable::default();

        for &kind in kinds {
            let members: Vec<usize> =
                graph.nodes.iter().enumerate().filter(|(_, node)| node.kind == kind).map(|(index, _)| index).collect();

            if members.is_empty() {
                log::debug!("no {kind:?} descriptors, skipping allocation");
                continue;
            }

            let records = zeroed(kind, members.len())?;
            let tokens = repository.allocate_tokens(members.len())?;
            if tokens.len() != members.len() || tokens.iter().any(|token| token.is_null()) {
                return Err(Error::Repository { kind, reason: "token batch is short or contains the null token" });
            }

            for (slot, &index) in members.iter().enumerate() {
                let node = &mut graph.nodes[index];
                node.slot = Some(slot);
                node.token = tokens[slot];
            }

            log::debug!("allocated {} {kind:?} record(s)", members.len());
            table.arrays.push(OutputArray { kind, records, tokens: Some(tokens) });
        }

        let mut totals: Vec<(ObjectKind, u32)> = Vec::new();
        for &kind in kinds {
            for node in graph.nodes.iter_mut().filter(|node| node.kind == kind) {
                for demand in node.demands.iter_mut() {
                    let position = match totals.iter().position(|(k, _)| *k == demand.kind) {
                        Some(position) => position,
                        None => {
                            totals.push((demand.kind, 0));
                            totals.len() - 1
                        }
                    };

                    let total = &mut totals[position].1;
                    demand.slice = AuxSlice { start: *total, count: demand.count };
                    *total = total
                        .checked_add(demand.count)
                        .ok_or(Error::ResourceExhausted { what: "auxiliary entries" })?;
                }
            }
        }

        for (kind, total) in totals {
            if total == 0 {
                log::debug!("no {kind:?} entries reserved, skipping allocation");
                continue;
            }

            log::debug!("allocated {total} {kind:?} auxiliary entries");
            table.arrays.push(OutputArray { kind, records: zeroed(kind, total as usize)?, tokens: None });
        }

        Ok(table)
    }

    pub fn arrays(&self) -> &[OutputArray] {
        &self.arrays
    }

    pub fn array(&self, kind: ObjectKind) -> Option<&OutputArray> {
        self.arrays.iter().find(|array| array.kind == kind)
    }

    pub fn record(&self, kind: ObjectKind, slot: usize) -> Option<&Record> {
        self.array(kind)?.records.get(slot)
    }

    pub(crate) fn record_mut(&mut self, kind: ObjectKind, slot: usize) -> Option<&mut Record> {
        self.arrays.iter_mut().find(|array| array.kind == kind)?.records.get_mut(slot)
    }

    /// Appends an array produced outside of the descriptor graph
    pub fn push(&mut self, array: OutputArray) -> Result<(), Error> {
        if self.array(array.kind).is_some() {
            return Err(Error::Repository { kind: array.kind, reason: "kind already has an output array" });
        }

        if array.records.is_empty() {
            return Ok(());
        }

        self.arrays.push(array);
        Ok(())
    }

    /// Record count per kind, in hand-over order
    pub fn counts(&self) -> Vec<(ObjectKind, usize)> {
        self.arrays.iter().map(|array| (array.kind, array.records.len())).collect()
    }

    /// Hands every array to `repository`, one call per kind
    ///
    /// The first refused batch stops the hand-over. Batches handed over before
    /// it stay with the repository, which then holds an incomplete table and
    /// has to be discarded by the caller.
    pub fn assemble<R: ObjectRepository + ?Sized>(self, repository: &mut R) -> Result<Vec<(ObjectKind, usize)>, Error> {
        let counts = self.counts();

        for array in self.arrays {
            repository.add_records(array.kind, &array.records, array.tokens.as_deref())?;
        }

        Ok(counts)
    }
}
