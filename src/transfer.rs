// Copyright 2024 The blockimgdiff Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Planned units of work.
//!
//! Transfers live in a contiguous arena owned by the planner and refer to
//! each other by index, so the cyclic dependency graph never forms ownership
//! cycles. Edge maps preserve insertion order to keep output reproducible.

use std::collections::HashSet;
use std::fmt;

use crate::rangeset::RangeSet;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TransferId(pub u32);

impl TransferId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub type StashId = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Style {
    Zero,
    New,
    Diff,
    Move,
    Bsdiff,
    Imgdiff,
}

impl Style {
    pub fn name(self) -> &'static str {
        match self {
            Style::Zero => "zero",
            Style::New => "new",
            Style::Diff => "diff",
            Style::Move => "move",
            Style::Bsdiff => "bsdiff",
            Style::Imgdiff => "imgdiff",
        }
    }
}

/// A map from transfer to edge weight that iterates in insertion order.
/// Re-inserting an existing key updates the weight in place.
#[derive(Clone, Default, Debug)]
pub struct EdgeMap {
    items: Vec<(TransferId, u64)>,
    present: HashSet<TransferId>,
}

impl EdgeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: TransferId, weight: u64) {
        if self.present.insert(id) {
            self.items.push((id, weight));
        } else {
            let slot = self.items.iter_mut().find(|(i, _)| *i == id).unwrap();
            slot.1 = weight;
        }
    }

    pub fn remove(&mut self, id: TransferId) -> Option<u64> {
        if !self.present.remove(&id) {
            return None;
        }
        let pos = self.items.iter().position(|(i, _)| *i == id).unwrap();
        Some(self.items.remove(pos).1)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.present.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = TransferId> + '_ {
        self.items.iter().map(|&(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TransferId, u64)> + '_ {
        self.items.iter().copied()
    }

    pub fn total_weight(&self) -> u64 {
        self.items.iter().map(|&(_, w)| w).sum()
    }
}

#[derive(Debug)]
pub struct Transfer {
    pub id: TransferId,
    pub tgt_name: String,
    pub src_name: Option<String>,
    pub tgt_ranges: RangeSet,
    pub src_ranges: RangeSet,
    pub style: Style,
    /// Both range sets were monotonic at creation and the source has not
    /// been trimmed since; required for imgdiff on zip-family files.
    pub intact: bool,
    /// Transfers that must read their source before this one writes.
    pub goes_before: EdgeMap,
    pub goes_after: EdgeMap,
    /// Blocks to snapshot into the cache before this transfer runs.
    pub stash_before: Vec<(StashId, RangeSet)>,
    /// Stashes this transfer reads from.
    pub use_stash: Vec<(StashId, RangeSet)>,
    /// Position in the final linearization.
    pub order: usize,
    pub patch_start: u64,
    pub patch_len: u64,
}

impl Transfer {
    /// Appends a new transfer to the arena and returns its id.
    pub fn push(
        arena: &mut Vec<Transfer>,
        tgt_name: impl Into<String>,
        src_name: Option<String>,
        tgt_ranges: RangeSet,
        src_ranges: RangeSet,
        style: Style,
    ) -> TransferId {
        let id = TransferId(arena.len() as u32);
        let intact = tgt_ranges.monotonic() && src_ranges.monotonic();
        arena.push(Transfer {
            id,
            tgt_name: tgt_name.into(),
            src_name,
            tgt_ranges,
            src_ranges,
            style,
            intact,
            goes_before: EdgeMap::new(),
            goes_after: EdgeMap::new(),
            stash_before: Vec::new(),
            use_stash: Vec::new(),
            order: usize::MAX,
            patch_start: 0,
            patch_len: 0,
        });
        id
    }

    /// Blocks this transfer adds to the stash minus the blocks it frees.
    pub fn net_stash_change(&self) -> i64 {
        let added: u64 = self.stash_before.iter().map(|(_, sr)| sr.size()).sum();
        let freed: u64 = self.use_stash.iter().map(|(_, sr)| sr.size()).sum();
        added as i64 - freed as i64
    }

    /// Downgrades to a `new` transfer, dropping the source side entirely.
    pub fn convert_to_new(&mut self) {
        assert!(self.style != Style::New);
        self.use_stash.clear();
        self.style = Style::New;
        self.src_ranges = RangeSet::new();
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: <{} {} to {}>",
            self.id.0,
            self.src_ranges,
            self.style.name(),
            self.tgt_ranges
        )
    }
}
