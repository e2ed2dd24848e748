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

//! Ordering of transfers.
//!
//! A transfer that reads blocks another transfer writes must run first. The
//! resulting digraph is generally cyclic; we linearize it with the
//! Eades-Lin-Smyth feedback-arc heuristic, then either trim the sources of
//! the surviving backward edges (format version 1) or stash around them
//! (version 2 and up), and finally re-sort the now-acyclic graph to lower
//! peak stash occupancy.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};

use crate::transfer::{EdgeMap, Style, Transfer, TransferId};

/// For each pair of transfers where one writes blocks the other reads,
/// records that the reader goes first. The edge weight is the number of
/// source blocks at stake, except that blocks sourced from the `__ZERO`
/// domain cost nothing to re-derive if the edge is later broken.
pub fn generate_digraph(xfs: &mut [Transfer]) {
    eprintln!("Generating digraph...");

    // transfers reading each block, built in one pass over source ranges
    let mut source_users: Vec<Vec<TransferId>> = Vec::new();
    for xf in xfs.iter() {
        for (s, e) in xf.src_ranges.iter() {
            if e as usize > source_users.len() {
                source_users.resize(e as usize, Vec::new());
            }
            for i in s..e {
                source_users[i as usize].push(xf.id);
            }
        }
    }

    for a_idx in 0..xfs.len() {
        let a = TransferId(a_idx as u32);
        let tgt_ranges = xfs[a_idx].tgt_ranges.clone();
        let mut intersections: BTreeSet<TransferId> = BTreeSet::new();
        for (s, e) in tgt_ranges.iter() {
            for i in s..e.min(source_users.len() as u64) {
                intersections.extend(&source_users[i as usize]);
            }
        }

        for b in intersections {
            if b == a {
                continue;
            }
            // b reads blocks a writes, so b must go first
            let overlap = tgt_ranges.intersect(&xfs[b.index()].src_ranges);
            if overlap.is_empty() {
                continue;
            }
            let weight = if xfs[b.index()].src_name.as_deref() == Some("__ZERO") {
                0
            } else {
                overlap.size()
            };
            xfs[b.index()].goes_before.insert(a, weight);
            xfs[a_idx].goes_after.insert(b, weight);
        }
    }
}

/// Linearizes the digraph, minimizing (heuristically) the total weight of
/// edges that end up pointing backward. Based on "A Fast & Effective
/// Heuristic for the Feedback Arc Set Problem" by Eades, Lin and Smyth:
/// sinks accumulate on the right, sources on the left, and when neither
/// exists the vertex with the best out-minus-in weight balance is forced
/// into the left side. Writes `order` onto every transfer and rewrites
/// `sequence`.
pub fn find_vertex_sequence(xfs: &mut [Transfer], sequence: &mut Vec<TransferId>) {
    eprintln!("Finding vertex sequence...");

    let n = xfs.len();
    let mut incoming: Vec<EdgeMap> = xfs.iter().map(|xf| xf.goes_after.clone()).collect();
    let mut outgoing: Vec<EdgeMap> = xfs.iter().map(|xf| xf.goes_before.clone()).collect();
    let mut score: Vec<i64> = (0..n)
        .map(|i| outgoing[i].total_weight() as i64 - incoming[i].total_weight() as i64)
        .collect();
    let mut in_graph = vec![true; n];
    let mut remaining = n;

    // The heap needs decrease-key; instead, every score change pushes a
    // fresh entry stamped with a generation counter, and pops discard
    // entries whose stamp is stale. Ties go to the earliest-created
    // transfer.
    let mut generation = vec![0u64; n];
    let mut heap: BinaryHeap<(i64, Reverse<u32>, u64)> = (0..n)
        .map(|i| (score[i], Reverse(i as u32), 0))
        .collect();

    let mut sinks: BTreeSet<TransferId> = (0..n)
        .filter(|&i| outgoing[i].is_empty())
        .map(|i| TransferId(i as u32))
        .collect();
    let mut sources: BTreeSet<TransferId> = (0..n)
        .filter(|&i| incoming[i].is_empty())
        .map(|i| TransferId(i as u32))
        .collect();

    let mut s1: Vec<TransferId> = Vec::new();
    let mut s2: VecDeque<TransferId> = VecDeque::new();

    macro_rules! adjust_score {
        ($id:expr, $delta:expr) => {{
            let i = $id.index();
            score[i] += $delta;
            generation[i] += 1;
            heap.push((score[i], Reverse($id.0), generation[i]));
        }};
    }

    while remaining > 0 {
        // drain sinks onto the right end of the sequence
        while !sinks.is_empty() {
            let mut new_sinks = BTreeSet::new();
            for u in std::mem::take(&mut sinks) {
                if !in_graph[u.index()] {
                    continue;
                }
                s2.push_front(u);
                in_graph[u.index()] = false;
                remaining -= 1;
                for iu in incoming[u.index()].keys().collect::<Vec<_>>() {
                    let w = outgoing[iu.index()].remove(u).unwrap();
                    adjust_score!(iu, -(w as i64));
                    if outgoing[iu.index()].is_empty() {
                        new_sinks.insert(iu);
                    }
                }
            }
            sinks = new_sinks;
        }

        // drain sources onto the left end
        while !sources.is_empty() {
            let mut new_sources = BTreeSet::new();
            for u in std::mem::take(&mut sources) {
                if !in_graph[u.index()] {
                    continue;
                }
                s1.push(u);
                in_graph[u.index()] = false;
                remaining -= 1;
                for iu in outgoing[u.index()].keys().collect::<Vec<_>>() {
                    let w = incoming[iu.index()].remove(u).unwrap();
                    adjust_score!(iu, w as i64);
                    if incoming[iu.index()].is_empty() {
                        new_sources.insert(iu);
                    }
                }
            }
            sources = new_sources;
        }

        if remaining == 0 {
            break;
        }

        // neither; force out the best-scoring vertex
        let u = loop {
            let (sc, Reverse(id), stamp) = heap.pop().expect("scoring heap drained early");
            let i = id as usize;
            if in_graph[i] && generation[i] == stamp {
                debug_assert_eq!(score[i], sc);
                break TransferId(id);
            }
        };
        s1.push(u);
        in_graph[u.index()] = false;
        remaining -= 1;
        for iu in outgoing[u.index()].keys().collect::<Vec<_>>() {
            let w = incoming[iu.index()].remove(u).unwrap();
            adjust_score!(iu, w as i64);
            if incoming[iu.index()].is_empty() {
                sources.insert(iu);
            }
        }
        for iu in incoming[u.index()].keys().collect::<Vec<_>>() {
            let w = outgoing[iu.index()].remove(u).unwrap();
            adjust_score!(iu, -(w as i64));
            if outgoing[iu.index()].is_empty() {
                sinks.insert(iu);
            }
        }
    }

    sequence.clear();
    sequence.extend(s1);
    sequence.extend(s2);
    for (order, id) in sequence.iter().enumerate() {
        xfs[id.index()].order = order;
    }
}

/// Format version 1 cannot stash, so a violated dependency costs its source
/// blocks: they are trimmed out of the reading transfer, which re-fetches
/// them as new data instead.
pub fn remove_backward_edges(xfs: &mut [Transfer], sequence: &[TransferId]) {
    eprintln!("Removing backward edges...");
    let mut in_order = 0u64;
    let mut out_of_order = 0u64;
    let mut lost_source = 0u64;

    for &xf_id in sequence {
        let size = xfs[xf_id.index()].src_ranges.size();
        for u in xfs[xf_id.index()].goes_before.keys().collect::<Vec<_>>() {
            if xfs[xf_id.index()].order < xfs[u.index()].order {
                in_order += 1;
            } else {
                out_of_order += 1;
                let u_tgt = xfs[u.index()].tgt_ranges.clone();
                let xf = &mut xfs[xf_id.index()];
                assert!(xf.src_ranges.overlaps(&u_tgt));
                xf.src_ranges = xf.src_ranges.subtract(&u_tgt);
                xf.intact = false;
            }
        }
        let xf = &mut xfs[xf_id.index()];
        if xf.style == Style::Diff && xf.src_ranges.is_empty() {
            // nothing left to diff from; treat as new data
            xf.style = Style::New;
        }
        lost_source += size - xf.src_ranges.size();
    }

    eprintln!(
        "  {}/{} dependencies ({:.2}%) were violated; {} source blocks removed.",
        out_of_order,
        in_order + out_of_order,
        percent(out_of_order, in_order + out_of_order),
        lost_source
    );
}

/// Version 2 and up resolve a violated dependency by stashing: the writer
/// snapshots the contested blocks into the cache before running, the reader
/// picks them up from there, and the edge flips direction. Returns the
/// number of stashes created.
pub fn reverse_backward_edges(xfs: &mut [Transfer], sequence: &[TransferId]) -> usize {
    eprintln!("Reversing backward edges...");
    let mut in_order = 0u64;
    let mut out_of_order = 0u64;
    let mut stashes: usize = 0;
    let mut stash_size = 0u64;

    for &xf_id in sequence {
        for u in xfs[xf_id.index()].goes_before.keys().collect::<Vec<_>>() {
            if xfs[xf_id.index()].order < xfs[u.index()].order {
                in_order += 1;
                continue;
            }
            out_of_order += 1;

            let overlap = xfs[xf_id.index()]
                .src_ranges
                .intersect(&xfs[u.index()].tgt_ranges);
            assert!(!overlap.is_empty());

            xfs[u.index()].stash_before.push((stashes, overlap.clone()));
            xfs[xf_id.index()].use_stash.push((stashes, overlap.clone()));
            stashes += 1;
            stash_size += overlap.size();

            // reverse the edge direction; now xf must go after u
            xfs[xf_id.index()].goes_before.remove(u);
            xfs[u.index()].goes_after.remove(xf_id);
            xfs[xf_id.index()].goes_after.insert(u, 0);
            xfs[u.index()].goes_before.insert(xf_id, 0);
        }
    }

    eprintln!(
        "  {}/{} dependencies ({:.2}%) were violated; {} source blocks stashed.",
        out_of_order,
        in_order + out_of_order,
        percent(out_of_order, in_order + out_of_order),
        stash_size
    );
    stashes
}

/// The digraph is a DAG after edge reversal; a greedy topological sort that
/// always picks the source with the smallest net stash growth (ties broken
/// by the existing order) lowers peak cache occupancy.
pub fn improve_vertex_sequence(xfs: &mut [Transfer], sequence: &mut Vec<TransferId>) {
    eprintln!("Improving vertex order...");

    let n = xfs.len();
    let mut incoming: Vec<EdgeMap> = xfs.iter().map(|xf| xf.goes_after.clone()).collect();
    let outgoing: Vec<EdgeMap> = xfs.iter().map(|xf| xf.goes_before.clone()).collect();

    let mut heap: BinaryHeap<Reverse<(i64, usize, u32)>> = (0..n)
        .filter(|&i| incoming[i].is_empty())
        .map(|i| Reverse((xfs[i].net_stash_change(), xfs[i].order, i as u32)))
        .collect();

    let mut new_order: Vec<TransferId> = Vec::with_capacity(n);
    while let Some(Reverse((_, _, id))) = heap.pop() {
        let u = TransferId(id);
        new_order.push(u);
        for v in outgoing[u.index()].keys() {
            incoming[v.index()].remove(u);
            if incoming[v.index()].is_empty() {
                heap.push(Reverse((
                    xfs[v.index()].net_stash_change(),
                    xfs[v.index()].order,
                    v.0,
                )));
            }
        }
    }

    // if this fails the graph still had a cycle
    assert_eq!(new_order.len(), n);

    *sequence = new_order;
    for (order, id) in sequence.iter().enumerate() {
        xfs[id.index()].order = order;
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}
