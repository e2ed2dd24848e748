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

//! Sets of half-open block ranges.
//!
//! A `RangeSet` is kept canonical: ranges are sorted by start, pairwise
//! disjoint, and never adjacent (touching ranges are merged). The `monotonic`
//! flag records whether the ranges were *supplied* in strictly increasing
//! order, which is lost by canonicalization but needed to decide whether the
//! blocks of a file can be concatenated in set order to reproduce the file.

use std::fmt;

use anyhow::{ensure, Context, Result};

#[derive(Clone, Debug, Default)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
    monotonic: bool,
}

impl PartialEq for RangeSet {
    // monotonic is derived bookkeeping, not part of the set's value
    fn eq(&self, other: &Self) -> bool {
        self.ranges == other.ranges
    }
}

impl Eq for RangeSet {}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a canonical set from `(start, end)` pairs given in domain
    /// order, which need not be block order. Records whether it was.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut flat: Vec<u64> = Vec::new();
        for (s, e) in pairs {
            assert!(s < e, "empty or inverted range [{s}, {e})");
            flat.push(s);
            flat.push(e);
        }
        let monotonic = is_increasing(&collapse_pairs(&flat));
        let mut ranges: Vec<(u64, u64)> = flat.chunks(2).map(|c| (c[0], c[1])).collect();
        ranges.sort_unstable();
        Self {
            ranges: merge_sorted(ranges),
            monotonic,
        }
    }

    /// Parses the human-readable form: whitespace-separated single blocks
    /// ("57") and inclusive ranges ("10-20").
    pub fn parse(text: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for token in text.split_whitespace() {
            let (s, e) = match token.split_once('-') {
                Some((a, b)) => {
                    let s: u64 = a.parse().with_context(|| format!("bad range {token:?}"))?;
                    let e: u64 = b.parse().with_context(|| format!("bad range {token:?}"))?;
                    ensure!(s <= e, "inverted range {token:?}");
                    (s, e + 1)
                }
                None => {
                    let s: u64 = token
                        .parse()
                        .with_context(|| format!("bad block number {token:?}"))?;
                    (s, s + 1)
                }
            };
            pairs.push((s, e));
        }
        Ok(Self::from_pairs(pairs))
    }

    /// Parses the raw form used in transfer lists and block-map files:
    /// "N,s0,e0,s1,e1,..." where N counts the following integers.
    pub fn parse_raw(text: &str) -> Result<Self> {
        let values = text
            .split(',')
            .map(|v| v.parse::<u64>().with_context(|| format!("bad value {v:?}")))
            .collect::<Result<Vec<u64>>>()?;
        ensure!(!values.is_empty(), "empty range set text");
        let count = values[0] as usize;
        ensure!(
            count == values.len() - 1 && count % 2 == 0,
            "malformed range set {text:?}"
        );
        Ok(Self::from_pairs(
            values[1..].chunks(2).map(|c| (c[0], c[1])),
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of blocks in the set.
    pub fn size(&self) -> u64 {
        self.ranges.iter().map(|&(s, e)| e - s).sum()
    }

    pub fn monotonic(&self) -> bool {
        self.monotonic
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }

    /// Iterates every block index in ascending order.
    pub fn blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|&(s, e)| s..e)
    }

    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len() + other.ranges.len());
        merged.extend_from_slice(&self.ranges);
        merged.extend_from_slice(&other.ranges);
        merged.sort_unstable();
        canonical(merge_sorted(merged))
    }

    pub fn intersect(&self, other: &RangeSet) -> RangeSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (s1, e1) = self.ranges[i];
            let (s2, e2) = other.ranges[j];
            let s = s1.max(s2);
            let e = e1.min(e2);
            if s < e {
                out.push((s, e));
            }
            if e1 <= e2 {
                i += 1;
            } else {
                j += 1;
            }
        }
        canonical(out)
    }

    /// Blocks of `self` not in `other`.
    pub fn subtract(&self, other: &RangeSet) -> RangeSet {
        let mut out = Vec::new();
        let mut j = 0;
        for &(s, e) in &self.ranges {
            let mut s = s;
            while j < other.ranges.len() && other.ranges[j].1 <= s {
                j += 1;
            }
            let mut k = j;
            while s < e {
                if k >= other.ranges.len() || other.ranges[k].0 >= e {
                    out.push((s, e));
                    break;
                }
                let (os, oe) = other.ranges[k];
                if os > s {
                    out.push((s, os));
                }
                s = s.max(oe);
                k += 1;
            }
        }
        canonical(out)
    }

    pub fn overlaps(&self, other: &RangeSet) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (s1, e1) = self.ranges[i];
            let (s2, e2) = other.ranges[j];
            if s1.max(s2) < e1.min(e2) {
                return true;
            }
            if e1 <= e2 {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    /// The first `n` blocks of the set, in ascending order (the whole set if
    /// it holds fewer than `n` blocks).
    pub fn first(&self, n: u64) -> RangeSet {
        let mut out = Vec::new();
        let mut left = n;
        for &(s, e) in &self.ranges {
            if left == 0 {
                break;
            }
            let take = left.min(e - s);
            out.push((s, s + take));
            left -= take;
        }
        canonical(out)
    }

    /// With `sub` a subset of `self`, returns the positions `sub` occupies
    /// within `self` flattened down to be contiguous starting at zero.
    pub fn map_within(&self, sub: &RangeSet) -> RangeSet {
        let mut out = Vec::new();
        let mut offset = 0;
        let mut parent = self.ranges.iter().copied();
        let mut cur = parent.next();
        for (s, e) in sub.iter() {
            loop {
                match cur {
                    Some((ps, pe)) if s >= ps && e <= pe => {
                        out.push((offset + s - ps, offset + e - ps));
                        break;
                    }
                    Some((ps, pe)) => {
                        assert!(s >= pe, "sub range [{s}, {e}) not within [{ps}, {pe})");
                        offset += pe - ps;
                        cur = parent.next();
                    }
                    None => panic!("sub range [{s}, {e}) outside parent"),
                }
            }
        }
        canonical(out)
    }

    /// "10-19 30" style: inclusive dash ranges, single blocks bare.
    pub fn to_string_pretty(&self) -> String {
        let mut parts = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            if e == s + 1 {
                parts.push(format!("{s}"));
            } else {
                parts.push(format!("{}-{}", s, e - 1));
            }
        }
        parts.join(" ")
    }

    /// The raw form emitted into transfer lists.
    pub fn to_string_raw(&self) -> String {
        assert!(!self.ranges.is_empty(), "raw form of empty range set");
        let mut out = format!("{}", self.ranges.len() * 2);
        for &(s, e) in &self.ranges {
            out.push_str(&format!(",{s},{e}"));
        }
        out
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_string_pretty())
    }
}

// Equal consecutive boundaries cancel: [0,5,5,10] describes the same blocks
// as [0,10]. Needed before the monotonicity check so touching input ranges
// still count as increasing.
fn collapse_pairs(flat: &[u64]) -> Vec<u64> {
    let mut out: Vec<u64> = Vec::with_capacity(flat.len());
    for &v in flat {
        if out.last() == Some(&v) {
            out.pop();
        } else {
            out.push(v);
        }
    }
    out
}

fn is_increasing(flat: &[u64]) -> bool {
    flat.windows(2).all(|w| w[0] < w[1])
}

fn merge_sorted(ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    let mut out: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (s, e) in ranges {
        match out.last_mut() {
            Some(last) if s <= last.1 => last.1 = last.1.max(e),
            _ => out.push((s, e)),
        }
    }
    out
}

// Results of set operations are already canonical, hence monotonic.
fn canonical(ranges: Vec<(u64, u64)>) -> RangeSet {
    RangeSet {
        ranges,
        monotonic: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(text: &str) -> RangeSet {
        RangeSet::parse(text).unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(rs("10-19").iter().collect::<Vec<_>>(), vec![(10, 20)]);
        assert_eq!(rs("57").iter().collect::<Vec<_>>(), vec![(57, 58)]);
        assert_eq!(
            rs("0-4 10-19 30").iter().collect::<Vec<_>>(),
            vec![(0, 5), (10, 20), (30, 31)]
        );
        // touching ranges merge
        assert_eq!(rs("0-4 5-9").iter().collect::<Vec<_>>(), vec![(0, 10)]);
        // order-insensitive value
        assert_eq!(rs("10-19 0-4"), rs("0-4 10-19"));
        assert!(RangeSet::parse("").unwrap().is_empty());
        RangeSet::parse("5-2").unwrap_err();
        RangeSet::parse("x").unwrap_err();
    }

    #[test]
    fn test_parse_raw() {
        assert_eq!(RangeSet::parse_raw("2,10,20").unwrap(), rs("10-19"));
        assert_eq!(
            RangeSet::parse_raw("4,0,5,10,12").unwrap(),
            rs("0-4 10-11")
        );
        RangeSet::parse_raw("3,10,20").unwrap_err();
        RangeSet::parse_raw("2,10").unwrap_err();
    }

    #[test]
    fn test_to_string() {
        assert_eq!(rs("0-4 10-19 30").to_string_pretty(), "0-4 10-19 30");
        assert_eq!(rs("0-4 10-19 30").to_string_raw(), "6,0,5,10,20,30,31");
        assert_eq!(
            RangeSet::parse_raw("6,0,5,10,20,30,31").unwrap(),
            rs("0-4 10-19 30")
        );
    }

    #[test]
    fn test_monotonic() {
        assert!(rs("0-4 10-19").monotonic());
        assert!(!rs("10-19 0-4").monotonic());
        // touching ranges supplied in order stay monotonic
        assert!(rs("0-4 5-9").monotonic());
        assert!(!rs("5-9 0-4").monotonic());
        assert!(RangeSet::from_pairs([(10, 20), (25, 30)]).monotonic());
        assert!(!RangeSet::from_pairs([(25, 30), (10, 20)]).monotonic());
        // operation results are canonical, hence monotonic
        assert!(rs("10-19 0-4").union(&rs("30")).monotonic());
    }

    #[test]
    fn test_union() {
        assert_eq!(rs("10-19 30").union(&rs("18-29")), rs("10-30"));
        assert_eq!(rs("10-19 30").union(&rs("22")), rs("10-19 22 30"));
        assert_eq!(rs("").union(&rs("10-19")), rs("10-19"));
        // laws
        let (a, b) = (rs("0-9 20-29"), rs("5-24"));
        assert_eq!(a.union(&b), b.union(&a));
        assert_eq!(a.union(&a), a);
    }

    #[test]
    fn test_intersect() {
        assert_eq!(rs("10-19 30").intersect(&rs("18-32")), rs("18-19 30"));
        assert_eq!(rs("10-19 30").intersect(&rs("22")), rs(""));
        let (a, b) = (rs("0-9 20-29"), rs("5-24"));
        assert_eq!(a.intersect(&b), b.intersect(&a));
        assert_eq!(a.intersect(&a), a);
        // inclusion-exclusion
        assert_eq!(
            a.union(&b).size(),
            a.size() + b.size() - a.intersect(&b).size()
        );
    }

    #[test]
    fn test_subtract() {
        assert_eq!(rs("10-19 30").subtract(&rs("18-32")), rs("10-17"));
        assert_eq!(rs("10-19 30").subtract(&rs("22")), rs("10-19 30"));
        assert_eq!(rs("0-9").subtract(&rs("3-5")), rs("0-2 6-9"));
        assert_eq!(rs("0-9").subtract(&rs("0-9")), rs(""));
        assert_eq!(rs("0-9").subtract(&rs("")), rs("0-9"));
    }

    #[test]
    fn test_overlaps() {
        assert!(rs("10-19 30").overlaps(&rs("18-32")));
        assert!(!rs("10-19 30").overlaps(&rs("20-29 31")));
        assert!(!rs("").overlaps(&rs("0-9")));
    }

    #[test]
    fn test_size() {
        assert_eq!(rs("10-19 30").size(), 11);
        assert_eq!(rs("").size(), 0);
    }

    #[test]
    fn test_first() {
        assert_eq!(rs("0-9").first(3), rs("0-2"));
        assert_eq!(rs("10-19 30").first(11), rs("10-19 30"));
        assert_eq!(rs("10-19 30").first(12), rs("10-19 30"));
        assert_eq!(rs("10-14 30-39").first(7), rs("10-14 30-31"));
        assert_eq!(rs("10-19").first(0), rs(""));
    }

    #[test]
    fn test_map_within() {
        assert_eq!(rs("0-9").map_within(&rs("3-4")), rs("3-4"));
        assert_eq!(rs("10-19").map_within(&rs("13-14")), rs("3-4"));
        assert_eq!(
            rs("10-19 30-39").map_within(&rs("17-19 30-32")),
            rs("7-12")
        );
        assert_eq!(
            rs("10-19 30-39").map_within(&rs("12-13 33-34")),
            rs("2-3 13-14")
        );
    }

    #[test]
    fn test_blocks() {
        assert_eq!(
            rs("0-2 5").blocks().collect::<Vec<_>>(),
            vec![0, 1, 2, 5]
        );
    }
}
