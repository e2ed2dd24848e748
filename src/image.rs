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

//! Read-only views over partition images.
//!
//! An image is a fixed number of 4 KiB blocks plus metadata: the care map
//! (blocks that contain data), a file map partitioning the care map into
//! named domains, clobbered blocks (whose installed contents may legitimately
//! differ, e.g. filesystem bookkeeping), and extended blocks (padding the
//! updater must zero).

use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use openssl::sha::Sha1;

use crate::rangeset::RangeSet;

/// The on-device updater always works in 4k blocks.
pub const BLOCK_SIZE: u64 = 4096;

pub trait Image {
    fn block_size(&self) -> u64 {
        BLOCK_SIZE
    }
    fn total_blocks(&self) -> u64;
    fn care_map(&self) -> &RangeSet;
    fn clobbered_blocks(&self) -> &RangeSet;
    fn extended(&self) -> &RangeSet;
    /// Domains in insertion order. Their union must equal the care map and
    /// they must be pairwise disjoint.
    fn file_map(&self) -> &[(String, RangeSet)];
    /// The data of the given blocks, in set order, as freely-sized chunks.
    fn read_range_set(&self, ranges: &RangeSet) -> Vec<Bytes>;
    /// Hex SHA-1 of the care-map data, normally excluding clobbered blocks.
    fn total_sha1(&self, include_clobbered_blocks: bool) -> String;
}

/// Hex SHA-1 of a chunk sequence.
pub fn sha1_hex(chunks: &[Bytes]) -> String {
    let mut ctx = Sha1::new();
    for chunk in chunks {
        ctx.update(chunk);
    }
    hex::encode(ctx.finish())
}

/// Hex SHA-1 of the given blocks of an image.
pub fn hash_blocks(image: &dyn Image, ranges: &RangeSet) -> String {
    sha1_hex(&image.read_range_set(ranges))
}

/// A zero-length image, used as the source when generating a full update.
#[derive(Default)]
pub struct EmptyImage {
    empty_set: RangeSet,
}

impl EmptyImage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Image for EmptyImage {
    fn total_blocks(&self) -> u64 {
        0
    }

    fn care_map(&self) -> &RangeSet {
        &self.empty_set
    }

    fn clobbered_blocks(&self) -> &RangeSet {
        &self.empty_set
    }

    fn extended(&self) -> &RangeSet {
        &self.empty_set
    }

    fn file_map(&self) -> &[(String, RangeSet)] {
        &[]
    }

    fn read_range_set(&self, ranges: &RangeSet) -> Vec<Bytes> {
        assert!(ranges.is_empty());
        Vec::new()
    }

    fn total_sha1(&self, _include_clobbered_blocks: bool) -> String {
        sha1_hex(&[])
    }
}

/// An image wrapped around an in-memory buffer.
#[derive(Debug)]
pub struct DataImage {
    data: Bytes,
    total_blocks: u64,
    care_map: RangeSet,
    clobbered_blocks: RangeSet,
    extended: RangeSet,
    file_map: Vec<(String, RangeSet)>,
}

impl DataImage {
    /// Wraps `data`, which must be a whole number of blocks unless `trim`
    /// (drop the partial trailing block) or `pad` (zero-fill it) is set.
    ///
    /// A padded final block is recorded as clobbered and placed in a
    /// `__COPY` domain so it is always rewritten: an incremental update
    /// might otherwise skip it as unchanged and then fail post-install
    /// verification on the nonzero padding bytes.
    pub fn new(mut data: Vec<u8>, trim: bool, pad: bool) -> Result<Self> {
        ensure!(!(trim && pad), "cannot both trim and pad");

        let bs = BLOCK_SIZE as usize;
        let partial = data.len() % bs;
        let mut padded = false;
        if partial > 0 {
            if trim {
                data.truncate(data.len() - partial);
            } else if pad {
                data.resize(data.len() + bs - partial, 0);
                padded = true;
            } else {
                bail!(
                    "image data must be a multiple of {} bytes unless trim or pad is requested",
                    bs
                );
            }
        }

        let total_blocks = (data.len() / bs) as u64;
        let care_map = if total_blocks > 0 {
            RangeSet::from_pairs([(0, total_blocks)])
        } else {
            RangeSet::new()
        };
        let clobbered_blocks = if padded {
            RangeSet::from_pairs([(total_blocks - 1, total_blocks)])
        } else {
            RangeSet::new()
        };

        let mut zero_blocks = Vec::new();
        let mut nonzero_blocks = Vec::new();
        let reference = vec![0u8; bs];
        let classified = if padded { total_blocks - 1 } else { total_blocks };
        for i in 0..classified {
            let d = &data[i as usize * bs..(i as usize + 1) * bs];
            if d == reference.as_slice() {
                zero_blocks.push((i, i + 1));
            } else {
                nonzero_blocks.push((i, i + 1));
            }
        }

        let mut file_map = Vec::new();
        if !zero_blocks.is_empty() {
            file_map.push(("__ZERO".to_string(), RangeSet::from_pairs(zero_blocks)));
        }
        if !nonzero_blocks.is_empty() {
            file_map.push(("__NONZERO".to_string(), RangeSet::from_pairs(nonzero_blocks)));
        }
        if !clobbered_blocks.is_empty() {
            file_map.push(("__COPY".to_string(), clobbered_blocks.clone()));
        }

        Ok(Self {
            data: Bytes::from(data),
            total_blocks,
            care_map,
            clobbered_blocks,
            extended: RangeSet::new(),
            file_map,
        })
    }

    /// Replaces the computed domains with a caller-supplied map, e.g. one
    /// loaded from a block-map file. The partition property is checked by
    /// the planner.
    pub fn set_file_map(&mut self, file_map: Vec<(String, RangeSet)>) {
        self.file_map = file_map;
    }

    pub fn set_extended(&mut self, extended: RangeSet) {
        self.extended = extended;
    }
}

impl Image for DataImage {
    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn care_map(&self) -> &RangeSet {
        &self.care_map
    }

    fn clobbered_blocks(&self) -> &RangeSet {
        &self.clobbered_blocks
    }

    fn extended(&self) -> &RangeSet {
        &self.extended
    }

    fn file_map(&self) -> &[(String, RangeSet)] {
        &self.file_map
    }

    fn read_range_set(&self, ranges: &RangeSet) -> Vec<Bytes> {
        let bs = BLOCK_SIZE as usize;
        ranges
            .iter()
            .map(|(s, e)| self.data.slice(s as usize * bs..e as usize * bs))
            .collect()
    }

    fn total_sha1(&self, include_clobbered_blocks: bool) -> String {
        if include_clobbered_blocks {
            sha1_hex(&[self.data.clone()])
        } else {
            let ranges = self.care_map.subtract(&self.clobbered_blocks);
            sha1_hex(&self.read_range_set(&ranges))
        }
    }
}

/// Loads a block-map file: one `<name> <range-set>` pair per line, in either
/// the raw ("4,0,5,10,12") or pretty ("0-4 10-11") form, comments and blank
/// lines skipped. Line order becomes domain order.
pub fn load_block_map(path: &Path) -> Result<Vec<(String, RangeSet)>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading block map {}", path.display()))?;
    let mut map: Vec<(String, RangeSet)> = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, ranges_text) = line
            .split_once(char::is_whitespace)
            .with_context(|| format!("{}:{}: missing range set", path.display(), lineno + 1))?;
        let ranges = if ranges_text.contains(',') {
            RangeSet::parse_raw(ranges_text.trim())
        } else {
            RangeSet::parse(ranges_text)
        }
        .with_context(|| format!("{}:{}: bad range set", path.display(), lineno + 1))?;
        ensure!(
            !ranges.is_empty(),
            "{}:{}: empty range set",
            path.display(),
            lineno + 1
        );
        ensure!(
            !map.iter().any(|(n, _)| n == name),
            "{}:{}: duplicate domain {:?}",
            path.display(),
            lineno + 1,
            name
        );
        map.push((name.to_string(), ranges));
    }
    Ok(map)
}
