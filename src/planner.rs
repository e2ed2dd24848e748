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

//! The transfer planner.
//!
//! Given a target image and (optionally) a source image, enumerates one
//! transfer per target domain, orders them so reads happen before
//! overwrites, stashes around the orderings that cannot be satisfied, and
//! hands the sequence to the patch computer and the emitter.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::thread;

use anyhow::{bail, ensure, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;

use crate::cmdline::DiffConfig;
use crate::graph;
use crate::image::{load_block_map, DataImage, EmptyImage, Image, BLOCK_SIZE};
use crate::rangeset::RangeSet;
use crate::transfer::{StashId, Style, Transfer, TransferId};

/// Fraction of the cache each split diff piece may occupy. Larger pieces
/// align better and shrink the package; 1/8 measured best on real devices.
const SPLIT_THRESHOLD: f64 = 0.125;

/// The planner emitted an unsound sequence; always a bug, never an input
/// problem.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct BrokenPlan(pub(crate) String);

pub struct DiffOptions {
    pub version: u32,
    pub threads: Option<usize>,
    pub disable_imgdiff: bool,
    pub cache_size: Option<u64>,
    pub stash_threshold: f64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            version: 4,
            threads: None,
            disable_imgdiff: false,
            cache_size: None,
            stash_threshold: 0.8,
        }
    }
}

pub(crate) enum SourceImage<'a> {
    Borrowed(&'a dyn Image),
    Empty(EmptyImage),
}

impl SourceImage<'_> {
    pub(crate) fn get(&self) -> &dyn Image {
        match self {
            SourceImage::Borrowed(image) => *image,
            SourceImage::Empty(image) => image,
        }
    }
}

impl std::fmt::Debug for BlockImageDiff<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockImageDiff")
            .field("version", &self.version)
            .field("threads", &self.threads)
            .field("disable_imgdiff", &self.disable_imgdiff)
            .field("cache_size", &self.cache_size)
            .field("stash_threshold", &self.stash_threshold)
            .field("xfs", &self.xfs)
            .field("sequence", &self.sequence)
            .finish()
    }
}

pub struct BlockImageDiff<'a> {
    pub(crate) tgt: &'a dyn Image,
    pub(crate) src: SourceImage<'a>,
    pub(crate) version: u32,
    pub(crate) threads: usize,
    pub(crate) disable_imgdiff: bool,
    pub(crate) cache_size: Option<u64>,
    pub(crate) stash_threshold: f64,
    pub(crate) xfs: Vec<Transfer>,
    pub(crate) sequence: Vec<TransferId>,
    src_basenames: HashMap<String, String>,
    src_numpatterns: HashMap<String, String>,
    pub(crate) touched_src_ranges: RangeSet,
    pub(crate) touched_src_sha1: Option<String>,
    pub(crate) max_stashed_size: u64,
}

impl<'a> BlockImageDiff<'a> {
    pub fn new(
        tgt: &'a dyn Image,
        src: Option<&'a dyn Image>,
        options: DiffOptions,
    ) -> Result<Self> {
        ensure!(
            (1..=4).contains(&options.version),
            "unknown format version {}",
            options.version
        );
        let src = match src {
            Some(image) => SourceImage::Borrowed(image),
            None => SourceImage::Empty(EmptyImage::new()),
        };

        // the updater that installs the package always uses 4k blocks
        ensure!(tgt.block_size() == BLOCK_SIZE, "bad target block size");
        ensure!(src.get().block_size() == BLOCK_SIZE, "bad source block size");

        // the range sets in each file map must partition the care map
        assert_partition(
            src.get().care_map(),
            src.get().file_map().iter().map(|(_, rs)| rs),
        )
        .context("source file map")?;
        assert_partition(tgt.care_map(), tgt.file_map().iter().map(|(_, rs)| rs))
            .context("target file map")?;

        let threads = match options.threads {
            Some(n) if n > 0 => n,
            _ => (thread::available_parallelism().map_or(1, usize::from) / 2).max(1),
        };

        Ok(Self {
            tgt,
            src,
            version: options.version,
            threads,
            disable_imgdiff: options.disable_imgdiff,
            cache_size: options.cache_size,
            stash_threshold: options.stash_threshold,
            xfs: Vec::new(),
            sequence: Vec::new(),
            src_basenames: HashMap::new(),
            src_numpatterns: HashMap::new(),
            touched_src_ranges: RangeSet::new(),
            touched_src_sha1: None,
            max_stashed_size: 0,
        })
    }

    /// Peak stash usage of the last computed plan, in bytes.
    pub fn max_stashed_size(&self) -> u64 {
        self.max_stashed_size
    }

    /// Every source range the emitted plan reads, stashes or hashes.
    pub fn touched_src_ranges(&self) -> &RangeSet {
        &self.touched_src_ranges
    }

    /// SHA-1 over the touched source ranges, for format version 3 and up.
    pub fn touched_src_sha1(&self) -> Option<&str> {
        self.touched_src_sha1.as_deref()
    }

    /// Plans and writes `<prefix>.transfer.list`, `<prefix>.new.dat` and
    /// `<prefix>.patch.dat`.
    pub fn compute(&mut self, prefix: &Path) -> Result<crate::emit::DiffSummary> {
        self.abbreviate_source_names();
        self.find_transfers();

        graph::generate_digraph(&mut self.xfs);
        graph::find_vertex_sequence(&mut self.xfs, &mut self.sequence);
        if self.version == 1 {
            graph::remove_backward_edges(&mut self.xfs, &self.sequence);
        } else {
            graph::reverse_backward_edges(&mut self.xfs, &self.sequence);
            graph::improve_vertex_sequence(&mut self.xfs, &mut self.sequence);
        }

        if self.version >= 2 && self.cache_size.is_some() {
            self.revise_stash_size();
        }

        self.assert_sequence_good()?;

        self.compute_patches(prefix)?;
        self.write_transfers(prefix)
    }

    // When looking for a source domain to diff a target domain against, we
    // try an exact name match, then an exact basename match, then a basename
    // match with every run of digits replaced by "#" (so libfoo-2.so still
    // matches libfoo-1.so). No match means the data is shipped whole.
    fn abbreviate_source_names(&mut self) {
        for (name, _) in self.src.get().file_map() {
            let base = basename(name);
            self.src_basenames
                .insert(base.to_string(), name.to_string());
            self.src_numpatterns
                .insert(digit_pattern(base), name.to_string());
        }
    }

    fn find_transfers(&mut self) {
        let split = self.version >= 3;
        let tgt_map: Vec<(String, RangeSet)> = self.tgt.file_map().to_vec();
        let src_map: HashMap<String, RangeSet> = self
            .src
            .get()
            .file_map()
            .iter()
            .cloned()
            .collect();

        for (tgt_fn, tgt_ranges) in tgt_map {
            if tgt_fn == "__ZERO" {
                // blocks not in any file that are filled with zeros
                let src_ranges = src_map.get("__ZERO").cloned().unwrap_or_default();
                self.add_transfer(
                    tgt_fn.clone(),
                    Some("__ZERO".to_string()),
                    tgt_ranges,
                    src_ranges,
                    Style::Zero,
                    split,
                );
                continue;
            }

            if tgt_fn == "__COPY" {
                // blocks that must be copied to the target unconditionally
                self.add_transfer(tgt_fn, None, tgt_ranges, RangeSet::new(), Style::New, split);
                continue;
            }

            if let Some(src_ranges) = src_map.get(&tgt_fn) {
                let src_ranges = src_ranges.clone();
                self.add_transfer(
                    tgt_fn.clone(),
                    Some(tgt_fn),
                    tgt_ranges,
                    src_ranges,
                    Style::Diff,
                    split,
                );
                continue;
            }

            let base = basename(&tgt_fn).to_string();
            if let Some(src_fn) = self.src_basenames.get(&base).cloned() {
                let src_ranges = src_map[&src_fn].clone();
                self.add_transfer(
                    tgt_fn,
                    Some(src_fn),
                    tgt_ranges,
                    src_ranges,
                    Style::Diff,
                    split,
                );
                continue;
            }

            if let Some(src_fn) = self.src_numpatterns.get(&digit_pattern(&base)).cloned() {
                let src_ranges = src_map[&src_fn].clone();
                self.add_transfer(
                    tgt_fn,
                    Some(src_fn),
                    tgt_ranges,
                    src_ranges,
                    Style::Diff,
                    split,
                );
                continue;
            }

            self.add_transfer(tgt_fn, None, tgt_ranges, RangeSet::new(), Style::New, split);
        }
    }

    // Stashing makes updates resumable, but a file bigger than the cache can
    // never have its source stashed in full. Such diffs are cut into pieces
    // no larger than an eighth of the cache.
    fn add_transfer(
        &mut self,
        tgt_name: String,
        src_name: Option<String>,
        tgt_ranges: RangeSet,
        src_ranges: RangeSet,
        style: Style,
        split: bool,
    ) {
        if style != Style::Diff || !split {
            self.push_transfer(tgt_name, src_name, tgt_ranges, src_ranges, style);
            return;
        }
        let cache_size = match self.cache_size {
            Some(size) => size,
            None => {
                self.push_transfer(tgt_name, src_name, tgt_ranges, src_ranges, style);
                return;
            }
        };
        let limit = (cache_size as f64 * SPLIT_THRESHOLD / BLOCK_SIZE as f64) as u64;

        if tgt_ranges.size() <= limit && src_ranges.size() <= limit {
            self.push_transfer(tgt_name, src_name, tgt_ranges, src_ranges, style);
            return;
        }

        let src_name = src_name.expect("diff transfer without source name");
        let mut pieces = 0;
        let mut tgt_ranges = tgt_ranges;
        let mut src_ranges = src_ranges;
        while tgt_ranges.size() > limit && src_ranges.size() > limit {
            let tgt_first = tgt_ranges.first(limit);
            let src_first = src_ranges.first(limit);
            self.push_transfer(
                format!("{tgt_name}-{pieces}"),
                Some(format!("{src_name}-{pieces}")),
                tgt_first.clone(),
                src_first.clone(),
                style,
            );
            tgt_ranges = tgt_ranges.subtract(&tgt_first);
            src_ranges = src_ranges.subtract(&src_first);
            pieces += 1;
        }
        if !tgt_ranges.is_empty() || !src_ranges.is_empty() {
            assert!(!tgt_ranges.is_empty() && !src_ranges.is_empty());
            self.push_transfer(
                format!("{tgt_name}-{pieces}"),
                Some(format!("{src_name}-{pieces}")),
                tgt_ranges,
                src_ranges,
                style,
            );
        }
    }

    fn push_transfer(
        &mut self,
        tgt_name: String,
        src_name: Option<String>,
        tgt_ranges: RangeSet,
        src_ranges: RangeSet,
        style: Style,
    ) {
        let id = Transfer::push(&mut self.xfs, tgt_name, src_name, tgt_ranges, src_ranges, style);
        self.sequence.push(id);
    }

    // Walks the final sequence simulating cache occupancy, and downgrades to
    // "new" any transfer whose stash would not fit. The consumer of an
    // oversized explicit stash is downgraded (so the stash is never
    // written); a v3+ diff overlapping itself carries an implicit stash of
    // its whole source and is downgraded directly.
    fn revise_stash_size(&mut self) {
        eprintln!("Revising stash size...");

        let mut def_cmd: HashMap<StashId, TransferId> = HashMap::new();
        let mut use_cmd: HashMap<StashId, TransferId> = HashMap::new();
        for &id in &self.sequence {
            for (idx, _) in &self.xfs[id.index()].stash_before {
                def_cmd.insert(*idx, id);
            }
            for (idx, _) in &self.xfs[id.index()].use_stash {
                use_cmd.insert(*idx, id);
            }
        }

        let cache_size = self.cache_size.expect("revising without a cache size");
        let max_allowed = cache_size as f64 * self.stash_threshold / BLOCK_SIZE as f64;

        let mut stashed_blocks: i64 = 0;
        let mut new_blocks: u64 = 0;

        for &id in &self.sequence {
            let mut replaced: Vec<TransferId> = Vec::new();

            for (idx, sr) in self.xfs[id.index()].stash_before.clone() {
                if stashed_blocks as f64 + sr.size() as f64 > max_allowed {
                    // no room to hold this stash; ship the consumer whole
                    let user = use_cmd[&idx];
                    eprintln!(
                        "{:>10}  {:>9}  {}",
                        sr.size(),
                        "explicit",
                        self.xfs[user.index()]
                    );
                    replaced.push(user);
                } else {
                    stashed_blocks += sr.size() as i64;
                }
            }

            for (_, sr) in &self.xfs[id.index()].use_stash {
                stashed_blocks -= sr.size() as i64;
            }

            if self.xfs[id.index()].style == Style::Diff && self.version >= 3 {
                let xf = &self.xfs[id.index()];
                assert!(!xf.tgt_ranges.is_empty() && !xf.src_ranges.is_empty());
                if xf.src_ranges.overlaps(&xf.tgt_ranges)
                    && stashed_blocks as f64 + xf.src_ranges.size() as f64 > max_allowed
                {
                    eprintln!("{:>10}  {:>9}  {}", xf.src_ranges.size(), "implicit", xf);
                    replaced.push(id);
                }
            }

            for cmd in replaced {
                for (idx, sr) in self.xfs[cmd.index()].use_stash.clone() {
                    let def = def_cmd[&idx];
                    let stash_before = &mut self.xfs[def.index()].stash_before;
                    let pos = stash_before
                        .iter()
                        .position(|(i, r)| *i == idx && *r == sr)
                        .expect("stash definition disappeared");
                    stash_before.remove(pos);
                }
                new_blocks += self.xfs[cmd.index()].tgt_ranges.size();
                self.xfs[cmd.index()].convert_to_new();
            }
        }

        eprintln!(
            "  Total {} blocks ({} bytes) are packed as new blocks due to \
             insufficient cache size.",
            new_blocks,
            new_blocks * BLOCK_SIZE
        );
    }

    // Replays the sequence against a bitmap of written blocks: no transfer
    // may read a block after it was written (except through a stash), every
    // target block is written exactly once, and afterwards the whole care
    // map has been written.
    fn assert_sequence_good(&self) -> Result<()> {
        let total = self.tgt.total_blocks();
        let mut touched = vec![false; total as usize];

        for &id in &self.sequence {
            let xf = &self.xfs[id.index()];

            let mut reads = xf.src_ranges.clone();
            if self.version >= 2 {
                for (_, sr) in &xf.use_stash {
                    reads = reads.subtract(sr);
                }
            }
            // blocks only in a larger source image can never be overwritten
            for (s, e) in reads.iter() {
                for i in s..e.min(total) {
                    if touched[i as usize] {
                        return Err(BrokenPlan(format!(
                            "block {i} read after being written, in {xf}"
                        ))
                        .into());
                    }
                }
            }

            for i in xf.tgt_ranges.blocks() {
                if touched[i as usize] {
                    return Err(
                        BrokenPlan(format!("block {i} written twice, in {xf}")).into(),
                    );
                }
                touched[i as usize] = true;
            }
        }

        for i in self.tgt.care_map().blocks() {
            if !touched[i as usize] {
                return Err(BrokenPlan(format!("care-map block {i} never written")).into());
            }
        }
        Ok(())
    }
}

/// Checks that `parts` are pairwise disjoint and exactly cover `total`.
pub(crate) fn assert_partition<'r>(
    total: &RangeSet,
    parts: impl Iterator<Item = &'r RangeSet>,
) -> Result<()> {
    let mut so_far = RangeSet::new();
    for part in parts {
        ensure!(
            !so_far.overlaps(part),
            "domains overlap at {}",
            so_far.intersect(part)
        );
        so_far = so_far.union(part);
    }
    ensure!(
        &so_far == total,
        "domains cover {} but should cover {}",
        so_far,
        total
    );
    Ok(())
}

/// "pfx" -> "pfx.transfer.list" etc; the prefix is a path stem, not a
/// directory, so this is plain string append.
pub(crate) fn with_suffix(prefix: &Path, suffix: &str) -> std::path::PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(suffix);
    std::path::PathBuf::from(path)
}

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn digit_pattern(base: &str) -> String {
    lazy_static! {
        static ref DIGITS: Regex = Regex::new("[0-9]+").expect("compiling digit regex");
    }
    DIGITS.replace_all(base, "#").into_owned()
}

/// Entry point for the `diff` subcommand.
pub fn diff(config: &DiffConfig) -> Result<()> {
    let tgt_data = fs::read(&config.target)
        .with_context(|| format!("reading target image {}", config.target))?;
    let mut tgt = DataImage::new(tgt_data, config.trim, config.pad)
        .context("interpreting target image")?;
    if let Some(path) = &config.target_map {
        tgt.set_file_map(load_block_map(Path::new(path))?);
    }

    let src = match &config.source {
        Some(path) => {
            let src_data =
                fs::read(path).with_context(|| format!("reading source image {path}"))?;
            let mut src = DataImage::new(src_data, config.trim, config.pad)
                .context("interpreting source image")?;
            if let Some(path) = &config.source_map {
                src.set_file_map(load_block_map(Path::new(path))?);
            }
            Some(src)
        }
        None => {
            if config.source_map.is_some() {
                bail!("--source-map requires --source");
            }
            None
        }
    };

    let options = DiffOptions {
        version: config.format_version,
        threads: config.threads,
        disable_imgdiff: config.disable_imgdiff,
        cache_size: config.cache_size,
        stash_threshold: config.stash_threshold,
    };
    let mut differ = BlockImageDiff::new(
        &tgt,
        src.as_ref().map(|s| s as &dyn Image),
        options,
    )?;
    let summary = differ.compute(Path::new(&config.output))?;

    if let Some(path) = &config.stats {
        let f = File::create(path).with_context(|| format!("creating {path}"))?;
        serde_json::to_writer_pretty(f, &summary).context("writing stats")?;
    }
    Ok(())
}
