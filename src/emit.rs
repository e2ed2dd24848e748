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

//! Writing the transfer list.
//!
//! Turns the planned sequence into the line-oriented command stream the
//! on-device updater executes, tracking cache occupancy as it goes: stash
//! slots are integers in version 2 (freed immediately after their single
//! use) and content hashes with reference counts in version 3 and up. The
//! stream is book-ended by erase commands for the don't-care blocks, with
//! the ones not feeding any transfer erased up front so the flash never
//! starves for clean blocks mid-update.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::image::{hash_blocks, BLOCK_SIZE};
use crate::planner::{assert_partition, with_suffix, BlockImageDiff, BrokenPlan};
use crate::rangeset::RangeSet;
use crate::transfer::{StashId, Style};

/// One zero command covers at most this many blocks, to bound the target
/// size of a single command and sidestep fsync trouble on some devices.
const ZERO_BLOCKS_LIMIT: u64 = 1024;

/// Machine-readable outcome of a run, for build pipelines that would
/// otherwise scrape stderr.
#[derive(Debug, Serialize)]
pub struct DiffSummary {
    pub version: u32,
    pub total_blocks_written: u64,
    pub stash_slots: usize,
    pub max_stashed_blocks: u64,
    pub max_stashed_bytes: u64,
    pub stash_limit_bytes: Option<u64>,
    /// SHA-1 of every source range this update reads, stashes or hashes;
    /// computed for format version 3 and up.
    pub touched_src_sha1: Option<String>,
    pub transfers: BTreeMap<String, usize>,
}

fn write_zero_chunked(out: &mut Vec<String>, to_zero: &RangeSet) -> u64 {
    let mut to_zero = to_zero.clone();
    let mut total = 0;
    while to_zero.size() > 0 {
        let chunk = to_zero.first(ZERO_BLOCKS_LIMIT);
        out.push(format!("zero {}\n", chunk.to_string_raw()));
        total += chunk.size();
        to_zero = to_zero.subtract(&chunk);
    }
    total
}

impl BlockImageDiff<'_> {
    pub(crate) fn write_transfers(&mut self, prefix: &Path) -> Result<DiffSummary> {
        let mut out: Vec<String> = Vec::new();
        let mut total: u64 = 0;

        let src_image = self.src.get();
        let tgt_image = self.tgt;

        // per-range source hashes are cached; stash and use sites hash the
        // same ranges and SHA-1 over megabytes is not free
        let mut hash_cache: HashMap<Vec<(u64, u64)>, String> = HashMap::new();
        let mut hash_src = |ranges: &RangeSet| -> String {
            hash_cache
                .entry(ranges.iter().collect())
                .or_insert_with(|| hash_blocks(src_image, ranges))
                .clone()
        };

        // v2 keys stash commands by slot id; v3+ by content hash with a
        // reference count so identical ranges are stashed once
        let mut stash_slots: HashMap<StashId, usize> = HashMap::new();
        let mut stash_refs: HashMap<String, u32> = HashMap::new();
        let mut stashed_blocks: u64 = 0;
        let mut max_stashed_blocks: u64 = 0;
        let mut free_stash_ids: BinaryHeap<Reverse<usize>> = BinaryHeap::new();
        let mut next_stash_id: usize = 0;

        for &id in &self.sequence {
            let xf = &self.xfs[id.index()];

            if self.version < 2 {
                assert!(xf.stash_before.is_empty());
                assert!(xf.use_stash.is_empty());
            }

            for (idx, sr) in &xf.stash_before {
                let sid = match free_stash_ids.pop() {
                    Some(Reverse(sid)) => sid,
                    None => {
                        let sid = next_stash_id;
                        next_stash_id += 1;
                        sid
                    }
                };
                assert!(!stash_slots.contains_key(idx));
                stash_slots.insert(*idx, sid);
                if self.version == 2 {
                    stashed_blocks += sr.size();
                    out.push(format!("stash {} {}\n", sid, sr.to_string_raw()));
                } else {
                    let sh = hash_src(sr);
                    if let Some(refs) = stash_refs.get_mut(&sh) {
                        *refs += 1;
                    } else {
                        stash_refs.insert(sh.clone(), 1);
                        stashed_blocks += sr.size();
                        self.touched_src_ranges = self.touched_src_ranges.union(sr);
                        out.push(format!("stash {} {}\n", sh, sr.to_string_raw()));
                    }
                }
            }

            max_stashed_blocks = max_stashed_blocks.max(stashed_blocks);

            let mut free_string: Vec<String> = Vec::new();
            let mut free_size: u64 = 0;

            let src_str = if self.version == 1 {
                if xf.src_ranges.is_empty() {
                    String::new()
                } else {
                    xf.src_ranges.to_string_raw()
                }
            } else {
                //   <# blocks> <src ranges>
                //     OR
                //   <# blocks> <src ranges> <src locs> <stash refs...>
                //     OR
                //   <# blocks> - <stash refs...>
                let size = xf.src_ranges.size();
                let mut parts: Vec<String> = vec![size.to_string()];
                let mut unstashed = xf.src_ranges.clone();
                let mut mapped_stashes: Vec<RangeSet> = Vec::new();

                for (idx, sr) in &xf.use_stash {
                    let sid = stash_slots.remove(idx).expect("use of undefined stash");
                    unstashed = unstashed.subtract(sr);
                    let mapped = xf.src_ranges.map_within(sr);
                    if self.version == 2 {
                        parts.push(format!("{}:{}", sid, mapped.to_string_raw()));
                        // a stash is used exactly once; freeing it right
                        // after the use keeps it from occupying cache space
                        // for the rest of the update
                        free_string.push(format!("free {sid}\n"));
                        free_size += mapped.size();
                    } else {
                        let sh = hash_src(sr);
                        parts.push(format!("{}:{}", sh, mapped.to_string_raw()));
                        let refs = stash_refs.get_mut(&sh).expect("free of unknown stash");
                        *refs -= 1;
                        if *refs == 0 {
                            free_size += mapped.size();
                            free_string.push(format!("free {sh}\n"));
                            stash_refs.remove(&sh);
                        }
                    }
                    mapped_stashes.push(mapped);
                    free_stash_ids.push(Reverse(sid));
                }

                let whole = if size == 0 {
                    RangeSet::new()
                } else {
                    RangeSet::from_pairs([(0, size)])
                };
                if !unstashed.is_empty() {
                    parts.insert(1, unstashed.to_string_raw());
                    if !xf.use_stash.is_empty() {
                        let mapped_unstashed = xf.src_ranges.map_within(&unstashed);
                        parts.insert(2, mapped_unstashed.to_string_raw());
                        mapped_stashes.push(mapped_unstashed);
                        assert_partition(&whole, mapped_stashes.iter())?;
                    }
                } else {
                    parts.insert(1, "-".to_string());
                    assert_partition(&whole, mapped_stashes.iter())?;
                }

                parts.join(" ")
            };

            let tgt_size = xf.tgt_ranges.size();

            match xf.style {
                Style::New => {
                    assert!(!xf.tgt_ranges.is_empty());
                    out.push(format!("new {}\n", xf.tgt_ranges.to_string_raw()));
                    total += tgt_size;
                }
                Style::Move => {
                    assert!(!xf.tgt_ranges.is_empty());
                    assert_eq!(xf.src_ranges.size(), tgt_size);
                    // blocks already in place need no command at all
                    if xf.src_ranges != xf.tgt_ranges {
                        match self.version {
                            1 => out.push(format!(
                                "move {} {}\n",
                                xf.src_ranges.to_string_raw(),
                                xf.tgt_ranges.to_string_raw()
                            )),
                            2 => out.push(format!(
                                "move {} {}\n",
                                xf.tgt_ranges.to_string_raw(),
                                src_str
                            )),
                            _ => {
                                // moving over oneself stashes the whole
                                // source implicitly
                                if xf.src_ranges.overlaps(&xf.tgt_ranges) {
                                    max_stashed_blocks = max_stashed_blocks
                                        .max(stashed_blocks + xf.src_ranges.size());
                                }
                                self.touched_src_ranges =
                                    self.touched_src_ranges.union(&xf.src_ranges);
                                out.push(format!(
                                    "move {} {} {}\n",
                                    hash_blocks(tgt_image, &xf.tgt_ranges),
                                    xf.tgt_ranges.to_string_raw(),
                                    src_str
                                ));
                            }
                        }
                        total += tgt_size;
                    }
                }
                Style::Bsdiff | Style::Imgdiff => {
                    assert!(!xf.tgt_ranges.is_empty());
                    assert!(!xf.src_ranges.is_empty());
                    match self.version {
                        1 => out.push(format!(
                            "{} {} {} {} {}\n",
                            xf.style.name(),
                            xf.patch_start,
                            xf.patch_len,
                            xf.src_ranges.to_string_raw(),
                            xf.tgt_ranges.to_string_raw()
                        )),
                        2 => out.push(format!(
                            "{} {} {} {} {}\n",
                            xf.style.name(),
                            xf.patch_start,
                            xf.patch_len,
                            xf.tgt_ranges.to_string_raw(),
                            src_str
                        )),
                        _ => {
                            if xf.src_ranges.overlaps(&xf.tgt_ranges) {
                                max_stashed_blocks = max_stashed_blocks
                                    .max(stashed_blocks + xf.src_ranges.size());
                            }
                            self.touched_src_ranges =
                                self.touched_src_ranges.union(&xf.src_ranges);
                            out.push(format!(
                                "{} {} {} {} {} {} {}\n",
                                xf.style.name(),
                                xf.patch_start,
                                xf.patch_len,
                                hash_src(&xf.src_ranges),
                                hash_blocks(tgt_image, &xf.tgt_ranges),
                                xf.tgt_ranges.to_string_raw(),
                                src_str
                            ));
                        }
                    }
                    total += tgt_size;
                }
                Style::Zero => {
                    assert!(!xf.tgt_ranges.is_empty());
                    // blocks that are already zero in the source stay put
                    let to_zero = xf.tgt_ranges.subtract(&xf.src_ranges);
                    total += write_zero_chunked(&mut out, &to_zero);
                }
                style => bail!("unknown transfer style '{}'", style.name()),
            }

            if !free_string.is_empty() {
                out.extend(free_string);
                stashed_blocks -= free_size;
            }

            if self.version >= 2 {
                if let Some(cache_size) = self.cache_size {
                    let max_allowed = cache_size as f64 * self.stash_threshold;
                    if (max_stashed_blocks * BLOCK_SIZE) as f64 >= max_allowed {
                        return Err(BrokenPlan(format!(
                            "stash size {} ({} * {}) exceeds the limit {} ({} * {:.2})",
                            max_stashed_blocks * BLOCK_SIZE,
                            max_stashed_blocks,
                            BLOCK_SIZE,
                            max_allowed as u64,
                            cache_size,
                            self.stash_threshold
                        ))
                        .into());
                    }
                }
            }
        }

        if self.version >= 3 {
            self.touched_src_sha1 = Some(hash_src(&self.touched_src_ranges));
        }

        // padding past the filesystem must read back as zeros after the
        // update, so it is zeroed explicitly at the end
        if self.tgt.extended().size() > 0 {
            total += write_zero_chunked(&mut out, self.tgt.extended());
        }

        // Erase all blocks that carry no data in the new image. The ones
        // this update never reads can go early, which keeps the flash
        // supplied with clean blocks; the rest wait until the end.
        let total_blocks = self.tgt.total_blocks();
        let all_tgt = if total_blocks > 0 {
            RangeSet::from_pairs([(0, total_blocks)])
        } else {
            RangeSet::new()
        };
        let new_dontcare = all_tgt
            .subtract(self.tgt.extended())
            .subtract(self.tgt.care_map());

        let erase_first = new_dontcare.subtract(&self.touched_src_ranges);
        if erase_first.size() > 0 {
            out.insert(0, format!("erase {}\n", erase_first.to_string_raw()));
        }
        let erase_last = new_dontcare.subtract(&erase_first);
        if erase_last.size() > 0 {
            out.push(format!("erase {}\n", erase_last.to_string_raw()));
        }

        let mut header: Vec<String> = vec![format!("{}\n", self.version), format!("{total}\n")];
        if self.version >= 2 {
            // stash slot count, then the peak stash size in blocks
            header.push(format!("{next_stash_id}\n"));
            header.push(format!("{max_stashed_blocks}\n"));
        }

        let list_path = with_suffix(prefix, ".transfer.list");
        let mut f = BufWriter::new(
            File::create(&list_path)
                .with_context(|| format!("creating {}", list_path.display()))?,
        );
        for line in header.iter().chain(out.iter()) {
            f.write_all(line.as_bytes()).context("writing transfer list")?;
        }
        f.flush().context("flushing transfer list")?;

        if self.version >= 2 {
            self.max_stashed_size = max_stashed_blocks * BLOCK_SIZE;
            match self.cache_size {
                Some(cache_size) => {
                    let max_allowed = cache_size as f64 * self.stash_threshold;
                    eprintln!(
                        "max stashed blocks: {}  ({} bytes), limit: {} bytes ({:.2}%)\n",
                        max_stashed_blocks,
                        self.max_stashed_size,
                        max_allowed as u64,
                        self.max_stashed_size as f64 * 100.0 / max_allowed
                    );
                }
                None => eprintln!(
                    "max stashed blocks: {}  ({} bytes), limit: <unknown>\n",
                    max_stashed_blocks, self.max_stashed_size
                ),
            }
        }

        let mut transfers: BTreeMap<String, usize> = BTreeMap::new();
        for xf in &self.xfs {
            *transfers.entry(xf.style.name().to_string()).or_insert(0) += 1;
        }
        Ok(DiffSummary {
            version: self.version,
            total_blocks_written: total,
            stash_slots: next_stash_id,
            max_stashed_blocks,
            max_stashed_bytes: max_stashed_blocks * BLOCK_SIZE,
            stash_limit_bytes: self
                .cache_size
                .map(|c| (c as f64 * self.stash_threshold) as u64),
            touched_src_sha1: self.touched_src_sha1.clone(),
            transfers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{DataImage, Image};
    use crate::planner::DiffOptions;
    use bytes::Bytes;
    use std::fs;

    const BS: usize = BLOCK_SIZE as usize;

    fn image_data(bytes: &[u8]) -> Vec<u8> {
        bytes.iter().flat_map(|&b| vec![b; BS]).collect()
    }

    fn rs(text: &str) -> RangeSet {
        RangeSet::parse(text).unwrap()
    }

    /// Applies an emitted transfer list to the source bytes, block for
    /// block, the way the on-device updater would. Binary patches are not
    /// supported; tests using this arrange for every diff to resolve to a
    /// move.
    fn apply_transfer_list(
        list: &str,
        src_data: &[u8],
        new_data: &[u8],
        total_blocks: u64,
    ) -> Vec<u8> {
        let mut out = vec![0u8; total_blocks as usize * BS];
        let n = src_data.len().min(out.len());
        out[..n].copy_from_slice(&src_data[..n]);

        let mut lines = list.lines();
        let version: u32 = lines.next().unwrap().parse().unwrap();
        let _total: u64 = lines.next().unwrap().parse().unwrap();
        if version >= 2 {
            lines.next().unwrap();
            lines.next().unwrap();
        }

        let mut new_off = 0usize;
        let mut stash: HashMap<String, Vec<u8>> = HashMap::new();

        for line in lines {
            let mut tokens = line.split(' ');
            let cmd = tokens.next().unwrap();
            match cmd {
                "erase" | "zero" => {
                    let ranges = RangeSet::parse_raw(tokens.next().unwrap()).unwrap();
                    for b in ranges.blocks() {
                        out[b as usize * BS..(b as usize + 1) * BS].fill(0);
                    }
                }
                "new" => {
                    let ranges = RangeSet::parse_raw(tokens.next().unwrap()).unwrap();
                    for b in ranges.blocks() {
                        out[b as usize * BS..(b as usize + 1) * BS]
                            .copy_from_slice(&new_data[new_off..new_off + BS]);
                        new_off += BS;
                    }
                }
                "stash" => {
                    let key = tokens.next().unwrap().to_string();
                    let ranges = RangeSet::parse_raw(tokens.next().unwrap()).unwrap();
                    let mut data = Vec::new();
                    for b in ranges.blocks() {
                        data.extend_from_slice(&out[b as usize * BS..(b as usize + 1) * BS]);
                    }
                    stash.insert(key, data);
                }
                "free" => {
                    stash.remove(tokens.next().unwrap()).unwrap();
                }
                "move" => {
                    if version == 1 {
                        let src_rs = RangeSet::parse_raw(tokens.next().unwrap()).unwrap();
                        let mut buf = Vec::new();
                        for b in src_rs.blocks() {
                            buf.extend_from_slice(
                                &out[b as usize * BS..(b as usize + 1) * BS],
                            );
                        }
                        let tgt_rs = RangeSet::parse_raw(tokens.next().unwrap()).unwrap();
                        write_blocks(&mut out, &tgt_rs, &buf);
                    } else {
                        if version >= 3 {
                            tokens.next().unwrap(); // target hash
                        }
                        let tgt_rs = RangeSet::parse_raw(tokens.next().unwrap()).unwrap();
                        let buf = read_src_str(&out, &stash, &mut tokens);
                        write_blocks(&mut out, &tgt_rs, &buf);
                    }
                }
                "bsdiff" | "imgdiff" => panic!("test interpreter cannot apply {cmd}"),
                other => panic!("unknown command {other}"),
            }
        }
        out
    }

    fn write_blocks(out: &mut [u8], ranges: &RangeSet, data: &[u8]) {
        assert_eq!(ranges.size() as usize * BS, data.len());
        for (i, b) in ranges.blocks().enumerate() {
            out[b as usize * BS..(b as usize + 1) * BS]
                .copy_from_slice(&data[i * BS..(i + 1) * BS]);
        }
    }

    // "<count> <rs> [<locs>] <key>:<locs>..." or "<count> - <key>:<locs>..."
    fn read_src_str<'a>(
        out: &[u8],
        stash: &HashMap<String, Vec<u8>>,
        tokens: &mut impl Iterator<Item = &'a str>,
    ) -> Vec<u8> {
        let count: usize = tokens.next().unwrap().parse().unwrap();
        let mut buf = vec![0u8; count * BS];
        let second = tokens.next().unwrap();
        let rest: Vec<&str> = tokens.collect();
        let mut refs = rest.as_slice();
        if second != "-" {
            let src_rs = RangeSet::parse_raw(second).unwrap();
            let mut data = Vec::new();
            for b in src_rs.blocks() {
                data.extend_from_slice(&out[b as usize * BS..(b as usize + 1) * BS]);
            }
            if refs.is_empty() {
                assert_eq!(data.len(), buf.len());
                buf.copy_from_slice(&data);
            } else {
                let locs = RangeSet::parse_raw(refs[0]).unwrap();
                place_blocks(&mut buf, &locs, &data);
                refs = &refs[1..];
            }
        }
        for stash_ref in refs {
            let (key, locs_text) = stash_ref.split_once(':').unwrap();
            let locs = RangeSet::parse_raw(locs_text).unwrap();
            place_blocks(&mut buf, &locs, &stash[key]);
        }
        buf
    }

    fn place_blocks(buf: &mut [u8], locs: &RangeSet, data: &[u8]) {
        assert_eq!(locs.size() as usize * BS, data.len());
        for (i, p) in locs.blocks().enumerate() {
            buf[p as usize * BS..(p as usize + 1) * BS]
                .copy_from_slice(&data[i * BS..(i + 1) * BS]);
        }
    }

    struct Outputs {
        list: String,
        new_data: Vec<u8>,
        patch_data: Vec<u8>,
    }

    fn run_diff(
        tgt: &dyn Image,
        src: Option<&dyn Image>,
        options: DiffOptions,
    ) -> (Outputs, DiffSummary) {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("out");
        let mut differ = BlockImageDiff::new(tgt, src, options).unwrap();
        let summary = differ.compute(&prefix).unwrap();
        let outputs = Outputs {
            list: fs::read_to_string(with_suffix(&prefix, ".transfer.list")).unwrap(),
            new_data: fs::read(with_suffix(&prefix, ".new.dat")).unwrap(),
            patch_data: fs::read(with_suffix(&prefix, ".patch.dat")).unwrap(),
        };
        (outputs, summary)
    }

    fn care_bytes(image: &dyn Image, applied: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut got = Vec::new();
        for b in image.care_map().blocks() {
            got.extend_from_slice(&applied[b as usize * BS..(b as usize + 1) * BS]);
        }
        let want: Vec<u8> = image
            .read_range_set(image.care_map())
            .iter()
            .flat_map(|c| c.to_vec())
            .collect();
        (got, want)
    }

    #[test]
    fn test_full_update_no_source() {
        // two zero blocks and one data block, no source image
        let tgt = DataImage::new(image_data(&[0, 0, 0xaa]), false, false).unwrap();
        let (outputs, summary) = run_diff(&tgt, None, DiffOptions::default());

        let commands: Vec<&str> = outputs
            .list
            .lines()
            .skip(4)
            .map(|l| l.split(' ').next().unwrap())
            .collect();
        assert_eq!(commands, vec!["new", "zero"]);
        // only the 0xaa block ships as data
        assert_eq!(outputs.new_data, image_data(&[0xaa]));
        assert!(outputs.patch_data.is_empty());
        assert_eq!(summary.total_blocks_written, 3);
        assert_eq!(summary.max_stashed_blocks, 0);

        let applied = apply_transfer_list(&outputs.list, &[], &outputs.new_data, 3);
        let (got, want) = care_bytes(&tgt, &applied);
        assert_eq!(got, want);
    }

    // [A B] -> [B A] forces a 2-cycle between two moves; version 3 breaks it
    // with a single hash-keyed stash which is freed after its one use.
    fn cycle_images() -> (DataImage, DataImage) {
        let mut src = DataImage::new(image_data(&[0x41, 0x42]), false, false).unwrap();
        src.set_file_map(vec![
            ("/a".to_string(), rs("0")),
            ("/b".to_string(), rs("1")),
        ]);
        let mut tgt = DataImage::new(image_data(&[0x42, 0x41]), false, false).unwrap();
        tgt.set_file_map(vec![
            ("/a".to_string(), rs("1")),
            ("/b".to_string(), rs("0")),
        ]);
        (src, tgt)
    }

    #[test]
    fn test_move_cycle_v3() {
        let (src, tgt) = cycle_images();
        let options = DiffOptions {
            version: 3,
            cache_size: Some(16 * BLOCK_SIZE),
            stash_threshold: 1.0,
            ..Default::default()
        };
        let (outputs, summary) = run_diff(&tgt, Some(&src), options);

        let commands: Vec<&str> = outputs
            .list
            .lines()
            .skip(4)
            .map(|l| l.split(' ').next().unwrap())
            .collect();
        assert_eq!(commands, vec!["stash", "move", "move", "free"]);
        assert!(outputs.new_data.is_empty());
        assert!(outputs.patch_data.is_empty());
        assert_eq!(summary.max_stashed_blocks, 1);
        assert_eq!(summary.stash_slots, 1);
        assert_eq!(summary.transfers.get("move"), Some(&2));
        assert_eq!(
            summary.touched_src_sha1.as_ref().map(String::len),
            Some(40)
        );

        // the stash key is the content hash of the stashed source blocks
        let stash_line = outputs.list.lines().nth(4).unwrap();
        let key = stash_line.split(' ').nth(1).unwrap();
        assert_eq!(key.len(), 40);
        assert!(outputs.list.contains(&format!("free {key}\n")));

        let applied =
            apply_transfer_list(&outputs.list, &image_data(&[0x41, 0x42]), &[], 2);
        let (got, want) = care_bytes(&tgt, &applied);
        assert_eq!(got, want);
    }

    #[test]
    fn test_move_cycle_v2_slots() {
        let (src, tgt) = cycle_images();
        let options = DiffOptions {
            version: 2,
            cache_size: Some(16 * BLOCK_SIZE),
            stash_threshold: 1.0,
            ..Default::default()
        };
        let (outputs, summary) = run_diff(&tgt, Some(&src), options);

        // integer slot ids, freed immediately after the consuming command
        assert!(outputs.list.contains("stash 0 "));
        assert!(outputs.list.contains("free 0\n"));
        assert_eq!(summary.stash_slots, 1);

        let applied =
            apply_transfer_list(&outputs.list, &image_data(&[0x41, 0x42]), &[], 2);
        let (got, want) = care_bytes(&tgt, &applied);
        assert_eq!(got, want);
    }

    #[test]
    fn test_move_cycle_v1_trims() {
        let (src, tgt) = cycle_images();
        let options = DiffOptions {
            version: 1,
            ..Default::default()
        };
        let (outputs, _) = run_diff(&tgt, Some(&src), options);

        // no stashing in v1: one transfer loses its source and ships whole
        assert!(!outputs.list.contains("stash"));
        let commands: Vec<&str> = outputs
            .list
            .lines()
            .skip(2)
            .map(|l| l.split(' ').next().unwrap())
            .collect();
        assert!(commands.contains(&"new"));
        assert_eq!(outputs.new_data.len(), BS);

        let applied = apply_transfer_list(
            &outputs.list,
            &image_data(&[0x41, 0x42]),
            &outputs.new_data,
            2,
        );
        let (got, want) = care_bytes(&tgt, &applied);
        assert_eq!(got, want);
    }

    #[test]
    fn test_identical_content_moves_without_patches() {
        // two relocated domains with unchanged content and a zero area
        let mut src =
            DataImage::new(image_data(&[0x11, 0x22, 0, 0]), false, false).unwrap();
        src.set_file_map(vec![
            ("/a".to_string(), rs("0")),
            ("/b".to_string(), rs("1")),
            ("__ZERO".to_string(), rs("2-3")),
        ]);
        let mut tgt =
            DataImage::new(image_data(&[0, 0, 0x11, 0x22]), false, false).unwrap();
        tgt.set_file_map(vec![
            ("/a".to_string(), rs("2")),
            ("/b".to_string(), rs("3")),
            ("__ZERO".to_string(), rs("0-1")),
        ]);

        let options = DiffOptions {
            version: 4,
            cache_size: Some(16 * BLOCK_SIZE),
            ..Default::default()
        };
        let (outputs, summary) = run_diff(&tgt, Some(&src), options);

        assert!(outputs.patch_data.is_empty());
        assert!(outputs.new_data.is_empty());
        assert_eq!(summary.transfers.get("move"), Some(&2));
        assert_eq!(summary.transfers.get("zero"), Some(&1));

        let applied = apply_transfer_list(
            &outputs.list,
            &image_data(&[0x11, 0x22, 0, 0]),
            &[],
            4,
        );
        let (got, want) = care_bytes(&tgt, &applied);
        assert_eq!(got, want);
    }

    #[test]
    fn test_extended_blocks_and_erase() {
        struct TestImage {
            data: Vec<u8>,
            care_map: RangeSet,
            clobbered: RangeSet,
            extended: RangeSet,
            file_map: Vec<(String, RangeSet)>,
        }
        impl Image for TestImage {
            fn total_blocks(&self) -> u64 {
                (self.data.len() / BS) as u64
            }
            fn care_map(&self) -> &RangeSet {
                &self.care_map
            }
            fn clobbered_blocks(&self) -> &RangeSet {
                &self.clobbered
            }
            fn extended(&self) -> &RangeSet {
                &self.extended
            }
            fn file_map(&self) -> &[(String, RangeSet)] {
                &self.file_map
            }
            fn read_range_set(&self, ranges: &RangeSet) -> Vec<Bytes> {
                ranges
                    .iter()
                    .map(|(s, e)| {
                        Bytes::copy_from_slice(&self.data[s as usize * BS..e as usize * BS])
                    })
                    .collect()
            }
            fn total_sha1(&self, include_clobbered_blocks: bool) -> String {
                let ranges = if include_clobbered_blocks {
                    self.care_map.clone()
                } else {
                    self.care_map.subtract(&self.clobbered)
                };
                crate::image::sha1_hex(&self.read_range_set(&ranges))
            }
        }

        let tgt = TestImage {
            data: image_data(&[0x77, 0x88, 0, 0]),
            care_map: rs("0-1"),
            clobbered: RangeSet::new(),
            extended: rs("2"),
            file_map: vec![("/f".to_string(), rs("0-1"))],
        };
        let (outputs, _) = run_diff(&tgt, None, DiffOptions::default());

        let lines: Vec<&str> = outputs.list.lines().collect();
        // nothing reads block 3, so it is erased up front
        assert_eq!(lines[4], "erase 2,3,4");
        assert!(lines.contains(&"zero 2,2,3"));

        let applied = apply_transfer_list(&outputs.list, &[], &outputs.new_data, 4);
        let (got, want) = care_bytes(&tgt, &applied);
        assert_eq!(got, want);
        // the extended block was zeroed
        assert_eq!(applied[2 * BS..3 * BS], vec![0u8; BS][..]);
    }

    #[test]
    fn test_reproducible_output() {
        let (src, tgt) = cycle_images();
        let options = || DiffOptions {
            version: 3,
            threads: Some(1),
            cache_size: Some(16 * BLOCK_SIZE),
            ..Default::default()
        };
        let (first, _) = run_diff(&tgt, Some(&src), options());
        let (second, _) = run_diff(&tgt, Some(&src), options());
        assert_eq!(first.list, second.list);
        assert_eq!(first.new_data, second.new_data);
        assert_eq!(first.patch_data, second.patch_data);
    }

    #[test]
    fn test_version_headers() {
        let tgt = DataImage::new(image_data(&[0xaa]), false, false).unwrap();
        let (outputs, _) = run_diff(
            &tgt,
            None,
            DiffOptions {
                version: 1,
                ..Default::default()
            },
        );
        let lines: Vec<&str> = outputs.list.lines().collect();
        assert_eq!(lines[0], "1");
        assert_eq!(lines[1], "1");
        assert_eq!(lines[2], "new 2,0,1");

        let (outputs, _) = run_diff(&tgt, None, DiffOptions::default());
        let lines: Vec<&str> = outputs.list.lines().collect();
        assert_eq!(&lines[..4], &["4", "1", "0", "0"]);
    }
}
