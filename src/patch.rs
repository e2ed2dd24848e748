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

//! Binary patch computation.
//!
//! Each remaining `diff` transfer is resolved here: content-identical pairs
//! become `move`s, zip-family files go to `imgdiff -z`, everything else to
//! `bsdiff`. The external differs run in a worker pool; workers pull the
//! largest target first and write finished patches into per-job slots, so
//! concatenation order never depends on scheduling.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use crate::image::sha1_hex;
use crate::planner::{with_suffix, BlockImageDiff};
use crate::transfer::{Style, TransferId};

struct DiffJob {
    tgt_size: u64,
    src: Vec<Bytes>,
    tgt: Vec<Bytes>,
    xf: TransferId,
    imgdiff: bool,
    style: &'static str,
    label: String,
    patch_num: usize,
}

/// Runs the external differ over materialized source and target contents and
/// returns the patch bytes. The scratch files are unlinked on every exit
/// path, including panics.
pub fn compute_patch(src: &[Bytes], tgt: &[Bytes], imgdiff: bool) -> Result<Vec<u8>> {
    let mut src_file = tempfile::Builder::new()
        .prefix("blockimgdiff-src-")
        .tempfile()
        .context("allocating source tempfile")?;
    for chunk in src {
        src_file.write_all(chunk).context("writing source tempfile")?;
    }
    src_file.flush().context("flushing source tempfile")?;

    let mut tgt_file = tempfile::Builder::new()
        .prefix("blockimgdiff-tgt-")
        .tempfile()
        .context("allocating target tempfile")?;
    for chunk in tgt {
        tgt_file.write_all(chunk).context("writing target tempfile")?;
    }
    tgt_file.flush().context("flushing target tempfile")?;

    let patch_file = tempfile::Builder::new()
        .prefix("blockimgdiff-patch-")
        .tempfile()
        .context("allocating patch tempfile")?;

    let (differ, status) = if imgdiff {
        let status = Command::new("imgdiff")
            .arg("-z")
            .arg(src_file.path())
            .arg(tgt_file.path())
            .arg(patch_file.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("running imgdiff")?;
        ("imgdiff", status)
    } else {
        let status = Command::new("bsdiff")
            .arg(src_file.path())
            .arg(tgt_file.path())
            .arg(patch_file.path())
            .status()
            .context("running bsdiff")?;
        ("bsdiff", status)
    };
    if !status.success() {
        bail!("{} failed with {}", differ, status);
    }

    fs::read(patch_file.path()).context("reading patch")
}

// imgdiff -z wants its input to be a valid zip archive, which holds when the
// file's blocks are intact (stored in increasing order with none trimmed) and
// it is zip-family by extension.
fn zip_family(name: &str) -> bool {
    let ext = name.rsplit('.').next().unwrap_or("").to_lowercase();
    matches!(ext.as_str(), "apk" | "jar" | "zip")
}

impl BlockImageDiff<'_> {
    pub(crate) fn compute_patches(&mut self, prefix: &Path) -> Result<()> {
        eprintln!("Reticulating splines...");

        let mut diff_q: Vec<DiffJob> = Vec::new();
        let mut patch_num = 0;

        let new_path = with_suffix(prefix, ".new.dat");
        let mut new_f = BufWriter::new(
            File::create(&new_path)
                .with_context(|| format!("creating {}", new_path.display()))?,
        );

        for &id in &self.sequence {
            match self.xfs[id.index()].style {
                Style::Zero => {}
                Style::New => {
                    for chunk in self.tgt.read_range_set(&self.xfs[id.index()].tgt_ranges) {
                        new_f.write_all(&chunk).context("writing new data")?;
                    }
                }
                Style::Diff => {
                    let src = self.src.get().read_range_set(&self.xfs[id.index()].src_ranges);
                    let tgt = self.tgt.read_range_set(&self.xfs[id.index()].tgt_ranges);

                    // src and tgt may hold the same content in differently
                    // sized chunks; hashing compares the concatenations
                    // without materializing them
                    let tgt_size: u64 = tgt.iter().map(|c| c.len() as u64).sum();
                    if sha1_hex(&src) == sha1_hex(&tgt) {
                        // identical; copy commands on the device suffice
                        self.xfs[id.index()].style = Style::Move;
                    } else {
                        let xf = &mut self.xfs[id.index()];
                        let imgdiff =
                            !self.disable_imgdiff && xf.intact && zip_family(&xf.tgt_name);
                        xf.style = if imgdiff { Style::Imgdiff } else { Style::Bsdiff };
                        let label = match &xf.src_name {
                            Some(src_name) if *src_name != xf.tgt_name => {
                                format!("{} (from {})", xf.tgt_name, src_name)
                            }
                            _ => xf.tgt_name.clone(),
                        };
                        diff_q.push(DiffJob {
                            tgt_size,
                            src,
                            tgt,
                            xf: id,
                            imgdiff,
                            style: xf.style.name(),
                            label,
                            patch_num,
                        });
                        patch_num += 1;
                    }
                }
                style => bail!("unexpected style {} before patch computation", style.name()),
            }
        }
        new_f.flush().context("flushing new data")?;

        let results: Mutex<Vec<Option<(Vec<u8>, TransferId)>>> =
            Mutex::new(vec![None; patch_num]);
        if !diff_q.is_empty() {
            if self.threads > 1 {
                eprintln!("Computing patches (using {} threads)...", self.threads);
            } else {
                eprintln!("Computing patches...");
            }
            // workers pop from the back, so the most expensive jobs start
            // first and the pool drains evenly
            diff_q.sort_by_key(|job| (job.tgt_size, job.patch_num));
            let queue = Mutex::new(diff_q);

            thread::scope(|scope| -> Result<()> {
                let mut workers = Vec::new();
                for _ in 0..self.threads {
                    workers.push(scope.spawn(|| -> Result<()> {
                        loop {
                            let job = queue.lock().expect("queue lock poisoned").pop();
                            let Some(job) = job else {
                                return Ok(());
                            };
                            let patch = compute_patch(&job.src, &job.tgt, job.imgdiff)?;
                            let mut results = results.lock().expect("results lock poisoned");
                            eprintln!(
                                "{:>10} {:>10} ({:6.2}%) {:>7} {}",
                                patch.len(),
                                job.tgt_size,
                                patch.len() as f64 * 100.0 / job.tgt_size as f64,
                                job.style,
                                job.label
                            );
                            results[job.patch_num] = Some((patch, job.xf));
                        }
                    }));
                }
                for worker in workers {
                    worker.join().expect("patch worker panicked")?;
                }
                Ok(())
            })?;
        }

        let patch_path = with_suffix(prefix, ".patch.dat");
        let mut patch_f = BufWriter::new(
            File::create(&patch_path)
                .with_context(|| format!("creating {}", patch_path.display()))?,
        );
        let mut offset = 0u64;
        for slot in results.into_inner().expect("results lock poisoned") {
            let (patch, id) = slot.expect("missing patch result");
            self.xfs[id.index()].patch_start = offset;
            self.xfs[id.index()].patch_len = patch.len() as u64;
            patch_f.write_all(&patch).context("writing patch data")?;
            offset += patch.len() as u64;
        }
        patch_f.flush().context("flushing patch data")?;
        Ok(())
    }
}
