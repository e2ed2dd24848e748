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

use clap::Parser;

// Args are listed in --help in the order declared in these structs/enums.
// Please keep the entire help text to 80 columns.

#[derive(Debug, Parser)]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
#[command(disable_help_subcommand = true)]
pub enum Cmd {
    /// Generate a block-based update package from two partition images
    Diff(DiffConfig),
}

#[derive(Debug, Parser)]
pub struct DiffConfig {
    /// Target partition image
    #[arg(value_name = "TARGET")]
    pub target: String,
    /// Output path prefix for the generated artifacts
    ///
    /// Writes <prefix>.transfer.list, <prefix>.new.dat and
    /// <prefix>.patch.dat.
    #[arg(short, long, value_name = "prefix")]
    pub output: String,
    /// Source partition image to diff against
    ///
    /// Without a source, every block of the target is shipped as new data.
    #[arg(short, long, value_name = "path")]
    pub source: Option<String>,
    /// Block map describing the target's file domains
    ///
    /// One "<name> <range-set>" pair per line.  Without a map, blocks are
    /// classified into zero and nonzero domains only.
    #[arg(long, value_name = "path")]
    pub target_map: Option<String>,
    /// Block map describing the source's file domains
    #[arg(long, value_name = "path")]
    pub source_map: Option<String>,
    /// Transfer list format version
    #[arg(long, default_value_t = 4, value_name = "n")]
    #[arg(value_parser = clap::value_parser!(u32).range(1..=4))]
    pub format_version: u32,
    /// Worker threads for patch generation
    ///
    /// Defaults to half the hardware threads.
    #[arg(long, value_name = "n")]
    pub threads: Option<usize>,
    /// On-device cache budget in bytes
    ///
    /// Bounds the blocks stashed at any point during the update, and the
    /// piece size large diffs are split into.
    #[arg(long, value_name = "bytes")]
    pub cache_size: Option<u64>,
    /// Fraction of the cache usable for stashed blocks
    #[arg(long, default_value_t = 0.8, value_name = "frac")]
    pub stash_threshold: f64,
    /// Never use imgdiff for zip-family files
    #[arg(long)]
    pub disable_imgdiff: bool,
    /// Zero-fill a partial trailing block instead of failing
    #[arg(long, conflicts_with = "trim")]
    pub pad: bool,
    /// Drop a partial trailing block instead of failing
    #[arg(long)]
    pub trim: bool,
    /// Write a JSON run summary
    #[arg(long, value_name = "path")]
    pub stats: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diff_args() {
        let cmd = Cmd::try_parse_from([
            "blockimgdiff",
            "diff",
            "target.img",
            "-o",
            "out/system",
            "--source",
            "source.img",
            "--format-version",
            "3",
            "--cache-size",
            "104857600",
        ])
        .unwrap();
        let Cmd::Diff(config) = cmd;
        assert_eq!(config.target, "target.img");
        assert_eq!(config.output, "out/system");
        assert_eq!(config.source.as_deref(), Some("source.img"));
        assert_eq!(config.format_version, 3);
        assert_eq!(config.cache_size, Some(104857600));
        assert_eq!(config.stash_threshold, 0.8);
        assert!(!config.disable_imgdiff);
    }

    #[test]
    fn test_version_range_enforced() {
        Cmd::try_parse_from([
            "blockimgdiff",
            "diff",
            "t.img",
            "-o",
            "out",
            "--format-version",
            "5",
        ])
        .unwrap_err();
    }

    #[test]
    fn test_pad_trim_conflict() {
        Cmd::try_parse_from([
            "blockimgdiff",
            "diff",
            "t.img",
            "-o",
            "out",
            "--pad",
            "--trim",
        ])
        .unwrap_err();
    }
}
