//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the tool using `clap`.
//! It handles parsing arguments like the target alignment, the paths to scan,
//! and how much of the strip/realign/validate pipeline to run.

use clap::Parser;
use std::path::PathBuf;

/// Fixes the section alignment of PE/COFF images in a build tree.
///
/// Scans the given files or build-output directories for UEFI images
/// (`.efi`/`.dll`), strips their debug sections, and rewrites each
/// image's section layout to satisfy a larger section alignment.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Image files or build-output directories to process
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Desired section alignment, a power of two (accepts hex, e.g. 0x10000)
    #[arg(long, default_value = "0x10000", value_parser = parse_alignment)]
    pub section_align: u64,

    /// Only strip debug sections, no realignment
    #[arg(long)]
    pub strip_only: bool,

    /// Skip the llvm-strip pre-pass
    #[arg(long, conflicts_with = "strip_only")]
    pub no_strip: bool,

    /// Rewrite images in place instead of writing `<name>_aligned.efi`
    #[arg(long)]
    pub in_place: bool,

    /// File name to look for when scanning directories (repeatable)
    #[arg(long = "name")]
    pub names: Vec<String>,

    /// External validation command to run on each processed image
    #[arg(long)]
    pub validator: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

/// Parses an alignment argument as hex (with a `0x` prefix) or decimal.
fn parse_alignment(arg: &str) -> Result<u64, String> {
    let parsed = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    parsed.map_err(|_| format!("invalid alignment value: {arg}"))
}
