//! Entry point for the pealign tool.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize logging via `tracing-subscriber`.
//! 3. Discover candidate PE images under the given paths.
//! 4. Execute the pipeline per image: strip, realign, verify, validate.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use pealign::config::Config;
use pealign::{process, tools};

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    // 1. Discover candidate images
    let mut targets = Vec::new();
    for input in &config.inputs {
        if input.is_dir() {
            let mut found = tools::find_images(input, &config.names)
                .with_context(|| format!("failed to scan {}", input.display()))?;
            targets.append(&mut found);
        } else {
            targets.push(input.clone());
        }
    }
    if targets.is_empty() {
        anyhow::bail!("no images found under the given paths");
    }

    // 2. Run the pipeline per image
    for target in targets {
        tracing::info!("processing {}", target.display());

        let image = if config.no_strip {
            target.clone()
        } else {
            tools::strip_debug(&target)
                .with_context(|| format!("failed to strip {}", target.display()))?
        };

        let output = if config.strip_only {
            image.clone()
        } else {
            let output = if config.in_place {
                image.clone()
            } else {
                aligned_sibling(&image)
            };
            let report = process::realign_image(&image, &output, config.section_align)
                .with_context(|| format!("failed to realign {}", image.display()))?;
            tracing::info!(
                "realigned {} ({} sections, alignment 0x{:x} -> 0x{:x}, image size 0x{:x})",
                report.output.display(),
                report.sections,
                report.old_alignment,
                report.new_alignment,
                report.image_size
            );
            output
        };

        if let Some(validator) = &config.validator {
            tools::validate_image(validator, &output)?;
        }
    }
    Ok(())
}

/// `foo.efi` -> `foo_aligned.efi` next to the input.
fn aligned_sibling(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    path.with_file_name(format!("{stem}_aligned.efi"))
}
