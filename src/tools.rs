//! Build-tree scanning and external tool invocation.
//!
//! The strip and validation executables are opaque collaborators: the
//! realignment itself never depends on them, and a missing tool degrades
//! to a warning (and a plain copy, in the strip case) rather than an
//! error. Everything here belongs to the orchestration layer and uses
//! `anyhow` like the binary does.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

/// Locates an executable by searching the `PATH` directories.
pub fn find_tool(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Runs a command to completion and returns its captured stdout. A
/// non-zero exit status becomes an error carrying the captured stderr.
pub fn run(command: &mut Command) -> Result<String> {
    debug!("running {:?}", command);
    let output = command
        .output()
        .with_context(|| format!("failed to spawn {:?}", command))?;
    if !output.status.success() {
        bail!(
            "{:?} failed ({}): {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Strips debug sections from `input` with `llvm-strip`, renaming a
/// `.dll` build artifact to `.efi` in the process. Returns the path of
/// the stripped image.
///
/// When `llvm-strip` is not on `PATH`, the input is carried over
/// unchanged. The strip runs into a temporary sibling which is then
/// renamed over the target, so a failed strip never leaves a truncated
/// image behind.
pub fn strip_debug(input: &Path) -> Result<PathBuf> {
    let stripped = if input.extension() == Some(OsStr::new("dll")) {
        input.with_extension("efi")
    } else {
        input.to_path_buf()
    };
    let tmp = tmp_sibling(&stripped);

    match find_tool("llvm-strip") {
        Some(tool) => {
            run(Command::new(tool)
                .arg("--strip-debug")
                .arg(input)
                .arg("-o")
                .arg(&tmp))?;
        }
        None => {
            warn!("llvm-strip not found, skipping strip");
            fs::copy(input, &tmp)
                .with_context(|| format!("failed to copy {}", input.display()))?;
        }
    }
    fs::rename(&tmp, &stripped)
        .with_context(|| format!("failed to move stripped image to {}", stripped.display()))?;
    info!("stripped debug symbols into {}", stripped.display());
    Ok(stripped)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Runs an external validation command (e.g. `DumpImage -f`) against a
/// processed image, logging its output. A validator that is not on
/// `PATH` is a warning, not an error.
pub fn validate_image(command: &str, image: &Path) -> Result<()> {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        bail!("empty validator command");
    };
    let Some(tool) = find_tool(program) else {
        warn!("{program} not found, skipping validation");
        return Ok(());
    };
    let stdout = run(Command::new(tool).args(parts).arg(image))?;
    for line in stdout.lines() {
        info!("{program}: {line}");
    }
    Ok(())
}

/// Recursively collects PE build artifacts (`.efi`/`.dll`) under `root`.
/// When `names` is non-empty, only files whose name matches one of the
/// entries (case-insensitively) are returned. Results are sorted for a
/// stable processing order.
pub fn find_images(root: &Path, names: &[String]) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect(root, names, &mut found)?;
    found.sort();
    Ok(found)
}

fn collect(dir: &Path, names: &[String], found: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect(&path, names, found)?;
        } else if is_candidate(&path, names) {
            found.push(path);
        }
    }
    Ok(())
}

fn is_candidate(path: &Path, names: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if !names.is_empty() {
        return names.iter().any(|n| n.eq_ignore_ascii_case(name));
    }
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".efi") || lower.ends_with(".dll")
}
