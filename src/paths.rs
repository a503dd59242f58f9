//! Path checks run before a batch starts.
//!
//! These catch the mistakes that would otherwise surface per track: a
//! missing or non-JSON input, or an output directory that is really a file.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// The input must be an existing `.json` file.
pub fn validate_input_file(input: &Path) -> Result<()> {
    if !input.exists() {
        bail!("Input file '{}' does not exist", input.display());
    }
    if !input.is_file() {
        bail!("Input path '{}' is not a file", input.display());
    }
    let is_json = input
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if !is_json {
        bail!(
            "Input file '{}' must be an enriched playlist .json file",
            input.display()
        );
    }
    Ok(())
}

/// Create the output directory if needed and return its path.
///
/// Refuses an existing non-directory, and refuses the input file itself.
pub fn prepare_output_dir(output: &Path, input: &Path) -> Result<PathBuf> {
    if output == input {
        bail!(
            "Output directory '{}' cannot be the same as the input file",
            output.display()
        );
    }
    if output.exists() && !output.is_dir() {
        bail!(
            "Output path '{}' exists and is not a directory",
            output.display()
        );
    }
    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create output directory {}", output.display()))?;
    Ok(output.to_path_buf())
}
