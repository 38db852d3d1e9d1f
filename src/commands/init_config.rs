// ABOUTME: init-config command - writes a commented starter configuration
// ABOUTME: Refuses to overwrite an existing file

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::config::CONFIG_TEMPLATE;

pub fn init_config(output: &Path) -> Result<()> {
    if output.exists() {
        bail!(
            "{} already exists. Remove it or choose another path with --output.",
            output.display()
        );
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    std::fs::write(output, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Wrote {}", output.display());
    println!("Edit source_dsn and destination_dsn, then run:");
    println!("  execution-replicator validate --config {}", output.display());
    Ok(())
}
