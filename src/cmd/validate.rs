//! Offline correction set check: `stepwright validate <file>`.

use anyhow::{Context, Result};
use std::path::Path;

use stepwright::editing::graph::validate_correction_set;
use stepwright_common::CorrectionSet;

pub fn cmd_validate(file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let set: CorrectionSet = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse correction set in {}", file.display()))?;

    if set.is_empty() {
        anyhow::bail!("Correction set has no steps");
    }

    match validate_correction_set(&set) {
        Ok(()) => {
            println!(
                "{} {} step(s), no problems found.",
                console::style("Valid:").green().bold(),
                set.steps.len()
            );
            Ok(())
        }
        Err(violations) => {
            println!("{}", console::style("Correction set has problems:").red().bold());
            for v in &violations {
                println!("  - {}", v);
            }
            anyhow::bail!("{} violation(s) found", violations.len())
        }
    }
}
