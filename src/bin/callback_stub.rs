//! Upstage callback stub
//!
//! Stands in for the application relaunched after an update. Usage:
//!
//! ```text
//! upstage-callback-stub <working-dir> <log-name> [args...]
//! ```
//!
//! Every argument it received, including the first two, is written one per
//! line to `<working-dir>/<log-name>`.

use anyhow::{Context, Result};
use std::path::PathBuf;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let (dir, name) = match args.as_slice() {
        [dir, name, ..] => (PathBuf::from(dir), name.clone()),
        _ => anyhow::bail!("usage: upstage-callback-stub <working-dir> <log-name> [args...]"),
    };

    let log = dir.join(name);
    let mut contents = args.join("\n");
    contents.push('\n');

    std::fs::write(&log, contents)
        .with_context(|| format!("Failed to write callback log: {}", log.display()))?;

    Ok(())
}
