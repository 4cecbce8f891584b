use anyhow::{Context, Result};
use duct::cmd;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug)]
struct LocateProject {
  root: PathBuf,
}

/// Root of the workspace the codegen binary runs inside, resolved through
/// cargo itself so the tool works from any subdirectory.
pub fn find_root() -> Result<PathBuf> {
  let json = cmd!("cargo", "locate-project", "--workspace").read()?;

  let located: LocateProject =
    serde_json::from_str(&json).context("unexpected cargo locate-project output")?;
  located
    .root
    .parent()
    .map(Path::to_owned)
    .context("workspace manifest has no parent directory")
}
