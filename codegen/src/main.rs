//! Regenerates the checked-in prost/tonic module of the proto crate from
//! `proto/v1beta1.proto`. Run manually after editing the proto file; the
//! build itself never invokes protoc.

mod workspace;

use anyhow::{Context, Result};
use std::{fs, path::PathBuf};

struct Paths {
  include_dir: PathBuf,
  proto_file: PathBuf,
  staging_dir: PathBuf,
  generated_file: PathBuf,
}

impl Paths {
  fn resolve() -> Result<Self> {
    let root = workspace::find_root()?;

    Ok(Self {
      include_dir: root.join("proto"),
      proto_file: root.join("proto").join("v1beta1.proto"),
      staging_dir: root.join("target").join("proto"),
      generated_file: root
        .join("crates")
        .join("proto")
        .join("src")
        .join("v1beta1")
        .join("proto.rs"),
    })
  }
}

fn main() -> Result<()> {
  let paths = Paths::resolve()?;
  fs::create_dir_all(&paths.staging_dir)?;

  // servers only; the driver never dials its own services
  tonic_build::configure()
    .out_dir(&paths.staging_dir)
    .build_client(false)
    .build_server(true)
    .compile(&[&paths.proto_file], &[&paths.include_dir])
    .context("protoc failed")?;

  let staged = paths.staging_dir.join("v1beta1.rs");
  fs::copy(&staged, &paths.generated_file)
    .context("failed to refresh the checked-in proto module")?;

  println!("wrote {}", paths.generated_file.display());
  Ok(())
}
