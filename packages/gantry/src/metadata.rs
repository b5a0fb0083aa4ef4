//! Per-target build metadata.
//!
//! A successful build leaves a small binary record next to its outputs: the
//! command's standard output (replayed into post-build hooks on incremental
//! runs), plus the outputs discovered post-hoc from optional globs and
//! output-directory sweeps.

use std::path::PathBuf;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{config::Configuration, fs, target::Target};

/// Format version; bump when the record shape changes.
const METADATA_VERSION: u32 = 2;

/// The record stored alongside a target's outputs.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct BuildMetadata {
    version: u32,

    /// Raw standard output of the build command.
    pub stdout: Vec<u8>,

    /// Optional outputs that matched their globs.
    pub optional_outputs: Vec<String>,

    /// Files swept out of declared output directories.
    pub dir_outputs: Vec<String>,
}

impl BuildMetadata {
    pub fn new(stdout: Vec<u8>) -> Self {
        Self {
            version: METADATA_VERSION,
            stdout,
            optional_outputs: Vec::new(),
            dir_outputs: Vec::new(),
        }
    }

    /// All post-hoc outputs recorded by this build.
    pub fn discovered_outputs(&self) -> Vec<String> {
        let mut outputs = self.optional_outputs.clone();
        outputs.extend(self.dir_outputs.iter().cloned());
        outputs
    }
}

/// Path of the metadata file for a target.
pub fn path(config: &Configuration, target: &Target) -> PathBuf {
    target.out_dir(config).join(target.metadata_file_name())
}

/// Write the metadata record for a target.
#[instrument(skip_all, fields(target = %target.label))]
pub async fn store(config: &Configuration, target: &Target, metadata: &BuildMetadata) -> Result<()> {
    let bytes = bincode::serialize(metadata).context("encode build metadata")?;
    fs::write(path(config, target), bytes).await
}

/// Load the metadata record for a target, if one exists.
///
/// Records from unknown format versions are rejected; the caller treats that
/// the same as a missing record and rebuilds.
#[instrument(skip_all, fields(target = %target.label))]
pub async fn load(config: &Configuration, target: &Target) -> Result<Option<BuildMetadata>> {
    let Some(bytes) = fs::read_buffered(path(config, target)).await? else {
        return Ok(None);
    };
    let metadata: BuildMetadata = bincode::deserialize(&bytes).context("decode build metadata")?;
    if metadata.version != METADATA_VERSION {
        bail!(
            "build metadata version {} is not supported (expected {METADATA_VERSION})",
            metadata.version
        );
    }
    Ok(Some(metadata))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        label::BuildLabel,
        target::{Target, TargetKind},
    };

    fn target() -> Target {
        Target::builder()
            .label(BuildLabel::new("pkg", "t"))
            .kind(TargetKind::Command)
            .build()
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let temp = TempDir::new().unwrap();
        let config = Configuration::builder().repo_root(temp.path()).build();
        let target = target();

        let mut metadata = BuildMetadata::new(b"build said hello\n".to_vec());
        metadata.optional_outputs.push("extra.log".into());
        metadata.dir_outputs.push("swept/file.txt".into());

        store(&config, &target, &metadata).await.unwrap();
        let loaded = load(&config, &target).await.unwrap().unwrap();
        assert_eq!(loaded, metadata);
        assert_eq!(
            loaded.discovered_outputs(),
            vec!["extra.log", "swept/file.txt"]
        );
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let temp = TempDir::new().unwrap();
        let config = Configuration::builder().repo_root(temp.path()).build();
        assert!(load(&config, &target()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() {
        let temp = TempDir::new().unwrap();
        let config = Configuration::builder().repo_root(temp.path()).build();
        let target = target();
        fs::write(path(&config, &target), b"definitely not bincode")
            .await
            .unwrap();
        assert!(load(&config, &target).await.is_err());
    }
}
