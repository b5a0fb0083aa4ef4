//! The pluggable artifact cache.
//!
//! The build executor only ever speaks this minimal interface; the bundled
//! [`DirCache`] persists artifacts in a local directory tree, and other
//! backends can slot in behind the same trait.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument, trace};

use crate::{fs, hash::Digest, target::Target};

/// Storage backend for built artifacts.
///
/// Implementations must be internally thread-safe; workers call them
/// concurrently.
pub trait Cache: Send + Sync {
    /// Persist the named files (relative to `out_dir`) under `key`.
    async fn store(
        &self,
        target: &Target,
        key: &Digest,
        out_dir: &Path,
        files: &[String],
    ) -> Result<()>;

    /// Restore the named files into `out_dir` if the key is present.
    /// Returns whether all requested files were restored.
    async fn retrieve(
        &self,
        target: &Target,
        key: &Digest,
        out_dir: &Path,
        files: &[String],
    ) -> Result<bool>;

    /// Drop everything stored for the target.
    async fn clean(&self, target: &Target) -> Result<()>;

    /// Drop the whole cache.
    async fn clean_all(&self) -> Result<()>;
}

/// A cache rooted in a local directory.
///
/// Artifacts live at `<root>/<package>/<name>/<hex key>/<file>`; retrieval
/// is a straight copy back into the output directory.
#[derive(Clone, Debug)]
pub struct DirCache {
    root: PathBuf,
}

impl DirCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target_dir(&self, target: &Target) -> PathBuf {
        self.root
            .join(&target.label.package)
            .join(&target.label.name)
    }

    fn key_dir(&self, target: &Target, key: &Digest) -> PathBuf {
        self.target_dir(target).join(key.to_string())
    }
}

impl Cache for DirCache {
    #[instrument(skip_all, fields(target = %target.label, %key))]
    async fn store(
        &self,
        target: &Target,
        key: &Digest,
        out_dir: &Path,
        files: &[String],
    ) -> Result<()> {
        let dir = self.key_dir(target, key);
        for file in files {
            let src = out_dir.join(file);
            if fs::metadata(&src).await?.is_none() {
                trace!(%file, "skipping missing file");
                continue;
            }
            fs::copy_file(&src, dir.join(file))
                .await
                .with_context(|| format!("store {file} in cache"))?;
        }
        debug!(?dir, "stored artifacts");
        Ok(())
    }

    #[instrument(skip_all, fields(target = %target.label, %key))]
    async fn retrieve(
        &self,
        target: &Target,
        key: &Digest,
        out_dir: &Path,
        files: &[String],
    ) -> Result<bool> {
        let dir = self.key_dir(target, key);
        // Check completeness before touching the output directory so a
        // partial entry never clobbers half the outputs.
        for file in files {
            if fs::metadata(dir.join(file)).await?.is_none() {
                trace!(%file, "cache miss");
                return Ok(false);
            }
        }
        for file in files {
            fs::copy_file(dir.join(file), out_dir.join(file))
                .await
                .with_context(|| format!("retrieve {file} from cache"))?;
        }
        debug!(?dir, "retrieved artifacts");
        Ok(true)
    }

    async fn clean(&self, target: &Target) -> Result<()> {
        fs::remove_dir_all(self.target_dir(target)).await
    }

    async fn clean_all(&self) -> Result<()> {
        fs::remove_dir_all(&self.root).await
    }
}
