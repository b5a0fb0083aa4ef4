//! Frozen build configuration.
//!
//! A [`Configuration`] is constructed once per build invocation by the
//! configuration collaborator and treated as read-only by the core. The
//! opaque `config_bytes` field carries whatever global state the collaborator
//! considers hash-relevant; the core digests it but never interprets it.

use std::{path::PathBuf, time::Duration};

use bon::Builder;
use url::Url;

use crate::hash::{Digest, HashAlgorithm};

/// Directory under the output root holding generated (non-binary) outputs.
const GEN_DIR: &str = "gen";

/// Directory under the output root holding binary outputs.
const BIN_DIR: &str = "bin";

/// Directory under the output root holding per-target temp directories.
const TMP_DIR: &str = "tmp";

/// Directory under the output root holding per-target build locks.
const LOCK_DIR: &str = ".locks";

/// The global configuration for one build invocation.
#[derive(Clone, Debug, Builder)]
pub struct Configuration {
    /// Absolute path to the repository root.
    #[builder(into)]
    pub repo_root: PathBuf,

    /// Output root directory name, relative to the repo root.
    #[builder(into, default = String::from("plz-out"))]
    pub out_root: String,

    /// The content hash algorithm for this build.
    #[builder(default)]
    pub hash_algorithm: HashAlgorithm,

    /// Maximum wall time for a single target's command.
    #[builder(default = Duration::from_secs(600))]
    pub build_timeout: Duration,

    /// Per-request timeout for remote file downloads.
    #[builder(default = Duration::from_secs(30))]
    pub download_timeout: Duration,

    /// Maximum concurrent remote file downloads.
    #[builder(default = 4)]
    pub parallel_downloads: usize,

    /// Number of parallel build workers the scheduler should run.
    #[builder(default = num_cpus::get())]
    pub num_workers: usize,

    /// Whether the artifact cache participates in this build.
    #[builder(default = true)]
    pub cache_enabled: bool,

    /// Whether extended attributes are available on the output filesystem.
    /// When false, fingerprints degrade to sidecar files.
    #[builder(default = true)]
    pub xattrs_enabled: bool,

    /// Sandbox wrapper binary for targets that request sandboxing.
    pub sandbox_tool: Option<PathBuf>,

    /// Proxy for remote file downloads.
    pub http_proxy: Option<Url>,

    /// User agent sent with remote file downloads.
    #[builder(into, default = format!("gantry/{}", env!("CARGO_PKG_VERSION")))]
    pub user_agent: String,

    /// Licences the build accepts. When non-empty, a target carrying
    /// licences must match at least one.
    #[builder(default)]
    pub accepted_licences: Vec<String>,

    /// Licences the build rejects outright. Rejection wins over acceptance.
    #[builder(default)]
    pub rejected_licences: Vec<String>,

    /// File names treated as build definitions, excluded from output sweeps.
    #[builder(default = vec![String::from("BUILD")])]
    pub build_file_names: Vec<String>,

    /// `PATH` value for build commands.
    #[builder(into, default = String::from("/usr/local/bin:/usr/bin:/bin"))]
    pub build_path: String,

    /// Whether hash verification mismatches fail the target. When false,
    /// mismatches degrade to warnings.
    #[builder(default = true)]
    pub strict_hash_verification: bool,

    /// Keep per-target temp directories after a successful build.
    #[builder(default = false)]
    pub keep_tmp_dirs: bool,

    /// Opaque bytes representing the global configuration state; digested
    /// into every fingerprint.
    #[builder(into, default)]
    pub config_bytes: Vec<u8>,

    /// Directory for the audit log of this invocation, when auditing is on.
    pub audit_dir: Option<PathBuf>,
}

impl Configuration {
    /// Absolute path of the output root.
    pub fn out_root_dir(&self) -> PathBuf {
        self.repo_root.join(&self.out_root)
    }

    /// Absolute path of the generated-output directory.
    pub fn gen_dir(&self) -> PathBuf {
        self.out_root_dir().join(GEN_DIR)
    }

    /// Absolute path of the binary-output directory.
    pub fn bin_dir(&self) -> PathBuf {
        self.out_root_dir().join(BIN_DIR)
    }

    /// Absolute path of the temp-directory root.
    pub fn tmp_root(&self) -> PathBuf {
        self.out_root_dir().join(TMP_DIR)
    }

    /// Absolute path of the build-lock directory.
    pub fn lock_dir(&self) -> PathBuf {
        self.out_root_dir().join(LOCK_DIR)
    }

    /// Digest of the opaque configuration bytes, sized for the configured
    /// algorithm so it slots into fingerprints.
    pub fn config_hash(&self) -> Digest {
        self.hash_algorithm.hash_bytes(&self.config_bytes)
    }
}
