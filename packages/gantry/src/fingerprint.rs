//! Persisted build fingerprints.
//!
//! After a successful build, every output carries a fixed-size fingerprint
//! (the concatenation of the pre-build rule hash, post-build rule hash,
//! configuration hash, source hash and secret hash) as an extended
//! attribute. Targets with no outputs store it on a sentinel file, and
//! filesystems without extended attributes degrade to a sidecar file next to
//! the outputs.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use tracing::{instrument, trace, warn};

use crate::{
    config::Configuration,
    fs,
    hash::{Digest, HashAlgorithm},
    target::Target,
};

/// The five-part fingerprint persisted per target.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Fingerprint {
    /// Rule hash as of the pre-build phase.
    pub rule_pre: Digest,
    /// Rule hash after the post-build hook (equal to `rule_pre` when the
    /// target has none).
    pub rule_post: Digest,
    pub config: Digest,
    pub source: Digest,
    pub secret: Digest,
}

impl Fingerprint {
    /// Concatenate the five parts into the persisted byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.rule_pre.len() * 5);
        for part in [
            &self.rule_pre,
            &self.rule_post,
            &self.config,
            &self.source,
            &self.secret,
        ] {
            bytes.extend_from_slice(part.as_bytes());
        }
        bytes
    }

    /// Decode a persisted fingerprint.
    ///
    /// The current format is five digests; the legacy four-part format
    /// (without the secret hash) is tolerated and decodes with a zeroed
    /// secret part, which forces a rebuild for targets that now use secrets.
    pub fn decode(bytes: &[u8], algorithm: HashAlgorithm) -> Option<Self> {
        let size = algorithm.digest_size();
        let part = |i: usize| Digest::new(bytes[i * size..(i + 1) * size].to_vec());
        if bytes.len() == 5 * size {
            Some(Self {
                rule_pre: part(0),
                rule_post: part(1),
                config: part(2),
                source: part(3),
                secret: part(4),
            })
        } else if bytes.len() == 4 * size {
            Some(Self {
                rule_pre: part(0),
                rule_post: part(1),
                config: part(2),
                source: part(3),
                secret: Digest::new(vec![0u8; size]),
            })
        } else {
            None
        }
    }
}

/// Extended attribute under which fingerprints are stored.
pub fn xattr_name(algorithm: HashAlgorithm) -> String {
    format!("user.plz_build{}", algorithm.xattr_suffix())
}

/// The file a fingerprint is read from: the first declared output, or the
/// sentinel file for output-less targets.
fn fingerprint_source(config: &Configuration, target: &Target) -> PathBuf {
    let out_dir = target.out_dir(config);
    match target.declared_outputs().first() {
        Some(output) => out_dir.join(output),
        None => out_dir.join(target.sentinel_file_name()),
    }
}

fn sidecar_path(config: &Configuration, target: &Target) -> PathBuf {
    target.out_dir(config).join(target.sidecar_file_name())
}

/// Persist the fingerprint on every output (and the metadata file).
///
/// Attribute writes that fail degrade to a sidecar file; they are never
/// fatal to the build.
#[instrument(skip_all, fields(target = %target.label))]
pub async fn write(config: &Configuration, target: &Target, fingerprint: &Fingerprint) -> Result<()> {
    let bytes = fingerprint.encode();
    let name = xattr_name(config.hash_algorithm);
    let out_dir = target.out_dir(config);

    let mut files: Vec<PathBuf> = target
        .all_outputs()
        .iter()
        .map(|output| out_dir.join(output))
        .collect();
    let metadata_file = out_dir.join(target.metadata_file_name());
    if fs::metadata(&metadata_file).await?.is_some() {
        files.push(metadata_file);
    }
    if files.is_empty() {
        let sentinel = out_dir.join(target.sentinel_file_name());
        fs::write(&sentinel, b"").await?;
        files.push(sentinel);
    }

    let mut all_attached = config.xattrs_enabled;
    if config.xattrs_enabled {
        for file in &files {
            if !set_attr(file, &name, &bytes) {
                all_attached = false;
            }
        }
    }
    if !all_attached {
        fs::write(sidecar_path(config, target), &bytes).await?;
    }
    Ok(())
}

/// Read the stored fingerprint, if any.
#[instrument(skip_all, fields(target = %target.label))]
pub async fn read(config: &Configuration, target: &Target) -> Result<Option<Fingerprint>> {
    let name = xattr_name(config.hash_algorithm);
    let source = fingerprint_source(config, target);
    if config.xattrs_enabled {
        if let Some(bytes) = get_attr(&source, &name) {
            return Ok(Fingerprint::decode(&bytes, config.hash_algorithm).or_else(|| {
                warn!(?source, "discarding malformed fingerprint attribute");
                None
            }));
        }
    }
    match fs::read_buffered(sidecar_path(config, target)).await? {
        Some(bytes) => Ok(Fingerprint::decode(&bytes, config.hash_algorithm)),
        None => Ok(None),
    }
}

#[cfg(unix)]
fn get_attr(path: &Path, name: &str) -> Option<Vec<u8>> {
    xattr::get(path, name).ok().flatten()
}

/// Attach the fingerprint attribute, retrying once through a chmod for
/// read-only outputs. Returns whether the attribute stuck.
#[cfg(unix)]
fn set_attr(path: &Path, name: &str, bytes: &[u8]) -> bool {
    match xattr::set(path, name, bytes) {
        Ok(()) => true,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            use std::os::unix::fs::PermissionsExt;
            let Ok(meta) = std::fs::metadata(path) else {
                return false;
            };
            let original = meta.permissions();
            let mut writable = original.clone();
            writable.set_mode(original.mode() | 0o200);
            if std::fs::set_permissions(path, writable).is_err() {
                return false;
            }
            let attached = xattr::set(path, name, bytes).is_ok();
            let _ = std::fs::set_permissions(path, original);
            attached
        }
        Err(err) => {
            trace!(?path, %err, "could not attach fingerprint attribute");
            false
        }
    }
}

#[cfg(not(unix))]
fn get_attr(_path: &Path, _name: &str) -> Option<Vec<u8>> {
    None
}

#[cfg(not(unix))]
fn set_attr(_path: &Path, _name: &str, _bytes: &[u8]) -> bool {
    false
}
