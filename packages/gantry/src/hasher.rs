//! Content-addressed path hashing with memoization.
//!
//! One [`PathHasher`] exists per build invocation. Workers race freely on it;
//! a per-path pending cell guarantees that concurrent requests for the same
//! path wait on a single computation. Hashes of files under the build output
//! root are additionally persisted as an extended attribute on the file so
//! later invocations can skip rehashing unchanged outputs.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::{Arc, RwLock},
};

use color_eyre::{Result, eyre::Context};
use tokio::{
    sync::{Mutex, OnceCell},
    task::spawn_blocking,
};
use tracing::{instrument, trace, warn};
use walkdir::WalkDir;

use crate::{
    config::Configuration,
    hash::{Digest, HashAlgorithm, StreamHasher},
};

/// Byte folded into hashes in place of symlink content.
const SYMLINK_SENTINEL: u8 = b'~';

/// Computes and memoizes stable content hashes for paths.
pub struct PathHasher {
    repo_root: PathBuf,
    out_root: PathBuf,
    tmp_root: PathBuf,
    algorithm: HashAlgorithm,
    xattrs_enabled: bool,
    memo: RwLock<HashMap<String, Digest>>,
    pending: Mutex<HashMap<String, Arc<OnceCell<Digest>>>>,
}

impl PathHasher {
    pub fn new(config: &Configuration) -> Self {
        Self {
            repo_root: config.repo_root.clone(),
            out_root: config.out_root_dir(),
            tmp_root: config.tmp_root(),
            algorithm: config.hash_algorithm,
            xattrs_enabled: config.xattrs_enabled,
            memo: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// A fresh streaming hasher keyed to the configured algorithm.
    pub fn new_hash(&self) -> StreamHasher {
        self.algorithm.hasher()
    }

    /// Hash the path, memoizing the result.
    ///
    /// - `recalc` bypasses the memo and any persisted attribute.
    /// - `store` persists the digest as an extended attribute when the path
    ///   lies under the build output root, and trusts an existing attribute.
    /// - `hash_mtime` hashes the modification time instead of the contents.
    ///
    /// A path that does not exist fails with an error and is not memoized;
    /// it may come into existence later.
    #[instrument(skip(self))]
    pub async fn hash(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
        recalc: bool,
        store: bool,
        hash_mtime: bool,
    ) -> Result<Digest> {
        let path = path.as_ref();
        let key = self.memo_key(path);
        if !recalc {
            let memo = self.memo.read().expect("hasher memo poisoned");
            if let Some(digest) = memo.get(&key) {
                return Ok(digest.clone());
            }
        }

        // Single flight: concurrent callers share one pending cell per path.
        let cell = {
            let mut pending = self.pending.lock().await;
            if recalc {
                pending.remove(&key);
            }
            pending
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| self.compute(path.to_path_buf(), recalc, store, hash_mtime))
            .await
            .cloned();

        {
            let mut pending = self.pending.lock().await;
            if let Some(current) = pending.get(&key) {
                if Arc::ptr_eq(current, &cell) {
                    pending.remove(&key);
                }
            }
        }

        let digest = result?;
        self.memo
            .write()
            .expect("hasher memo poisoned")
            .insert(key, digest.clone());
        Ok(digest)
    }

    /// Inject a known digest, e.g. one computed while downloading.
    pub fn set(&self, path: impl AsRef<Path>, digest: Digest) {
        let key = self.memo_key(path.as_ref());
        trace!(%key, %digest, "set path hash");
        self.memo
            .write()
            .expect("hasher memo poisoned")
            .insert(key, digest);
    }

    /// Transfer the memoized entry from `old` to `new`. The old entry is
    /// kept unless it was under the temporary build directory.
    pub fn move_hash(&self, old: impl AsRef<Path>, new: impl AsRef<Path>) {
        let (old, new) = (old.as_ref(), new.as_ref());
        let old_key = self.memo_key(old);
        let new_key = self.memo_key(new);
        let mut memo = self.memo.write().expect("hasher memo poisoned");
        if let Some(digest) = memo.remove(&old_key) {
            if !old.starts_with(&self.tmp_root) {
                memo.insert(old_key, digest.clone());
            }
            memo.insert(new_key, digest);
        }
    }

    /// Memoized paths are keyed relative to the repo root so the same file
    /// hashes to the same entry no matter how it was addressed.
    fn memo_key(&self, path: &Path) -> String {
        path.strip_prefix(&self.repo_root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    async fn compute(
        &self,
        path: PathBuf,
        recalc: bool,
        store: bool,
        hash_mtime: bool,
    ) -> Result<Digest> {
        let ctx = ComputeContext {
            repo_root: self.repo_root.clone(),
            out_root: self.out_root.clone(),
            algorithm: self.algorithm,
            xattrs_enabled: self.xattrs_enabled,
        };
        spawn_blocking(move || compute_sync(&ctx, &path, recalc, store, hash_mtime))
            .await
            .context("join task")?
    }
}

struct ComputeContext {
    repo_root: PathBuf,
    out_root: PathBuf,
    algorithm: HashAlgorithm,
    xattrs_enabled: bool,
}

impl ComputeContext {
    fn xattr_name(&self) -> String {
        format!("user.plz_hash{}", self.algorithm.xattr_suffix())
    }
}

fn compute_sync(
    ctx: &ComputeContext,
    path: &Path,
    recalc: bool,
    store: bool,
    hash_mtime: bool,
) -> Result<Digest> {
    let meta = std::fs::symlink_metadata(path).with_context(|| format!("stat: {path:?}"))?;

    let persistable = store && ctx.xattrs_enabled && path.starts_with(&ctx.out_root);
    if persistable && !recalc {
        if let Some(digest) = read_xattr(path, &ctx.xattr_name(), ctx.algorithm.digest_size()) {
            trace!(?path, "trusted persisted hash");
            return Ok(digest);
        }
    }

    let digest = if hash_mtime {
        hash_mtime_of(ctx, path, &meta)?
    } else if meta.file_type().is_symlink() {
        hash_symlink(ctx, path)?
    } else if meta.is_dir() {
        hash_dir(ctx, path)?
    } else {
        hash_file(ctx, path)?
    };

    if persistable {
        write_xattr(path, &ctx.xattr_name(), &digest);
    }
    Ok(digest)
}

fn hash_file(ctx: &ComputeContext, path: &Path) -> Result<Digest> {
    let mut hasher = ctx.algorithm.hasher();
    fold_file(&mut hasher, path)?;
    Ok(hasher.finish())
}

fn fold_file(hasher: &mut StreamHasher, path: &Path) -> Result<()> {
    use std::io::Read;
    let mut file = std::fs::File::open(path).with_context(|| format!("open file: {path:?}"))?;
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let len = file.read(&mut buffer).context("read chunk")?;
        if len == 0 {
            return Ok(());
        }
        hasher.update(&buffer[..len]);
    }
}

/// Hash a symlink: a sentinel byte, then either the link's repo-relative
/// target (for links within the repo) or the dereferenced content (for links
/// to system tools outside it).
fn hash_symlink(ctx: &ComputeContext, path: &Path) -> Result<Digest> {
    let target = std::fs::read_link(path).with_context(|| format!("read link: {path:?}"))?;
    let resolved = if target.is_absolute() {
        normalize(&target)
    } else {
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        normalize(&parent.join(&target))
    };

    let mut hasher = ctx.algorithm.hasher();
    hasher.update([SYMLINK_SENTINEL]);
    if resolved.starts_with(&ctx.repo_root) {
        let rel = resolved
            .strip_prefix(&ctx.repo_root)
            .unwrap_or(&resolved)
            .to_string_lossy()
            .into_owned();
        hasher.update_str(rel);
    } else {
        // Points outside the repo; treat it as a system tool and hash what
        // it refers to.
        let content =
            std::fs::read(path).with_context(|| format!("dereference link: {path:?}"))?;
        hasher.update(&content);
    }
    Ok(hasher.finish())
}

/// Hash a directory: a deterministic walk folding each file's hash and each
/// symlink's sentinel. Directory names themselves do not contribute.
fn hash_dir(ctx: &ComputeContext, path: &Path) -> Result<Digest> {
    let mut hasher = ctx.algorithm.hasher();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk directory: {path:?}"))?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())
                .with_context(|| format!("read link: {:?}", entry.path()))?;
            if target.is_absolute() && !normalize(&target).starts_with(path) {
                warn!(link = ?entry.path(), ?target, "not following absolute symlink out of directory");
            }
            hasher.update([SYMLINK_SENTINEL]);
            hasher.update_str(target.to_string_lossy());
        } else {
            let digest = hash_file(ctx, entry.path())?;
            hasher.update(digest);
        }
    }
    Ok(hasher.finish())
}

/// Hash the modification time at second resolution instead of the contents.
fn hash_mtime_of(ctx: &ComputeContext, path: &Path, meta: &std::fs::Metadata) -> Result<Digest> {
    let mtime = meta
        .modified()
        .with_context(|| format!("read mtime: {path:?}"))?;
    let seconds = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .context("mtime precedes epoch")?
        .as_secs();
    let stamp = jiff::Timestamp::from_second(seconds as i64).context("format mtime")?;
    let mut hasher = ctx.algorithm.hasher();
    hasher.update_str(stamp.to_string());
    Ok(hasher.finish())
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(unix)]
fn read_xattr(path: &Path, name: &str, expected_size: usize) -> Option<Digest> {
    match xattr::get(path, name) {
        Ok(Some(bytes)) if bytes.len() == expected_size => Some(Digest::new(bytes)),
        _ => None,
    }
}

/// Persist the digest on the file. Failure is non-fatal; a permission error
/// on a read-only output gets one chmod-and-retry.
#[cfg(unix)]
fn write_xattr(path: &Path, name: &str, digest: &Digest) {
    match xattr::set(path, name, digest.as_bytes()) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            use std::os::unix::fs::PermissionsExt;
            let Ok(meta) = std::fs::metadata(path) else {
                return;
            };
            let original = meta.permissions();
            let mut writable = original.clone();
            writable.set_mode(original.mode() | 0o200);
            if std::fs::set_permissions(path, writable).is_ok() {
                if let Err(err) = xattr::set(path, name, digest.as_bytes()) {
                    warn!(?path, %err, "failed to persist hash attribute");
                }
                let _ = std::fs::set_permissions(path, original);
            }
        }
        Err(err) => warn!(?path, %err, "failed to persist hash attribute"),
    }
}

#[cfg(not(unix))]
fn read_xattr(_path: &Path, _name: &str, _expected_size: usize) -> Option<Digest> {
    None
}

#[cfg(not(unix))]
fn write_xattr(_path: &Path, _name: &str, _digest: &Digest) {}
