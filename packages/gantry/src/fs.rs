//! Filesystem operations tailored to the build core.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.

use std::{
    fmt::Debug as StdDebug,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use filetime::FileTime;
use fslock::LockFile as FsLockFile;
use tap::TapFallible;
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{instrument, trace, warn};

use crate::{Locked, Unlocked};

/// Shared lock file on the file system.
///
/// Lock the file with [`LockFile::lock`]. Unlock it with [`LockFile::unlock`],
/// or by dropping the locked instance.
#[derive(Debug, Clone, Display)]
#[display("{}", path.display())]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: PathBuf,
    #[debug(skip)]
    inner: Arc<Mutex<FsLockFile>>,
}

impl LockFile<Unlocked> {
    /// Create a new instance at the provided path.
    pub async fn open(path: impl AsRef<Path> + StdDebug) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }
        let (file, path) = spawn_blocking(move || FsLockFile::open(&path).map(|file| (file, path)))
            .await
            .context("join task")?
            .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Lock the lockfile. Blocks until the lock is acquired; target locks
    /// intentionally have no timeout.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                // fslock::LockFile can panic if the handle is already locked,
                // but the typestate makes locking a locked handle impossible.
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "locked file"))
    }
}

impl LockFile<Locked> {
    /// Unlock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "unlocked file"))
    }
}

/// Create the directory and all its parents, if they don't already exist.
///
/// If a plain file occupies a spot where a directory is needed, the file is
/// removed once and creation retried.
#[instrument]
pub async fn create_dir_all(dir: impl AsRef<Path> + StdDebug) -> Result<()> {
    let dir = dir.as_ref();
    match tokio::fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(stale) = stale_parent(dir).await {
                warn!(?stale, "removing stale file blocking directory creation");
                tokio::fs::remove_file(&stale)
                    .await
                    .with_context(|| format!("remove stale file: {stale:?}"))?;
                return tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("create dir: {dir:?}"));
            }
            Err(err).with_context(|| format!("create dir: {dir:?}"))
        }
    }
}

/// Find the nearest ancestor of `dir` (or `dir` itself) that exists on disk
/// as something other than a directory.
async fn stale_parent(dir: &Path) -> Option<PathBuf> {
    for ancestor in dir.ancestors() {
        if let Ok(meta) = tokio::fs::symlink_metadata(ancestor).await {
            if !meta.is_dir() {
                return Some(ancestor.to_path_buf());
            }
            return None;
        }
    }
    None
}

/// Write the provided file content to disk, creating parent directories.
#[instrument(skip(content))]
pub async fn write(path: impl AsRef<Path> + StdDebug, content: impl AsRef<[u8]>) -> Result<()> {
    let (path, content) = (path.as_ref(), content.as_ref());
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Buffer the file content from disk. Returns `None` if the file is missing.
#[instrument]
pub async fn read_buffered(path: impl AsRef<Path> + StdDebug) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk and parse it as UTF8.
#[instrument]
pub async fn read_buffered_utf8(path: impl AsRef<Path> + StdDebug) -> Result<Option<String>> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(buf) => Ok(Some(buf)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Get the metadata for a path, or `None` if it does not exist.
pub async fn metadata(path: impl AsRef<Path> + StdDebug) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("stat: {path:?}")),
    }
}

/// Get the metadata for a path without following symlinks, or `None` if it
/// does not exist.
pub async fn symlink_metadata(
    path: impl AsRef<Path> + StdDebug,
) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("lstat: {path:?}")),
    }
}

/// Remove the directory and all its contents. Missing directories are fine.
pub async fn remove_dir_all(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Remove a file or symlink. Missing files are fine.
pub async fn remove_file(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            trace!(?path, "removed file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
}

/// Copy the file from `src` to `dst`, preserving `mtime` and `atime` so the
/// incrementality checks of downstream tooling keep working.
#[instrument]
pub async fn copy_file(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    let mut src_file = tokio::fs::File::open(src.as_ref())
        .await
        .with_context(|| format!("open source file: {:?}", src.as_ref()))?;
    let src_meta = src_file.metadata().await.context("get source metadata")?;

    // If the stat times are unreadable, default to the epoch; the file then
    // simply looks old and gets rebuilt.
    let src_mtime = src_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let src_atime = src_meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
    if let Some(parent) = dst.as_ref().parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }

    let mut dst_file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(dst.as_ref())
        .await
        .with_context(|| format!("open destination file: {:?}", dst.as_ref()))?;
    let bytes = tokio::io::copy(&mut src_file, &mut dst_file)
        .await
        .context("copy file contents")?;
    trace!(?src, ?dst, ?bytes, "copy file");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = src_meta.permissions().mode();
        let mut permissions = dst_file.metadata().await.context("get metadata")?.permissions();
        permissions.set_mode(mode);
        dst_file
            .set_permissions(permissions)
            .await
            .context("set permissions")?;
    }

    let dst_file = dst_file.into_std().await;
    let mtime = FileTime::from_system_time(src_mtime);
    let atime = FileTime::from_system_time(src_atime);
    spawn_blocking(move || filetime::set_file_handle_times(&dst_file, Some(atime), Some(mtime)))
        .await
        .context("join task")?
        .context("set destination file times")
}

/// Move a file, falling back to copy-and-remove when the rename crosses
/// filesystems.
#[instrument]
pub async fn rename_or_copy(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
            copy_file(src, dst).await.context("copy across filesystems")?;
            remove_file(src).await
        }
        Err(err) => Err(err).context(format!("rename {src:?} to {dst:?}")),
    }
}

/// Hard-link a file, falling back to a metadata-preserving copy when linking
/// is not possible (cross-device, or unsupported by the filesystem).
#[instrument]
pub async fn hard_link_or_copy(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    match tokio::fs::hard_link(src, dst).await {
        Ok(()) => {
            trace!(?src, ?dst, "hard linked");
            Ok(())
        }
        Err(err) => {
            trace!(?src, ?dst, ?err, "hard link failed; copying");
            copy_file(src, dst).await
        }
    }
}

/// Create a symlink at `dst` pointing to `src`.
#[cfg(unix)]
#[instrument]
pub async fn symlink(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    match tokio::fs::symlink(src, dst).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            remove_file(dst).await?;
            tokio::fs::symlink(src, dst)
                .await
                .context(format!("symlink {src:?} to {dst:?}"))
        }
        Err(err) => Err(err).context(format!("symlink {src:?} to {dst:?}")),
    }
}

/// Report whether two paths refer to the same inode on the same device.
#[cfg(unix)]
pub async fn is_same_inode(
    a: impl AsRef<Path> + StdDebug,
    b: impl AsRef<Path> + StdDebug,
) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let (a_meta, b_meta) = (metadata(a.as_ref()).await?, metadata(b.as_ref()).await?);
    match (a_meta, b_meta) {
        (Some(a_meta), Some(b_meta)) => {
            Ok(a_meta.dev() == b_meta.dev() && a_meta.ino() == b_meta.ino())
        }
        _ => Ok(false),
    }
}
