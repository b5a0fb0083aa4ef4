//! Filegroup builds and the single-writer output synchronizer.
//!
//! Filegroups re-expose existing files at new paths. Several filegroups may
//! legitimately claim the same output file; the [`FilegroupSynchronizer`]
//! guarantees that exactly one build performs the link while the rest reuse
//! its recorded result.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use color_eyre::{
    Result,
    eyre::{Context, ContextCompat, bail},
};
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};

use crate::{
    config::Configuration,
    fs,
    graph::Graph,
    hasher::PathHasher,
    incremental::resolved_sources,
    target::{TargetKind, TargetNode},
};

/// Content of the sentinel module file hiding filegroup trees from Go tooling.
const GO_SENTINEL: &str = "module ignore\n";

/// Single-writer coordinator for filegroup outputs.
///
/// One instance exists per build invocation. The mutex is held for the full
/// duration of each link; contention is low because only filegroup builds
/// take it and I/O dominates everywhere else.
pub struct FilegroupSynchronizer {
    hasher: Arc<PathHasher>,
    built: Mutex<HashMap<PathBuf, bool>>,
}

impl FilegroupSynchronizer {
    pub fn new(hasher: Arc<PathHasher>) -> Self {
        Self {
            hasher,
            built: Mutex::new(HashMap::new()),
        }
    }

    /// Link `source` to `destination`, hard-linking by preference or copying
    /// when permissions must be preserved. Returns whether the destination
    /// changed. At most one link operation runs per destination per build.
    #[instrument(skip(self))]
    pub async fn link(&self, source: &Path, destination: &Path, copy: bool) -> Result<bool> {
        let mut built = self.built.lock().await;
        if let Some(&changed) = built.get(destination) {
            trace!(?destination, "already built by another filegroup");
            return Ok(changed);
        }

        if fs::symlink_metadata(source).await?.is_none() {
            bail!("filegroup source {source:?} does not exist");
        }
        let source_hash = self
            .hasher
            .hash(source, false, false, false)
            .await
            .context("hash filegroup source")?;

        if fs::is_same_inode(source, destination).await? {
            self.hasher.set(destination, source_hash);
            built.insert(destination.to_path_buf(), false);
            return Ok(false);
        }
        if fs::symlink_metadata(destination).await?.is_some() {
            let destination_hash = self.hasher.hash(destination, false, false, false).await.ok();
            if destination_hash.as_ref() == Some(&source_hash) {
                self.hasher.set(destination, source_hash);
                built.insert(destination.to_path_buf(), false);
                return Ok(false);
            }
            fs::remove_file(destination).await?;
        }

        if copy {
            fs::copy_file(source, destination).await?;
        } else {
            fs::hard_link_or_copy(source, destination).await?;
        }
        debug!(?source, ?destination, "linked filegroup output");
        self.hasher.set(destination, source_hash);
        built.insert(destination.to_path_buf(), true);
        Ok(true)
    }
}

/// Build a filegroup target: link every source to its output path.
/// Returns whether any output changed.
#[instrument(skip_all, fields(target = %node.label()))]
pub async fn build_filegroup(
    config: &Configuration,
    graph: &Graph,
    hasher: &PathHasher,
    synchronizer: &FilegroupSynchronizer,
    node: &TargetNode,
) -> Result<bool> {
    let target = node.snapshot();
    let pairs = resolved_sources(config, graph, &target, false)?;
    let declared = target.declared_outputs();
    let out_dir = target.out_dir(config);

    let mut changed = false;
    let mut produced = Vec::new();
    for (index, pair) in pairs.iter().enumerate() {
        let out_name = match target.kind {
            TargetKind::HashFilegroup => {
                let digest = hasher
                    .hash(&pair.src, false, false, false)
                    .await
                    .context("hash source for output name")?;
                hashed_name(&pair.src, &digest.to_string())?
            }
            _ => match declared.get(index) {
                Some(name) => name.clone(),
                None => file_name_of(&pair.src)?,
            },
        };
        let destination = out_dir.join(&out_name);
        changed |= synchronizer
            .link(&pair.src, &destination, target.is_binary)
            .await
            .with_context(|| format!("link output {out_name}"))?;
        produced.push(out_name);
    }

    // Hash filegroups compute their output names at build time; record them
    // so downstream hashing and cache storage see the real files.
    if target.kind == TargetKind::HashFilegroup {
        node.with_mut(|t| t.discovered_outputs = produced.clone());
    }

    if target.labels.iter().any(|l| l == "py") && !target.is_binary {
        ensure_py_init_files(&out_dir, &produced).await?;
    }
    if target.labels.iter().any(|l| l == "go") {
        let sentinel = out_dir.join("go.mod");
        if fs::metadata(&sentinel).await?.is_none() {
            fs::write(&sentinel, GO_SENTINEL).await?;
        }
    }
    Ok(changed)
}

/// Output name for a hash filegroup: the source name with the content hash
/// spliced in before the extension.
fn hashed_name(source: &Path, hash: &str) -> Result<String> {
    let name = file_name_of(source)?;
    Ok(match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-{hash}.{ext}"),
        None => format!("{name}-{hash}"),
    })
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("path has no file name: {path:?}"))
}

/// Create empty `__init__.py` files along the ancestry of each output so
/// dynamic loaders can resolve the packages.
async fn ensure_py_init_files(out_dir: &Path, outputs: &[String]) -> Result<()> {
    for output in outputs {
        let mut dir = out_dir.to_path_buf();
        let init = dir.join("__init__.py");
        if fs::metadata(&init).await?.is_none() {
            fs::write(&init, b"").await?;
        }
        let path = Path::new(output);
        for component in path.parent().unwrap_or_else(|| Path::new("")).components() {
            dir = dir.join(component);
            let init = dir.join("__init__.py");
            if fs::metadata(&init).await?.is_none() {
                fs::write(&init, b"").await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::Configuration,
        label::BuildLabel,
        target::{BuildInput, Target},
    };

    fn setup() -> (TempDir, Configuration, Arc<PathHasher>) {
        let temp = TempDir::new().unwrap();
        let config = Configuration::builder().repo_root(temp.path()).build();
        let hasher = Arc::new(PathHasher::new(&config));
        (temp, config, hasher)
    }

    #[tokio::test]
    async fn links_once_per_destination() {
        let (temp, _config, hasher) = setup();
        let synchronizer = FilegroupSynchronizer::new(hasher);
        let first = temp.path().join("first.txt");
        let second = temp.path().join("second.txt");
        let destination = temp.path().join("out/shared.txt");
        fs::write(&first, b"first").await.unwrap();
        fs::write(&second, b"second").await.unwrap();

        assert!(synchronizer.link(&first, &destination, false).await.unwrap());
        // The second writer gets the recorded result and the file keeps the
        // first writer's content.
        assert!(synchronizer.link(&second, &destination, false).await.unwrap());
        assert_eq!(
            fs::read_buffered(&destination).await.unwrap().unwrap(),
            b"first"
        );
    }

    #[tokio::test]
    async fn same_inode_is_a_no_op() {
        let (temp, _config, hasher) = setup();
        let synchronizer = FilegroupSynchronizer::new(hasher);
        let source = temp.path().join("file.txt");
        fs::write(&source, b"content").await.unwrap();

        assert!(!synchronizer.link(&source, &source, false).await.unwrap());
        assert_eq!(
            fs::read_buffered(&source).await.unwrap().unwrap(),
            b"content"
        );
    }

    #[tokio::test]
    async fn equal_content_across_inodes_is_unchanged() {
        let (temp, _config, hasher) = setup();
        let synchronizer = FilegroupSynchronizer::new(hasher);
        let source = temp.path().join("src.txt");
        let destination = temp.path().join("dst.txt");
        fs::write(&source, b"same bytes").await.unwrap();
        fs::write(&destination, b"same bytes").await.unwrap();

        assert!(!synchronizer.link(&source, &destination, false).await.unwrap());
    }

    #[tokio::test]
    async fn missing_source_fails() {
        let (temp, _config, hasher) = setup();
        let synchronizer = FilegroupSynchronizer::new(hasher);
        let missing = temp.path().join("nope.txt");
        let destination = temp.path().join("out.txt");
        assert!(synchronizer.link(&missing, &destination, false).await.is_err());
    }

    #[tokio::test]
    async fn filegroups_link_their_sources() {
        let (temp, config, hasher) = setup();
        let graph = Graph::new();
        let synchronizer = FilegroupSynchronizer::new(hasher.clone());
        fs::write(temp.path().join("pkg/data.txt"), b"payload")
            .await
            .unwrap();

        let node = graph
            .add_target(
                Target::builder()
                    .label(BuildLabel::new("pkg", "files"))
                    .kind(TargetKind::Filegroup)
                    .sources(vec![BuildInput::File(PathBuf::from("pkg/data.txt"))])
                    .outputs(vec!["data.txt".into()])
                    .build(),
            )
            .unwrap();

        let changed = build_filegroup(&config, &graph, &hasher, &synchronizer, &node)
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(
            fs::read_buffered(config.gen_dir().join("pkg/data.txt"))
                .await
                .unwrap()
                .unwrap(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn hash_filegroups_embed_the_content_hash() {
        let (temp, config, hasher) = setup();
        let graph = Graph::new();
        let synchronizer = FilegroupSynchronizer::new(hasher.clone());
        fs::write(temp.path().join("pkg/lib.js"), b"code").await.unwrap();

        let node = graph
            .add_target(
                Target::builder()
                    .label(BuildLabel::new("pkg", "hashed"))
                    .kind(TargetKind::HashFilegroup)
                    .sources(vec![BuildInput::File(PathBuf::from("pkg/lib.js"))])
                    .build(),
            )
            .unwrap();

        build_filegroup(&config, &graph, &hasher, &synchronizer, &node)
            .await
            .unwrap();
        let produced = node.with(|t| t.discovered_outputs.clone());
        assert_eq!(produced.len(), 1);
        let digest = hasher
            .hash(temp.path().join("pkg/lib.js"), false, false, false)
            .await
            .unwrap();
        assert_eq!(produced[0], format!("lib-{digest}.js"));
        assert!(
            fs::metadata(config.gen_dir().join("pkg").join(&produced[0]))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn py_filegroups_get_init_files() {
        let (temp, config, hasher) = setup();
        let graph = Graph::new();
        let synchronizer = FilegroupSynchronizer::new(hasher.clone());
        fs::write(temp.path().join("pkg/mod/util.py"), b"x = 1")
            .await
            .unwrap();

        let node = graph
            .add_target(
                Target::builder()
                    .label(BuildLabel::new("pkg", "pylib"))
                    .kind(TargetKind::Filegroup)
                    .sources(vec![BuildInput::File(PathBuf::from("pkg/mod/util.py"))])
                    .outputs(vec!["mod/util.py".into()])
                    .labels(vec!["py".into()])
                    .build(),
            )
            .unwrap();

        build_filegroup(&config, &graph, &hasher, &synchronizer, &node)
            .await
            .unwrap();
        let out_dir = config.gen_dir().join("pkg");
        assert!(fs::metadata(out_dir.join("__init__.py")).await.unwrap().is_some());
        assert!(
            fs::metadata(out_dir.join("mod/__init__.py"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn go_filegroups_get_a_module_sentinel() {
        let (temp, config, hasher) = setup();
        let graph = Graph::new();
        let synchronizer = FilegroupSynchronizer::new(hasher.clone());
        fs::write(temp.path().join("pkg/gen.go"), b"package gen")
            .await
            .unwrap();

        let node = graph
            .add_target(
                Target::builder()
                    .label(BuildLabel::new("pkg", "golib"))
                    .kind(TargetKind::Filegroup)
                    .sources(vec![BuildInput::File(PathBuf::from("pkg/gen.go"))])
                    .outputs(vec!["gen.go".into()])
                    .labels(vec!["go".into()])
                    .build(),
            )
            .unwrap();

        build_filegroup(&config, &graph, &hasher, &synchronizer, &node)
            .await
            .unwrap();
        assert_eq!(
            fs::read_buffered(config.gen_dir().join("pkg/go.mod"))
                .await
                .unwrap()
                .unwrap(),
            GO_SENTINEL.as_bytes()
        );
    }
}
