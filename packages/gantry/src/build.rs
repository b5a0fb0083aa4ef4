//! The build executor.
//!
//! [`Builder::build`] runs one target through the full pipeline: validation,
//! hooks, staleness check, cache mediation, source preparation, command
//! execution, output collection and fingerprinting. The external scheduler
//! hands targets to workers only after their dependencies reached a terminal
//! state; locking, retrieval and hashing all happen here.

use std::{
    collections::{HashMap, HashSet},
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
};

use color_eyre::{
    Report, Result,
    eyre::{Context, ContextCompat, bail, eyre},
};
use futures::{FutureExt, future::BoxFuture};
use glob::Pattern;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::{
    audit::Audit,
    cache::Cache,
    config::Configuration,
    exec::{self, ExecOutput},
    fetch::Fetcher,
    filegroup::{self, FilegroupSynchronizer},
    fingerprint,
    fs,
    graph::Graph,
    hash::Digest,
    hasher::PathHasher,
    incremental,
    label::BuildLabel,
    metadata::{self, BuildMetadata},
    subst,
    target::{BuildState, Target, TargetKind, TargetNode},
};

/// Sentinel error: stop this target cleanly. Not a failure; outputs already
/// on disk are preserved and the target ends up [`BuildState::Stopped`].
#[derive(Copy, Clone, Debug, derive_more::Display)]
#[display("stopping build")]
pub struct BuildStopped;

impl std::error::Error for BuildStopped {}

/// Error marker attributing a failure to a dependency rather than the
/// target itself.
#[derive(Clone, Debug, derive_more::Display)]
#[display("dependency {_0} failed")]
pub struct DependencyFailure(pub BuildLabel);

impl std::error::Error for DependencyFailure {}

/// Hook for delegating builds to a remote execution service.
pub trait RemoteExecutor: Send + Sync {
    /// Build the target remotely and return its metadata. Outputs may stay
    /// remote until [`RemoteExecutor::download_outputs`] is called.
    fn execute<'a>(
        &'a self,
        config: &'a Configuration,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<BuildMetadata>>;

    /// Materialize a remotely built target's outputs locally.
    fn download_outputs<'a>(
        &'a self,
        config: &'a Configuration,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Registered owner of an output path, for duplicate detection.
struct OutputOwner {
    label: BuildLabel,
    is_filegroup: bool,
}

/// The per-invocation build executor.
pub struct Builder<C> {
    config: Arc<Configuration>,
    graph: Arc<Graph>,
    hasher: Arc<PathHasher>,
    filegroups: FilegroupSynchronizer,
    fetcher: Fetcher,
    cache: Option<C>,
    audit: Option<Audit>,
    remote: Option<Arc<dyn RemoteExecutor>>,
    prepare_only: bool,
    rebuild: bool,
    originals: HashSet<BuildLabel>,
    output_owners: StdMutex<HashMap<PathBuf, OutputOwner>>,
    fatal: AtomicBool,
}

impl<C: Cache> Builder<C> {
    pub fn new(config: Arc<Configuration>, graph: Arc<Graph>, cache: Option<C>) -> Result<Self> {
        let hasher = Arc::new(PathHasher::new(&config));
        let audit = match &config.audit_dir {
            Some(dir) => Some(Audit::new(dir)?),
            None => None,
        };
        Ok(Self {
            filegroups: FilegroupSynchronizer::new(hasher.clone()),
            fetcher: Fetcher::new(&config)?,
            hasher,
            cache,
            audit,
            remote: None,
            prepare_only: false,
            rebuild: false,
            originals: HashSet::new(),
            output_owners: StdMutex::new(HashMap::new()),
            fatal: AtomicBool::new(false),
            config,
            graph,
        })
    }

    /// Delegate builds to a remote executor.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Lay out sources and stop instead of building.
    pub fn with_prepare_only(mut self, prepare_only: bool) -> Self {
        self.prepare_only = prepare_only;
        self
    }

    /// Force a rebuild of the original targets.
    pub fn with_rebuild(mut self, rebuild: bool) -> Self {
        self.rebuild = rebuild;
        self
    }

    /// Mark the targets the user asked for directly; prepare-only and
    /// forced-rebuild semantics apply to these.
    pub fn with_originals(mut self, originals: impl IntoIterator<Item = BuildLabel>) -> Self {
        self.originals.extend(originals);
        self
    }

    pub fn hasher(&self) -> &Arc<PathHasher> {
        &self.hasher
    }

    /// Whether a fatal condition (licence violation, duplicate outputs)
    /// should stop the scheduler from handing out further work.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Build one target to completion. Dependencies must already be in a
    /// terminal state.
    #[instrument(skip(self), fields(label = %label))]
    pub async fn build(&self, label: &BuildLabel) -> Result<BuildState> {
        let node = self.graph.target_or_die(label)?;
        // Walk the state machine forward. The scheduler normally performs
        // the first transitions when it queues the target.
        node.try_advance(BuildState::Inactive, BuildState::Active);
        node.try_advance(BuildState::Active, BuildState::Pending);
        if !node.try_advance(BuildState::Pending, BuildState::Building) {
            let state = node.state();
            if state.is_terminal() {
                return Ok(state);
            }
            bail!("target {label} is already building");
        }

        let result = match std::panic::AssertUnwindSafe(self.build_target(&node))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                // A panic means a broken hook or invariant; stop the whole
                // build rather than carrying on with unknown state.
                self.fatal.store(true, Ordering::Release);
                Err(eyre!("panicked during build: {}", panic_message(&panic)))
            }
        };

        match result {
            Ok(state) => {
                debug!(%state, "build finished");
                node.set_state(state);
                Ok(state)
            }
            Err(err) if err.downcast_ref::<BuildStopped>().is_some() => {
                node.set_state(BuildState::Stopped);
                Ok(BuildState::Stopped)
            }
            Err(err) => {
                if let Err(remove_err) = self.remove_outputs(&node).await {
                    warn!(%remove_err, "failed to remove outputs of failed target");
                }
                let state = if err.downcast_ref::<DependencyFailure>().is_some() {
                    BuildState::DependencyFailed
                } else {
                    BuildState::Failed
                };
                node.set_state(state);
                Err(err.wrap_err(format!("build {label}")))
            }
        }
    }

    async fn build_target(&self, node: &TargetNode) -> Result<BuildState> {
        let label = node.label().clone();

        self.validate(node)?;

        if node.with(Target::has_pre_build) {
            self.graph.run_pre_build(node)?;
        }
        // The hook may have added dependencies; wait for all of them and
        // fail if any ended up failing.
        self.wait_for_dependencies(node).await?;

        let target = node.snapshot();
        if self.prepare_only && self.originals.contains(&label) && !target.is_filegroup() {
            self.prepare_sources(&target).await?;
            return Err(Report::new(BuildStopped));
        }

        if let Some(remote) = &self.remote {
            if !target.local_only {
                let built = remote
                    .execute(&self.config, &target)
                    .await
                    .context("remote execution")?;
                metadata::store(&self.config, &target, &built).await?;
                node.set_outputs_downloaded(false);
                return Ok(BuildState::BuiltRemotely);
            }
        }

        // Exclusive per-target file lock so concurrent build processes do
        // not collide. Released on every exit path when the lock drops.
        let lock = fs::LockFile::open(self.lock_path(&label)).await?;
        let lock = lock.lock().await?;
        let result = self.build_locked(node).await;
        if let Err(err) = lock.unlock().await {
            warn!(%err, "failed to unlock target lock");
        }
        result
    }

    async fn build_locked(&self, node: &TargetNode) -> Result<BuildState> {
        let config = &self.config;
        let target = node.snapshot();

        // Dependencies built remotely may not have their outputs locally
        // yet; download them before we reference them.
        if let Some(remote) = &self.remote {
            for dep in self.graph.dependencies(&target)? {
                let remote_state = matches!(
                    dep.state(),
                    BuildState::BuiltRemotely | BuildState::ReusedRemotely
                );
                if remote_state && !dep.outputs_downloaded() {
                    let dep_target = dep.snapshot();
                    remote
                        .download_outputs(config, &dep_target)
                        .await
                        .with_context(|| format!("download outputs of {}", dep_target.label))?;
                    dep.set_outputs_downloaded(true);
                }
            }
        }

        if target.is_filegroup() {
            let changed =
                filegroup::build_filegroup(config, &self.graph, &self.hasher, &self.filegroups, node)
                    .await?;
            let rule_pre = incremental::cached_rule_hash(config, node);
            let print =
                incremental::make_fingerprint(config, &self.graph, &self.hasher, node, rule_pre)
                    .await?;
            let target = node.snapshot();
            metadata::store(config, &target, &BuildMetadata::new(Vec::new())).await?;
            fingerprint::write(config, &target, &print).await?;
            return Ok(if changed {
                BuildState::Built
            } else {
                BuildState::Reused
            });
        }

        let forced = self.rebuild && self.originals.contains(node.label());
        if !incremental::needs_building(config, &self.graph, &self.hasher, node, false, forced)
            .await?
        {
            if target.has_post_build() {
                // Restore the prior run's state and replay the hook with its
                // recorded stdout; the hook may change the rule, so check
                // staleness a second time against the post-build rule hash.
                if let Some(prior) = metadata::load(config, &target).await.unwrap_or_default() {
                    node.with_mut(|t| t.discovered_outputs = prior.discovered_outputs());
                    self.graph.run_post_build(node, &prior.stdout)?;
                    if !incremental::needs_building(
                        config,
                        &self.graph,
                        &self.hasher,
                        node,
                        true,
                        forced,
                    )
                    .await?
                    {
                        return Ok(BuildState::Reused);
                    }
                }
            } else {
                return Ok(BuildState::Reused);
            }
        }

        // Hash the existing outputs before we mutate anything; failure just
        // means there is no prior output to compare against.
        let old_output_hash =
            incremental::output_hash(config, &self.hasher, &node.snapshot(), false)
                .await
                .ok();
        let rule_pre = incremental::cached_rule_hash(config, node);

        let pre_cache_key = match &self.cache {
            Some(_) if config.cache_enabled => Some(
                incremental::short_target_hash(config, &self.graph, &self.hasher, node).await?,
            ),
            _ => None,
        };
        if !forced {
            if let Some(key) = &pre_cache_key {
                if let Some(state) = self
                    .try_cache_retrieve(node, key, &rule_pre, old_output_hash.as_ref())
                    .await?
                {
                    return Ok(state);
                }
            }
        }

        let target = node.snapshot();
        for secret in &target.secrets {
            if fs::metadata(incremental::resolve_secret(secret)).await?.is_none() {
                bail!("secret {secret} of {} does not exist", target.label);
            }
        }

        let sources = self.prepare_sources(&target).await?;
        let tmp_dir = target.tmp_dir(config);

        let built = match target.kind {
            TargetKind::RemoteFile => {
                self.fetcher
                    .fetch(config, &self.hasher, self.audit.as_ref(), &target, &tmp_dir)
                    .await?;
                ExecOutput::default()
            }
            TargetKind::TextFile => {
                let outputs = target.declared_outputs();
                let [output] = outputs.as_slice() else {
                    bail!(
                        "text file {} must declare exactly one output",
                        target.label
                    );
                };
                let content = target
                    .file_content
                    .as_deref()
                    .with_context(|| format!("text file {} has no content", target.label))?;
                fs::write(tmp_dir.join(output), content).await?;
                ExecOutput::default()
            }
            _ => {
                let command =
                    subst::substitute(config, &self.graph, &self.hasher, &target, &target.command)
                        .await?;
                let stamp = target.stamp.then(|| rule_pre.clone());
                let env = exec::build_env(config, &target, &tmp_dir, &sources, stamp.as_ref());
                if let Some(audit) = &self.audit {
                    audit.record_build(node.label(), &env, &command);
                }
                exec::run_command(config, &target, &command, &env, &tmp_dir).await?
            }
        };

        if target.has_post_build() {
            self.graph.run_post_build(node, &built.stdout)?;
            self.wait_for_dependencies(node).await?;
        }

        let target = node.snapshot();
        let mut record = BuildMetadata::new(built.stdout);
        self.collect_outputs(&target, &tmp_dir).await?;
        self.sweep_optional_outputs(&target, &tmp_dir, &mut record)
            .await?;
        self.sweep_output_dirs(&target, &tmp_dir, &mut record).await?;
        node.with_mut(|t| t.discovered_outputs = record.discovered_outputs());

        self.check_licences(&target)?;

        let target = node.snapshot();
        let new_output_hash =
            incremental::output_hash(config, &self.hasher, &target, false).await?;
        self.verify_pinned_hashes(&target, &new_output_hash).await?;

        metadata::store(config, &target, &record).await?;
        let print =
            incremental::make_fingerprint(config, &self.graph, &self.hasher, node, rule_pre)
                .await?;
        fingerprint::write(config, &target, &print).await?;

        if let (Some(cache), Some(pre_key)) = (&self.cache, &pre_cache_key) {
            let post_key =
                incremental::short_target_hash(config, &self.graph, &self.hasher, node).await?;
            let out_dir = target.out_dir(config);
            // A post-build hook can change the key between retrieval and
            // store; keep the metadata reachable under the original key so
            // future runs can replay the hook before fetching artifacts.
            if target.has_post_build() && *pre_key != post_key {
                cache
                    .store(
                        &target,
                        pre_key,
                        &out_dir,
                        std::slice::from_ref(&target.metadata_file_name()),
                    )
                    .await?;
            }
            let mut files = target.all_outputs();
            files.push(target.metadata_file_name());
            cache.store(&target, &post_key, &out_dir, &files).await?;
        }

        if !config.keep_tmp_dirs {
            if let Err(err) = fs::remove_dir_all(&tmp_dir).await {
                warn!(%err, "failed to remove temp directory");
            }
        }

        self.build_links(&target).await?;

        Ok(if old_output_hash.as_ref() == Some(&new_output_hash) {
            BuildState::Unchanged
        } else {
            BuildState::Built
        })
    }

    /// Validation: visibility, output ownership and cross-target duplicate
    /// outputs. Duplicate-output violations are fatal to the whole build.
    fn validate(&self, node: &TargetNode) -> Result<()> {
        let target = node.snapshot();

        for dep in self.graph.dependencies(&target)? {
            let visible = dep.with(|d| is_visible(d, &target.label.package));
            if !visible {
                bail!(
                    "{} is not visible to {}",
                    dep.label(),
                    target.label
                );
            }
        }

        let outputs = target.declared_outputs();
        let mut seen = HashSet::new();
        for output in &outputs {
            let path = Path::new(output);
            if path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
            {
                bail!("output {output} of {} escapes its package", target.label);
            }
            if !seen.insert(output.clone()) {
                self.fatal.store(true, Ordering::Release);
                bail!("duplicate output {output} in {}", target.label);
            }
        }

        for input in target.all_sources() {
            if let crate::target::BuildInput::File(path) = input {
                if path.is_absolute()
                    || path
                        .components()
                        .any(|c| matches!(c, Component::ParentDir))
                {
                    bail!(
                        "source {} of {} is outside the repository",
                        path.display(),
                        target.label
                    );
                }
            }
        }

        let out_dir = target.out_dir(&self.config);
        let mut owners = self.output_owners.lock().expect("owner registry poisoned");
        for output in &outputs {
            let key = out_dir.join(output);
            match owners.get(&key) {
                Some(owner) if owner.label != target.label => {
                    if !(owner.is_filegroup && target.is_filegroup()) {
                        self.fatal.store(true, Ordering::Release);
                        bail!(
                            "output {output} is declared by both {} and {}",
                            owner.label,
                            target.label
                        );
                    }
                }
                _ => {
                    owners.insert(
                        key,
                        OutputOwner {
                            label: target.label.clone(),
                            is_filegroup: target.is_filegroup(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn wait_for_dependencies(&self, node: &TargetNode) -> Result<()> {
        let labels = node.with(Target::dependency_labels);
        for label in labels {
            let dep = self.graph.target_or_die(&label)?;
            let state = if dep.state().is_terminal() {
                dep.state()
            } else {
                debug!(dep = %label, "waiting for dependency");
                dep.wait_terminal().await
            };
            if state.is_failure() {
                return Err(Report::new(DependencyFailure(label)));
            }
        }
        Ok(())
    }

    /// Lay out the temp directory: symlink sources in, write the source
    /// list file if declared, and make sure the output directory exists.
    async fn prepare_sources(&self, target: &Target) -> Result<Vec<incremental::SourcePair>> {
        let tmp_dir = target.tmp_dir(&self.config);
        fs::remove_dir_all(&tmp_dir).await?;
        fs::create_dir_all(&tmp_dir).await?;

        let pairs = incremental::resolved_sources(&self.config, &self.graph, target, true)?;
        for pair in &pairs {
            if pair.is_tool {
                continue;
            }
            fs::symlink(&pair.src, tmp_dir.join(&pair.tmp_dest))
                .await
                .with_context(|| format!("link source {}", pair.rel.display()))?;
        }
        if let Some(srcs_file) = &target.srcs_file {
            let listing: Vec<String> = pairs
                .iter()
                .filter(|pair| !pair.is_tool)
                .map(|pair| pair.tmp_dest.to_string_lossy().into_owned())
                .collect();
            fs::write(tmp_dir.join(srcs_file), listing.join("\n")).await?;
        }
        fs::create_dir_all(target.out_dir(&self.config)).await?;
        Ok(pairs)
    }

    /// Attempt to satisfy the build from the cache. Returns the final state
    /// on a usable hit; `None` falls through to a local build.
    async fn try_cache_retrieve(
        &self,
        node: &TargetNode,
        pre_key: &Digest,
        rule_pre: &Digest,
        old_output_hash: Option<&Digest>,
    ) -> Result<Option<BuildState>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let config = &self.config;
        let target = node.snapshot();
        let out_dir = target.out_dir(config);
        let metadata_name = target.metadata_file_name();

        // Metadata first: it names the post-hoc outputs we need to ask the
        // cache for, and replaying a post-build hook may change the key the
        // artifacts live under.
        if !cache
            .retrieve(
                &target,
                pre_key,
                &out_dir,
                std::slice::from_ref(&metadata_name),
            )
            .await?
        {
            return Ok(None);
        }
        let Some(prior) = metadata::load(config, &target).await.unwrap_or_default() else {
            return Ok(None);
        };
        node.with_mut(|t| t.discovered_outputs = prior.discovered_outputs());

        let key = if target.has_post_build() {
            self.graph.run_post_build(node, &prior.stdout)?;
            incremental::short_target_hash(config, &self.graph, &self.hasher, node).await?
        } else {
            pre_key.clone()
        };

        let target = node.snapshot();
        let mut files = target.all_outputs();
        files.push(metadata_name);
        if !cache.retrieve(&target, &key, &out_dir, &files).await? {
            return Ok(None);
        }

        // Verify what actually landed on disk; corrupt artifacts are thrown
        // away and the target builds locally.
        let target = node.snapshot();
        let retrieved_hash =
            incremental::output_hash(config, &self.hasher, &target, true).await?;
        if !target.pinned_hashes.is_empty()
            && self
                .verify_pinned_hashes(&target, &retrieved_hash)
                .await
                .is_err()
        {
            warn!(target = %target.label, "cached artifacts failed verification; rebuilding");
            self.remove_outputs(node).await?;
            return Ok(None);
        }

        let print = incremental::make_fingerprint(
            config,
            &self.graph,
            &self.hasher,
            node,
            rule_pre.clone(),
        )
        .await?;
        fingerprint::write(config, &target, &print).await?;

        Ok(Some(if old_output_hash == Some(&retrieved_hash) {
            BuildState::Unchanged
        } else {
            BuildState::Cached
        }))
    }

    /// Move declared outputs from the temp directory into the output
    /// directory, touching only the ones whose content changed.
    async fn collect_outputs(&self, target: &Target, tmp_dir: &Path) -> Result<bool> {
        let out_dir = target.out_dir(&self.config);
        let mut moved = false;
        for output in target.declared_outputs() {
            let tmp_path = tmp_dir.join(&output);
            if fs::symlink_metadata(&tmp_path).await?.is_none() {
                bail!(
                    "rule {} failed to create output {output}",
                    target.label
                );
            }
            let new_digest = self.hasher.hash(&tmp_path, true, false, false).await?;
            let out_path = out_dir.join(&output);
            let old_digest = match fs::symlink_metadata(&out_path).await? {
                Some(_) => self.hasher.hash(&out_path, false, true, false).await.ok(),
                None => None,
            };
            if old_digest.as_ref() == Some(&new_digest) {
                debug!(%output, "output unchanged");
                continue;
            }
            fs::remove_file(&out_path).await?;
            fs::rename_or_copy(&tmp_path, &out_path).await?;
            self.hasher.move_hash(&tmp_path, &out_path);
            moved = true;
        }
        Ok(moved)
    }

    /// Match optional-output globs against the temp directory and move the
    /// hits into the output directory.
    async fn sweep_optional_outputs(
        &self,
        target: &Target,
        tmp_dir: &Path,
        record: &mut BuildMetadata,
    ) -> Result<()> {
        if target.optional_outputs.is_empty() {
            return Ok(());
        }
        let patterns: Vec<Pattern> = target
            .optional_outputs
            .iter()
            .map(|pattern| Pattern::new(pattern).context("parse optional output glob"))
            .collect::<Result<_>>()?;
        let out_dir = target.out_dir(&self.config);
        for file in files_under(tmp_dir)? {
            // Build definition files are excluded by basename wherever they
            // sit in the tree.
            let is_build_file = file
                .file_name()
                .map(|base| base.to_string_lossy())
                .is_some_and(|base| {
                    self.config
                        .build_file_names
                        .iter()
                        .any(|build_file| *build_file == base)
                });
            if is_build_file {
                continue;
            }
            let name = file.to_string_lossy();
            if patterns.iter().any(|pattern| pattern.matches(&name)) {
                fs::rename_or_copy(tmp_dir.join(&file), out_dir.join(&file)).await?;
                record.optional_outputs.push(name.into_owned());
            }
        }
        Ok(())
    }

    /// Sweep the contents of declared output directories into the output
    /// directory root.
    async fn sweep_output_dirs(
        &self,
        target: &Target,
        tmp_dir: &Path,
        record: &mut BuildMetadata,
    ) -> Result<()> {
        let out_dir = target.out_dir(&self.config);
        for dir in &target.output_dirs {
            let root = tmp_dir.join(dir);
            if fs::metadata(&root).await?.is_none() {
                bail!(
                    "rule {} failed to create output directory {dir}",
                    target.label
                );
            }
            for file in files_under(&root)? {
                fs::rename_or_copy(root.join(&file), out_dir.join(&file)).await?;
                record
                    .dir_outputs
                    .push(file.to_string_lossy().into_owned());
            }
        }
        Ok(())
    }

    fn check_licences(&self, target: &Target) -> Result<()> {
        for licence in &target.licences {
            if self
                .config
                .rejected_licences
                .iter()
                .any(|rejected| rejected.eq_ignore_ascii_case(licence))
            {
                self.fatal.store(true, Ordering::Release);
                bail!("licence {licence} of {} is rejected", target.label);
            }
        }
        if !self.config.accepted_licences.is_empty() && !target.licences.is_empty() {
            let accepted = target.licences.iter().any(|licence| {
                self.config
                    .accepted_licences
                    .iter()
                    .any(|accepted| accepted.eq_ignore_ascii_case(licence))
            });
            if !accepted {
                self.fatal.store(true, Ordering::Release);
                bail!(
                    "none of the licences of {} ({}) are accepted",
                    target.label,
                    target.licences.join(", ")
                );
            }
        }
        Ok(())
    }

    /// Check the final output hash against any pinned hashes. A pin may
    /// match the combined hash, or the raw file hash under SHA-1 or SHA-256
    /// for single-output rules.
    async fn verify_pinned_hashes(&self, target: &Target, combined: &Digest) -> Result<()> {
        if target.pinned_hashes.is_empty() {
            return Ok(());
        }
        let mut candidates = vec![combined.clone()];
        let outputs = target.all_outputs();
        if let [only] = outputs.as_slice() {
            let path = target.out_dir(&self.config).join(only);
            if let Some(content) = fs::read_buffered(&path).await? {
                for algorithm in [crate::hash::HashAlgorithm::Sha1, crate::hash::HashAlgorithm::Sha256] {
                    candidates.push(algorithm.hash_bytes(&content));
                }
            }
        }
        for pin in &target.pinned_hashes {
            if let Ok(pinned) = Digest::from_hex(pin) {
                if candidates.contains(&pinned) {
                    return Ok(());
                }
            }
        }
        let message = format!(
            "output hash of {} is {combined}, expected one of: {}",
            target.label,
            target.pinned_hashes.join(", ")
        );
        if self.config.strict_hash_verification {
            bail!(message);
        }
        warn!("{message}");
        Ok(())
    }

    /// Process `link:`/`hlink:`/`dlink:`/`dhlink:` labels: link each output
    /// (or the output directory itself for the `d*` variants) into the
    /// destination, expanding environment variables. Existing destinations
    /// are left untouched.
    async fn build_links(&self, target: &Target) -> Result<()> {
        let out_dir = target.out_dir(&self.config);
        for label in &target.labels {
            let (dest, hard, whole_dir) = if let Some(dest) = label.strip_prefix("link:") {
                (dest, false, false)
            } else if let Some(dest) = label.strip_prefix("hlink:") {
                (dest, true, false)
            } else if let Some(dest) = label.strip_prefix("dlink:") {
                (dest, false, true)
            } else if let Some(dest) = label.strip_prefix("dhlink:") {
                (dest, true, true)
            } else {
                continue;
            };
            let dest = subst::expand_env_vars(dest);
            let dest_root = if Path::new(&dest).is_absolute() {
                PathBuf::from(&dest)
            } else {
                self.config.repo_root.join(&dest)
            };

            if whole_dir {
                // Directories cannot be hard linked; both d-variants get a
                // symlink to the output directory.
                if fs::symlink_metadata(&dest_root).await?.is_none() {
                    fs::symlink(&out_dir, &dest_root).await?;
                }
                continue;
            }
            for output in target.all_outputs() {
                let name = Path::new(&output)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| output.clone());
                let link = dest_root.join(name);
                if fs::symlink_metadata(&link).await?.is_some() {
                    continue;
                }
                if hard {
                    fs::hard_link_or_copy(out_dir.join(&output), &link).await?;
                } else {
                    fs::symlink(out_dir.join(&output), &link).await?;
                }
            }
        }
        Ok(())
    }

    async fn remove_outputs(&self, node: &TargetNode) -> Result<()> {
        let target = node.snapshot();
        let out_dir = target.out_dir(&self.config);
        for output in target.all_outputs() {
            fs::remove_file(out_dir.join(&output)).await?;
        }
        fs::remove_file(metadata::path(&self.config, &target)).await?;
        Ok(())
    }

    fn lock_path(&self, label: &BuildLabel) -> PathBuf {
        let name = format!(
            "{}_{}.lock",
            label.package.replace('/', "_"),
            label.name
        );
        self.config.lock_dir().join(name)
    }
}

/// Whether `dep` may be depended on from `package`.
fn is_visible(dep: &Target, package: &str) -> bool {
    if dep.label.package == package {
        return true;
    }
    dep.visibility.iter().any(|visibility| {
        if visibility == "PUBLIC" {
            return true;
        }
        let spec = visibility.strip_prefix("//").unwrap_or(visibility);
        match spec.strip_suffix("/...") {
            Some(prefix) => {
                package == prefix || package.starts_with(&format!("{prefix}/"))
            }
            None => package == spec,
        }
    })
}

/// Relative paths of all regular files under `root`, in deterministic order.
fn files_under(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {root:?}"))?;
        if !entry.file_type().is_dir() {
            let rel = entry
                .path()
                .strip_prefix(root)
                .context("make path relative")?
                .to_path_buf();
            files.push(rel);
        }
    }
    Ok(files)
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
