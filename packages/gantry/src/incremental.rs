//! The incrementality engine.
//!
//! Four orthogonal hashes decide whether a target needs building: the rule
//! hash (its definition), the configuration hash (global build state), the
//! source hash (resolved input contents) and the secret hash. Together with
//! the post-build variant of the rule hash they form the [`Fingerprint`]
//! persisted on outputs.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument};

use crate::{
    config::Configuration,
    fingerprint::{self, Fingerprint},
    fs,
    graph::Graph,
    hash::Digest,
    hasher::PathHasher,
    metadata,
    target::{BuildInput, Target, TargetNode},
};

/// Bytes folded into the secret hash for a declared-but-missing secret.
/// A missing secret is not yet an error; only an attempt to use it is.
const MISSING_SECRET_SENTINEL: &[u8] = b"!missing!";

/// A resolved source or tool of a target.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SourcePair {
    /// Absolute path of the file on disk.
    pub src: PathBuf,

    /// Repo-relative display form, folded into the source hash.
    pub rel: PathBuf,

    /// Destination relative to the target's temp directory.
    pub tmp_dest: PathBuf,

    /// Named source group this input was declared under, if any.
    pub group: Option<String>,

    pub is_tool: bool,
}

/// Resolve a target's sources (and optionally tools) in declaration order.
///
/// File inputs resolve to themselves; target inputs resolve to the declared
/// outputs of that target within its output directory.
pub fn resolved_sources(
    config: &Configuration,
    graph: &Graph,
    target: &Target,
    include_tools: bool,
) -> Result<Vec<SourcePair>> {
    let mut pairs = Vec::new();
    let mut resolve = |input: &BuildInput, is_tool: bool, group: Option<&str>| -> Result<()> {
        match input {
            BuildInput::File(path) => {
                pairs.push(SourcePair {
                    src: config.repo_root.join(path),
                    rel: path.clone(),
                    tmp_dest: path.clone(),
                    group: group.map(ToOwned::to_owned),
                    is_tool,
                });
                Ok(())
            }
            BuildInput::Target(label) => {
                let node = graph.target_or_die(label)?;
                let (out_dir, package, outputs) =
                    node.with(|dep| (dep.out_dir(config), dep.label.package.clone(), dep.all_outputs()));
                for output in outputs {
                    let rel = Path::new(&package).join(&output);
                    pairs.push(SourcePair {
                        src: out_dir.join(&output),
                        rel: rel.clone(),
                        tmp_dest: rel,
                        group: group.map(ToOwned::to_owned),
                        is_tool,
                    });
                }
                Ok(())
            }
        }
    };
    for input in &target.sources {
        resolve(input, false, None)?;
    }
    for (name, group) in &target.named_sources {
        for input in group {
            resolve(input, false, Some(name.as_str()))?;
        }
    }
    if include_tools {
        for input in &target.tools {
            resolve(input, true, None)?;
        }
    }
    Ok(pairs)
}

/// Compute the rule hash: a digest over every field of the target definition
/// that could affect its output.
///
/// Dependency labels are folded, not their hashes; dependency changes are
/// tracked separately through the source hash and build states. Maps are
/// folded in sorted key order, and booleans as distinct byte values so a
/// flipped flag can never alias an absent one.
pub fn rule_hash(config: &Configuration, target: &Target) -> Digest {
    let mut h = config.hash_algorithm.hasher();
    h.update_str(target.label.to_string());
    for dep in &target.deps {
        h.update_str(dep.to_string());
    }
    for visibility in &target.visibility {
        h.update_str(visibility);
    }
    for pin in &target.pinned_hashes {
        h.update_str(pin);
    }
    for source in &target.sources {
        h.update_str(source.to_string());
    }
    for (name, group) in &target.named_sources {
        h.update_str(name);
        for source in group {
            h.update_str(source.to_string());
        }
    }
    for tool in &target.tools {
        h.update_str(tool.to_string());
    }
    for output in &target.outputs {
        h.update_str(output);
    }
    for (name, group) in &target.named_outputs {
        h.update_str(name);
        for output in group {
            h.update_str(output);
        }
    }
    for licence in &target.licences {
        h.update_str(licence);
    }
    for optional in &target.optional_outputs {
        h.update_str(optional);
    }
    for label in &target.labels {
        h.update_str(label);
    }
    for secret in &target.secrets {
        h.update_str(secret);
    }
    h.update_bool(target.is_binary);
    h.update_bool(target.is_test);
    h.update_bool(target.is_filegroup());
    h.update_bool(matches!(target.kind, crate::target::TargetKind::RemoteFile));
    h.update_bool(matches!(target.kind, crate::target::TargetKind::TextFile));
    // Later additions fold only when set, to avoid invalidating fingerprints
    // of targets that never use them.
    h.update_opt_bool(matches!(
        target.kind,
        crate::target::TargetKind::HashFilegroup
    ));
    h.update_opt_bool(target.local_only);
    h.update_opt_bool(target.sandbox);
    h.update_opt_bool(target.stamp);
    h.update_opt_bool(target.exit_on_error);
    h.update_opt_bool(target.needs_transitive_deps);
    h.update_opt_bool(target.output_is_complete);
    h.update_str(&target.command);
    if let Some(test_command) = &target.test_command {
        h.update_str(test_command);
    }
    for url in &target.urls {
        h.update_str(url);
    }
    for key in &target.pass_env {
        h.update_str(key);
        h.update_str(std::env::var(key).unwrap_or_default());
    }
    for dir in &target.output_dirs {
        h.update_str(dir);
    }
    for (name, entry) in &target.entry_points {
        h.update_str(name);
        h.update_str(entry);
    }
    for (key, value) in &target.env {
        h.update_str(key);
        h.update_str(value);
    }
    if let Some(content) = &target.file_content {
        h.update_str(content);
    }
    h.update_bool(target.has_pre_build());
    h.update_bool(target.has_post_build());
    for (language, provided) in &target.provides {
        h.update_str(language);
        h.update_str(provided.to_string());
    }
    for required in &target.requires {
        h.update_str(required);
    }
    if let Some(srcs_file) = &target.srcs_file {
        h.update_str(srcs_file);
    }
    h.finish()
}

/// The rule hash, memoized on the target node. Hooks invalidate the memo
/// when they mutate the target.
pub fn cached_rule_hash(config: &Configuration, node: &TargetNode) -> Digest {
    node.with_mut(|target| {
        if let Some(hash) = &target.rule_hash {
            return hash.clone();
        }
        let hash = rule_hash(config, target);
        target.rule_hash = Some(hash.clone());
        hash
    })
}

/// Fold the contents of every resolved source and tool, in declaration
/// order, together with their path strings.
#[instrument(skip_all, fields(target = %target.label))]
pub async fn source_hash(
    config: &Configuration,
    graph: &Graph,
    hasher: &PathHasher,
    target: &Target,
) -> Result<Digest> {
    let mut h = hasher.new_hash();
    for pair in resolved_sources(config, graph, target, true)? {
        let digest = hasher
            .hash(&pair.src, false, false, false)
            .await
            .with_context(|| format!("hash source {:?} of {}", pair.rel, target.label))?;
        h.update(digest);
        h.update_str(pair.rel.to_string_lossy());
    }
    Ok(h.finish())
}

/// Resolve a secret path: absolute, or `~`-relative to the home directory.
pub fn resolve_secret(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => PathBuf::from(std::env::var("HOME").unwrap_or_default()).join(rest),
        None => PathBuf::from(path),
    }
}

/// Fold the content hashes of all declared secrets. Missing secrets fold a
/// fixed sentinel instead of failing.
#[instrument(skip_all, fields(target = %target.label))]
pub async fn secret_hash(
    config: &Configuration,
    hasher: &PathHasher,
    target: &Target,
) -> Result<Digest> {
    let mut h = hasher.new_hash();
    for secret in &target.secrets {
        let path = resolve_secret(secret);
        if fs::metadata(&path).await?.is_none() {
            h.update(MISSING_SECRET_SENTINEL);
            continue;
        }
        let digest = hasher
            .hash(&path, false, false, false)
            .await
            .with_context(|| format!("hash secret {secret} of {}", target.label))?;
        h.update(digest);
    }
    Ok(h.finish())
}

/// Combined hash of a target's outputs on disk.
///
/// Each file's hash folds in declaration order, followed by its name.
/// When the target pins hashes the name is omitted so a single-file pin
/// stays meaningful.
#[instrument(skip_all, fields(target = %target.label))]
pub async fn output_hash(
    config: &Configuration,
    hasher: &PathHasher,
    target: &Target,
    force: bool,
) -> Result<Digest> {
    let out_dir = target.out_dir(config);
    let mut h = hasher.new_hash();
    for output in target.all_outputs() {
        let digest = hasher
            .hash(out_dir.join(&output), force, true, false)
            .await
            .with_context(|| format!("hash output {output} of {}", target.label))?;
        h.update(digest);
        if target.pinned_hashes.is_empty() {
            h.update_str(&output);
        }
    }
    Ok(h.finish())
}

/// The full target hash: rule, configuration, source and secret hashes
/// folded together.
pub async fn target_hash(
    config: &Configuration,
    graph: &Graph,
    hasher: &PathHasher,
    node: &TargetNode,
) -> Result<Digest> {
    let target = node.snapshot();
    let mut h = config.hash_algorithm.hasher();
    h.update(cached_rule_hash(config, node));
    h.update(config.config_hash());
    h.update(source_hash(config, graph, hasher, &target).await?);
    h.update(secret_hash(config, hasher, &target).await?);
    Ok(h.finish())
}

/// The short cache key: a quarter-length fold of the full target hash.
pub async fn short_target_hash(
    config: &Configuration,
    graph: &Graph,
    hasher: &PathHasher,
    node: &TargetNode,
) -> Result<Digest> {
    Ok(target_hash(config, graph, hasher, node).await?.fold_quarter())
}

/// Decide whether a target must be (re)built.
///
/// `post_build_phase` selects which of the two persisted rule hashes to
/// compare against; a post-build hook can change the rule, so the engine
/// checks once before the hook runs and once after.
#[instrument(skip_all, fields(target = %node.label(), post_build_phase, forced))]
pub async fn needs_building(
    config: &Configuration,
    graph: &Graph,
    hasher: &PathHasher,
    node: &TargetNode,
    post_build_phase: bool,
    forced: bool,
) -> Result<bool> {
    let target = node.snapshot();

    // A dependency that changed this run forces a rebuild; targets that
    // need their whole transitive closure inspect all of it.
    let deps = if target.needs_transitive_deps {
        graph.transitive_dependencies(&target)?
    } else {
        graph.dependencies(&target)?
    };
    for dep in deps {
        if dep.state().outputs_changed() {
            debug!(dep = %dep.label(), "rebuilding: dependency changed");
            return Ok(true);
        }
    }

    if metadata::load(config, &target).await.unwrap_or_default().is_none() {
        debug!("rebuilding: no build metadata");
        return Ok(true);
    }

    let Some(stored) = fingerprint::read(config, &target).await? else {
        debug!("rebuilding: no stored fingerprint");
        return Ok(true);
    };
    let rule = cached_rule_hash(config, node);
    let stored_rule = if post_build_phase {
        &stored.rule_post
    } else {
        &stored.rule_pre
    };
    if stored_rule != &rule {
        debug!("rebuilding: rule hash changed");
        return Ok(true);
    }
    if stored.config != config.config_hash() {
        debug!("rebuilding: configuration changed");
        return Ok(true);
    }
    if stored.source != source_hash(config, graph, hasher, &target).await? {
        debug!("rebuilding: sources changed");
        return Ok(true);
    }
    if stored.secret != secret_hash(config, hasher, &target).await? {
        debug!("rebuilding: secrets changed");
        return Ok(true);
    }

    let out_dir = target.out_dir(config);
    for output in target.declared_outputs() {
        if fs::symlink_metadata(out_dir.join(&output)).await?.is_none() {
            debug!(%output, "rebuilding: output missing");
            return Ok(true);
        }
    }

    if forced {
        debug!("rebuilding: forced");
        return Ok(true);
    }
    Ok(false)
}

/// Build the five-part fingerprint for persisting after a build.
pub async fn make_fingerprint(
    config: &Configuration,
    graph: &Graph,
    hasher: &PathHasher,
    node: &TargetNode,
    rule_pre: Digest,
) -> Result<Fingerprint> {
    let target = node.snapshot();
    Ok(Fingerprint {
        rule_pre,
        rule_post: cached_rule_hash(config, node),
        config: config.config_hash(),
        source: source_hash(config, graph, hasher, &target).await?,
        secret: secret_hash(config, hasher, &target).await?,
    })
}
