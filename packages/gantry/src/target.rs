//! The build target data model and its state machine.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use bon::Builder;
use color_eyre::Result;
use derive_more::{Debug, Display};
use strum::FromRepr;
use tokio::sync::Notify;

use crate::{config::Configuration, hash::Digest, label::BuildLabel};

/// What kind of rule produced a target.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum TargetKind {
    /// A generic rule running a shell command.
    #[display("build")]
    Command,
    /// Re-exposes its inputs as outputs without running anything.
    #[display("filegroup")]
    Filegroup,
    /// A filegroup whose output names embed the content hash.
    #[display("hash_filegroup")]
    HashFilegroup,
    /// Downloads its outputs over HTTP.
    #[display("remote_file")]
    RemoteFile,
    /// Writes a literal string to its output.
    #[display("text_file")]
    TextFile,
}

/// One input to a build target.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum BuildInput {
    /// A file in the repository, relative to the repo root.
    #[display("{}", _0.display())]
    File(PathBuf),
    /// The outputs of another target.
    #[display("{_0}")]
    Target(BuildLabel),
}

/// Callback invoked immediately before a target builds; may mutate it.
pub trait PreBuildHook: Send + Sync {
    fn call(&self, target: &mut Target) -> Result<()>;
}

/// Callback invoked with the build's stdout after the command ran;
/// may mutate the target.
pub trait PostBuildHook: Send + Sync {
    fn call(&self, target: &mut Target, stdout: &[u8]) -> Result<()>;
}

/// The unit of build.
///
/// Targets are created by the parser, mutated only by their own pre/post
/// build hooks during their build, and otherwise read-only during the build
/// phase. All paths are relative to the repo root unless noted.
#[derive(Clone, Debug, Builder)]
pub struct Target {
    /// Canonical identifier.
    pub label: BuildLabel,

    /// What kind of rule this is.
    pub kind: TargetKind,

    /// Declared dependencies.
    #[builder(default)]
    pub deps: Vec<BuildLabel>,

    /// Ordered source inputs.
    #[builder(default)]
    pub sources: Vec<BuildInput>,

    /// Named source groups, exposed as `$SRCS_<NAME>`.
    #[builder(default)]
    pub named_sources: BTreeMap<String, Vec<BuildInput>>,

    /// Tools; participate in substitution with absolute paths.
    #[builder(default)]
    pub tools: Vec<BuildInput>,

    /// Declared output paths, relative to the target's output directory.
    #[builder(default)]
    pub outputs: Vec<String>,

    /// Named output groups.
    #[builder(default)]
    pub named_outputs: BTreeMap<String, Vec<String>>,

    /// Glob patterns matched after the build; absent matches are fine.
    #[builder(default)]
    pub optional_outputs: Vec<String>,

    /// Directories whose contents become outputs after the build.
    #[builder(default)]
    pub output_dirs: Vec<String>,

    /// The shell command. Empty for filegroup / remote-file / text-file.
    #[builder(into, default)]
    pub command: String,

    /// Test command; an empty one means "run the target's own binary".
    #[builder(into)]
    pub test_command: Option<String>,

    /// URLs for remote-file targets, tried in order.
    #[builder(default)]
    pub urls: Vec<String>,

    /// Literal content for text-file targets.
    #[builder(into)]
    pub file_content: Option<String>,

    /// Paths to secret files folded into the fingerprint but never cached.
    #[builder(default)]
    pub secrets: Vec<String>,

    /// Licences attached to this target.
    #[builder(default)]
    pub licences: Vec<String>,

    /// Freeform labels; `link:`/`remote_file:` prefixes carry semantics.
    #[builder(default)]
    pub labels: Vec<String>,

    /// Visibility declarations controlling who may depend on this target.
    #[builder(default)]
    pub visibility: Vec<String>,

    /// Environment variables passed through from the host.
    #[builder(default)]
    pub pass_env: Vec<String>,

    /// Environment overrides applied last.
    #[builder(default)]
    pub env: BTreeMap<String, String>,

    /// Entry points into this target's outputs.
    #[builder(default)]
    pub entry_points: BTreeMap<String, String>,

    /// Hex digests the final output hash must match.
    #[builder(default)]
    pub pinned_hashes: Vec<String>,

    /// Provided implementations keyed by language.
    #[builder(default)]
    pub provides: BTreeMap<String, BuildLabel>,

    /// Languages this target requires from its dependencies.
    #[builder(default)]
    pub requires: Vec<String>,

    /// File written into the temp dir listing the resolved sources.
    #[builder(into)]
    pub srcs_file: Option<String>,

    /// Human description; deliberately not part of the rule hash.
    #[builder(into)]
    pub description: Option<String>,

    #[builder(default)]
    pub is_binary: bool,

    #[builder(default)]
    pub is_test: bool,

    /// Never execute this target remotely.
    #[builder(default)]
    pub local_only: bool,

    /// Run the command under the configured sandbox tool.
    #[builder(default)]
    pub sandbox: bool,

    /// Expose a stable stamp of this target to its command.
    #[builder(default)]
    pub stamp: bool,

    /// Run the shell with `-e`.
    #[builder(default)]
    pub exit_on_error: bool,

    /// Rebuild when anything in the transitive closure changed.
    #[builder(default)]
    pub needs_transitive_deps: bool,

    /// The declared outputs are the complete output set.
    #[builder(default)]
    pub output_is_complete: bool,

    /// Pre-build hook capability; only its presence enters the rule hash.
    #[debug(skip)]
    pub pre_build: Option<Arc<dyn PreBuildHook>>,

    /// Post-build hook capability; only its presence enters the rule hash.
    #[debug(skip)]
    pub post_build: Option<Arc<dyn PostBuildHook>>,

    /// Memoized rule hash; cleared whenever a hook mutates the target.
    #[builder(skip)]
    pub rule_hash: Option<Digest>,

    /// Outputs discovered post-hoc from optional globs and output dirs.
    #[builder(skip)]
    pub discovered_outputs: Vec<String>,
}

impl Target {
    pub fn is_filegroup(&self) -> bool {
        matches!(self.kind, TargetKind::Filegroup | TargetKind::HashFilegroup)
    }

    pub fn has_pre_build(&self) -> bool {
        self.pre_build.is_some()
    }

    pub fn has_post_build(&self) -> bool {
        self.post_build.is_some()
    }

    /// All declared outputs: positional first, then named groups in key
    /// order.
    pub fn declared_outputs(&self) -> Vec<String> {
        let mut outs = self.outputs.clone();
        for group in self.named_outputs.values() {
            outs.extend(group.iter().cloned());
        }
        outs
    }

    /// Declared plus post-hoc discovered outputs.
    pub fn all_outputs(&self) -> Vec<String> {
        let mut outs = self.declared_outputs();
        outs.extend(self.discovered_outputs.iter().cloned());
        outs
    }

    /// All source inputs: positional first, then named groups in key order.
    pub fn all_sources(&self) -> Vec<BuildInput> {
        let mut sources = self.sources.clone();
        for group in self.named_sources.values() {
            sources.extend(group.iter().cloned());
        }
        sources
    }

    /// The full dependency set: declared deps plus every target referenced
    /// from sources and tools, deduplicated in first-seen order.
    pub fn dependency_labels(&self) -> Vec<BuildLabel> {
        let mut labels = Vec::new();
        let mut push = |label: &BuildLabel| {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        };
        for dep in &self.deps {
            push(dep);
        }
        for input in self.all_sources().iter().chain(self.tools.iter()) {
            if let BuildInput::Target(label) = input {
                push(label);
            }
        }
        labels
    }

    /// Absolute output directory for this target.
    pub fn out_dir(&self, config: &Configuration) -> PathBuf {
        let root = if self.is_binary {
            config.bin_dir()
        } else {
            config.gen_dir()
        };
        root.join(&self.label.package)
    }

    /// Absolute temp directory in which this target's command runs.
    pub fn tmp_dir(&self, config: &Configuration) -> PathBuf {
        config
            .tmp_root()
            .join(&self.label.package)
            .join(format!("{}._build", self.label.name))
    }

    /// Name of the build-metadata file within the output directory.
    pub fn metadata_file_name(&self) -> String {
        format!(".target_metadata_{}", self.label.name)
    }

    /// Name of the sentinel file carrying the fingerprint when the target
    /// has no outputs.
    pub fn sentinel_file_name(&self) -> String {
        format!(".target_sentinel_{}", self.label.name)
    }

    /// Name of the sidecar file used when extended attributes are
    /// unavailable.
    pub fn sidecar_file_name(&self) -> String {
        format!(".rule_hash_{}", self.label.name)
    }
}

/// Where a target is in its build lifecycle.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, strum::Display, FromRepr)]
pub enum BuildState {
    /// Not yet visited.
    Inactive = 0,
    /// Known to the build but not yet queued.
    Active,
    /// Queued, waiting for a worker.
    Pending,
    /// A worker is running the pipeline.
    Building,
    /// Stopped cleanly by the prepare-only sentinel; outputs preserved.
    Stopped,
    /// Built locally; outputs may differ from the prior run.
    Built,
    /// Restored from the cache; outputs may differ from the prior run.
    Cached,
    /// Rebuilt or restored, but outputs are identical to the prior run.
    Unchanged,
    /// Incremental check passed; nothing was rebuilt.
    Reused,
    /// Built by the remote executor.
    BuiltRemotely,
    /// Reused by the remote executor.
    ReusedRemotely,
    /// A dependency failed.
    DependencyFailed,
    /// This target failed.
    Failed,
}

impl BuildState {
    /// Terminal states end the target's lifecycle for this build.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            BuildState::Inactive | BuildState::Active | BuildState::Pending | BuildState::Building
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, BuildState::DependencyFailed | BuildState::Failed)
    }

    /// Whether downstream targets should assume this target's outputs may
    /// have changed this run.
    pub fn outputs_changed(self) -> bool {
        matches!(
            self,
            BuildState::Built | BuildState::Cached | BuildState::BuiltRemotely
        )
    }
}

/// A target plus its concurrent build bookkeeping, shared across workers.
#[derive(Debug)]
pub struct TargetNode {
    label: BuildLabel,
    state: AtomicU8,
    outputs_downloaded: AtomicBool,
    #[debug(skip)]
    terminal: Notify,
    #[debug(skip)]
    data: RwLock<Target>,
}

impl TargetNode {
    pub fn new(target: Target) -> Self {
        Self {
            label: target.label.clone(),
            state: AtomicU8::new(BuildState::Inactive as u8),
            outputs_downloaded: AtomicBool::new(true),
            terminal: Notify::new(),
            data: RwLock::new(target),
        }
    }

    pub fn label(&self) -> &BuildLabel {
        &self.label
    }

    pub fn state(&self) -> BuildState {
        BuildState::from_repr(self.state.load(Ordering::Acquire))
            .expect("state byte is always a valid BuildState")
    }

    /// Unconditionally set the state, waking terminal-state waiters.
    pub fn set_state(&self, state: BuildState) {
        self.state.store(state as u8, Ordering::Release);
        if state.is_terminal() {
            self.terminal.notify_waiters();
        }
    }

    /// Compare-and-set state transition. Returns whether the transition
    /// happened; used to move `Active → Pending` exactly once.
    pub fn try_advance(&self, from: BuildState, to: BuildState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped && to.is_terminal() {
            self.terminal.notify_waiters();
        }
        swapped
    }

    /// Wait until the target reaches a terminal state.
    pub async fn wait_terminal(&self) -> BuildState {
        loop {
            let notified = self.terminal.notified();
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }

    /// Whether a remotely built target's outputs are present locally.
    pub fn outputs_downloaded(&self) -> bool {
        self.outputs_downloaded.load(Ordering::Acquire)
    }

    pub fn set_outputs_downloaded(&self, downloaded: bool) {
        self.outputs_downloaded.store(downloaded, Ordering::Release);
    }

    /// Read the target. The closure must not block on other locks.
    pub fn with<R>(&self, f: impl FnOnce(&Target) -> R) -> R {
        let guard = self.data.read().expect("target lock poisoned");
        f(&guard)
    }

    /// Mutate the target. Only the target's own build may do this.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Target) -> R) -> R {
        let mut guard = self.data.write().expect("target lock poisoned");
        f(&mut guard)
    }

    /// Snapshot the target for use across await points.
    pub fn snapshot(&self) -> Target {
        self.with(Target::clone)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn target(name: &str) -> Target {
        Target::builder()
            .label(BuildLabel::new("pkg", name))
            .kind(TargetKind::Command)
            .build()
    }

    #[test]
    fn state_machine_advances_exactly_once() {
        let node = TargetNode::new(target("t"));
        assert_eq!(node.state(), BuildState::Inactive);
        assert!(node.try_advance(BuildState::Inactive, BuildState::Active));
        assert!(node.try_advance(BuildState::Active, BuildState::Pending));
        assert!(!node.try_advance(BuildState::Active, BuildState::Pending));
        assert_eq!(node.state(), BuildState::Pending);
    }

    #[test]
    fn terminal_classification() {
        assert!(BuildState::Built.is_terminal());
        assert!(BuildState::Reused.is_terminal());
        assert!(!BuildState::Building.is_terminal());
        assert!(BuildState::Cached.outputs_changed());
        assert!(!BuildState::Unchanged.outputs_changed());
        assert!(BuildState::DependencyFailed.is_failure());
    }

    #[test]
    fn outputs_include_named_groups_in_key_order() {
        let mut t = target("t");
        t.outputs = vec!["a.txt".into()];
        t.named_outputs
            .insert("z".into(), vec!["z.txt".into()]);
        t.named_outputs
            .insert("b".into(), vec!["b.txt".into()]);
        assert_eq!(t.declared_outputs(), vec!["a.txt", "b.txt", "z.txt"]);
    }

    #[test]
    fn dependency_labels_dedup_source_targets() {
        let mut t = target("t");
        let dep = BuildLabel::new("pkg", "dep");
        t.deps.push(dep.clone());
        t.sources.push(BuildInput::Target(dep.clone()));
        t.tools.push(BuildInput::Target(BuildLabel::new("pkg", "tool")));
        assert_eq!(
            t.dependency_labels(),
            vec![dep, BuildLabel::new("pkg", "tool")]
        );
    }

    #[tokio::test]
    async fn wait_terminal_wakes_on_state_change() {
        let node = std::sync::Arc::new(TargetNode::new(target("t")));
        let waiter = tokio::spawn({
            let node = node.clone();
            async move { node.wait_terminal().await }
        });
        tokio::task::yield_now().await;
        node.set_state(BuildState::Built);
        assert_eq!(waiter.await.unwrap(), BuildState::Built);
    }
}
