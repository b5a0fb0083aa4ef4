use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use color_eyre::Result;
use gantry::{
    build::Builder,
    cache::DirCache,
    config::Configuration,
    fingerprint,
    fs,
    graph::Graph,
    label::BuildLabel,
    target::{BuildInput, BuildState, PostBuildHook, Target, TargetKind},
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn config_for(temp: &TempDir) -> Arc<Configuration> {
    Arc::new(Configuration::builder().repo_root(temp.path()).build())
}

/// Build a set of targets in order with a fresh graph and builder, as the
/// scheduler would after re-parsing. Returns the state of the last target.
async fn build_all(
    config: &Arc<Configuration>,
    cache: Option<DirCache>,
    targets: Vec<Target>,
) -> Result<BuildState> {
    let graph = Arc::new(Graph::new());
    let labels: Vec<BuildLabel> = targets.iter().map(|t| t.label.clone()).collect();
    for target in targets {
        graph.add_target(target)?;
    }
    let builder = Builder::new(config.clone(), graph, cache)?;
    let mut state = BuildState::Inactive;
    for label in &labels {
        state = builder.build(label).await?;
    }
    Ok(state)
}

fn echo_target(command: &str) -> Target {
    Target::builder()
        .label(BuildLabel::new("pkg", "t1"))
        .kind(TargetKind::Command)
        .command(command)
        .outputs(vec!["file1".into()])
        .build()
}

#[test_log::test(tokio::test)]
async fn first_build_of_a_single_target() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);

    let state = build_all(&config, None, vec![echo_target("echo hi > $OUT")]).await?;
    assert_eq!(state, BuildState::Built);

    let output = temp.path().join("plz-out/gen/pkg/file1");
    assert_eq!(fs::read_buffered(&output).await?.unwrap(), b"hi\n");

    // The fingerprint is persisted on the output (attribute or sidecar).
    let target = echo_target("echo hi > $OUT");
    assert!(fingerprint::read(&config, &target).await?.is_some());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn second_build_reuses_without_touching_outputs() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);

    build_all(&config, None, vec![echo_target("echo hi > $OUT")]).await?;
    let output = temp.path().join("plz-out/gen/pkg/file1");
    let mtime_before = fs::metadata(&output).await?.unwrap().modified()?;

    let state = build_all(&config, None, vec![echo_target("echo hi > $OUT")]).await?;
    assert_eq!(state, BuildState::Reused);
    let mtime_after = fs::metadata(&output).await?.unwrap().modified()?;
    assert_eq!(mtime_before, mtime_after);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn command_change_triggers_a_rebuild() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);

    build_all(&config, None, vec![echo_target("echo hi > $OUT")]).await?;
    let state = build_all(&config, None, vec![echo_target("echo bye > $OUT")]).await?;
    assert_eq!(state, BuildState::Built);

    let output = temp.path().join("plz-out/gen/pkg/file1");
    assert_eq!(fs::read_buffered(&output).await?.unwrap(), b"bye\n");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn symlinked_outputs_survive_collection() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);
    fs::write(temp.path().join("pkg/src.txt"), b"the source").await?;

    let target = Target::builder()
        .label(BuildLabel::new("pkg", "t4"))
        .kind(TargetKind::Command)
        .sources(vec![BuildInput::File("pkg/src.txt".into())])
        .command("ln -s $SRCS $OUT")
        .outputs(vec!["file1".into()])
        .build();
    let state = build_all(&config, None, vec![target]).await?;
    assert_eq!(state, BuildState::Built);

    let output = temp.path().join("plz-out/gen/pkg/file1");
    let meta = fs::symlink_metadata(&output).await?.unwrap();
    assert!(meta.file_type().is_symlink());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn dependency_outputs_flow_into_consumers() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);

    let dep = Target::builder()
        .label(BuildLabel::new("pkg", "dep"))
        .kind(TargetKind::Command)
        .command("echo dep > $OUT")
        .outputs(vec!["dep.txt".into()])
        .visibility(vec!["PUBLIC".into()])
        .build();
    let top = Target::builder()
        .label(BuildLabel::new("pkg", "top"))
        .kind(TargetKind::Command)
        .sources(vec![BuildInput::Target(BuildLabel::new("pkg", "dep"))])
        .command("cat $SRCS > $OUT")
        .outputs(vec!["top.txt".into()])
        .build();

    let state = build_all(&config, None, vec![dep, top]).await?;
    assert_eq!(state, BuildState::Built);
    assert_eq!(
        fs::read_buffered(temp.path().join("plz-out/gen/pkg/top.txt"))
            .await?
            .unwrap(),
        b"dep\n"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failing_dependencies_poison_their_consumers() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);
    let graph = Arc::new(Graph::new());

    graph.add_target(
        Target::builder()
            .label(BuildLabel::new("pkg", "bad"))
            .kind(TargetKind::Command)
            .command("exit 1")
            .visibility(vec!["PUBLIC".into()])
            .build(),
    )?;
    graph.add_target(
        Target::builder()
            .label(BuildLabel::new("pkg", "top"))
            .kind(TargetKind::Command)
            .deps(vec![BuildLabel::new("pkg", "bad")])
            .command("true")
            .build(),
    )?;

    let builder = Builder::<DirCache>::new(config.clone(), graph.clone(), None)?;
    assert!(builder.build(&BuildLabel::new("pkg", "bad")).await.is_err());
    assert_eq!(
        graph
            .target_or_die(&BuildLabel::new("pkg", "bad"))?
            .state(),
        BuildState::Failed
    );

    assert!(builder.build(&BuildLabel::new("pkg", "top")).await.is_err());
    assert_eq!(
        graph
            .target_or_die(&BuildLabel::new("pkg", "top"))?
            .state(),
        BuildState::DependencyFailed
    );
    Ok(())
}

/// Post-build hook that tags the target and counts its invocations.
struct RecordingHook {
    calls: Arc<AtomicU32>,
    seen: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl PostBuildHook for RecordingHook {
    fn call(&self, target: &mut Target, stdout: &[u8]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen.lock().unwrap() = stdout.to_vec();
        if !target.labels.iter().any(|l| l == "hooked") {
            target.labels.push("hooked".into());
        }
        Ok(())
    }
}

fn hooked_target(calls: Arc<AtomicU32>, seen: Arc<std::sync::Mutex<Vec<u8>>>) -> Target {
    Target::builder()
        .label(BuildLabel::new("pkg", "wibble"))
        .kind(TargetKind::Command)
        .command("echo wibble wibble wibble; echo data > $OUT")
        .outputs(vec!["out.txt".into()])
        .post_build(Arc::new(RecordingHook { calls, seen }) as Arc<dyn PostBuildHook>)
        .build()
}

#[test_log::test(tokio::test)]
async fn post_build_hook_replays_from_cached_metadata() -> Result<()> {
    let temp = TempDir::new()?;
    let cache_root = TempDir::new()?;
    let config = config_for(&temp);

    // First build: runs the command, fires the hook with the live stdout,
    // and populates the cache under both keys.
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let state = build_all(
        &config,
        Some(DirCache::new(cache_root.path())),
        vec![hooked_target(calls.clone(), seen.clone())],
    )
    .await?;
    assert_eq!(state, BuildState::Built);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(&*seen.lock().unwrap(), b"wibble wibble wibble\n");

    // Wipe the outputs but keep the cache: the metadata-only hit replays the
    // hook exactly once with the recorded stdout, then artifacts restore.
    fs::remove_dir_all(temp.path().join("plz-out")).await?;
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let state = build_all(
        &config,
        Some(DirCache::new(cache_root.path())),
        vec![hooked_target(calls.clone(), seen.clone())],
    )
    .await?;
    assert_eq!(state, BuildState::Cached);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(&*seen.lock().unwrap(), b"wibble wibble wibble\n");
    assert_eq!(
        fs::read_buffered(temp.path().join("plz-out/gen/pkg/out.txt"))
            .await?
            .unwrap(),
        b"data\n"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn zero_output_targets_store_their_fingerprint_on_a_sentinel() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);

    let target = Target::builder()
        .label(BuildLabel::new("pkg", "silent"))
        .kind(TargetKind::Command)
        .command("true")
        .build();
    let state = build_all(&config, None, vec![target.clone()]).await?;
    assert_eq!(state, BuildState::Built);
    assert!(
        fs::metadata(temp.path().join("plz-out/gen/pkg/.target_sentinel_silent"))
            .await?
            .is_some()
    );
    assert!(fingerprint::read(&config, &target).await?.is_some());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn text_files_write_their_content() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);

    let target = Target::builder()
        .label(BuildLabel::new("pkg", "motd"))
        .kind(TargetKind::TextFile)
        .file_content("welcome to the build\n")
        .outputs(vec!["motd.txt".into()])
        .build();
    let state = build_all(&config, None, vec![target]).await?;
    assert_eq!(state, BuildState::Built);
    assert_eq!(
        fs::read_buffered(temp.path().join("plz-out/gen/pkg/motd.txt"))
            .await?
            .unwrap(),
        b"welcome to the build\n"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rejected_licences_are_fatal() -> Result<()> {
    let temp = TempDir::new()?;
    let config = Arc::new(
        Configuration::builder()
            .repo_root(temp.path())
            .rejected_licences(vec!["GPL-3.0".into()])
            .accepted_licences(vec!["MIT".into(), "GPL-3.0".into()])
            .build(),
    );
    let graph = Arc::new(Graph::new());
    let label = BuildLabel::new("pkg", "viral");
    graph.add_target(
        Target::builder()
            .label(label.clone())
            .kind(TargetKind::Command)
            .command("echo x > $OUT")
            .outputs(vec!["x".into()])
            // In both lists: rejection wins.
            .licences(vec!["gpl-3.0".into()])
            .build(),
    )?;

    let builder = Builder::<DirCache>::new(config, graph.clone(), None)?;
    assert!(builder.build(&label).await.is_err());
    assert!(builder.is_fatal());
    assert_eq!(graph.target_or_die(&label)?.state(), BuildState::Failed);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unlisted_licences_fail_when_an_accept_list_exists() -> Result<()> {
    let temp = TempDir::new()?;
    let config = Arc::new(
        Configuration::builder()
            .repo_root(temp.path())
            .accepted_licences(vec!["MIT".into()])
            .build(),
    );
    let target = Target::builder()
        .label(BuildLabel::new("pkg", "odd"))
        .kind(TargetKind::Command)
        .command("echo x > $OUT")
        .outputs(vec!["x".into()])
        .licences(vec!["Proprietary".into()])
        .build();
    assert!(build_all(&config, None, vec![target]).await.is_err());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn prepare_only_lays_out_sources_and_stops() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);
    fs::write(temp.path().join("pkg/input.txt"), b"input").await?;

    let label = BuildLabel::new("pkg", "prep");
    let graph = Arc::new(Graph::new());
    graph.add_target(
        Target::builder()
            .label(label.clone())
            .kind(TargetKind::Command)
            .sources(vec![BuildInput::File("pkg/input.txt".into())])
            .command("cp $SRCS $OUT")
            .outputs(vec!["copy.txt".into()])
            .build(),
    )?;
    let builder = Builder::<DirCache>::new(config.clone(), graph, None)?
        .with_prepare_only(true)
        .with_originals([label.clone()]);

    let state = builder.build(&label).await?;
    assert_eq!(state, BuildState::Stopped);
    // Sources are linked into the temp dir, but nothing was built.
    assert!(
        fs::symlink_metadata(temp.path().join("plz-out/tmp/pkg/prep._build/pkg/input.txt"))
            .await?
            .is_some()
    );
    assert!(
        fs::metadata(temp.path().join("plz-out/gen/pkg/copy.txt"))
            .await?
            .is_none()
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn forced_rebuilds_run_the_command_again() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);
    let label = BuildLabel::new("pkg", "t1");

    build_all(&config, None, vec![echo_target("echo hi > $OUT")]).await?;

    let graph = Arc::new(Graph::new());
    graph.add_target(echo_target("echo hi > $OUT"))?;
    let builder = Builder::<DirCache>::new(config.clone(), graph, None)?
        .with_rebuild(true)
        .with_originals([label.clone()]);
    let state = builder.build(&label).await?;
    // Rebuilt, but the content came out identical.
    assert_eq!(state, BuildState::Unchanged);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn optional_outputs_sweep_but_skip_build_files() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);

    let target = Target::builder()
        .label(BuildLabel::new("pkg", "sweepy"))
        .kind(TargetKind::Command)
        .command(
            "echo hi > $OUT; echo log > extra.log; \
             mkdir -p sub; echo d > sub/data.txt; echo b > sub/BUILD",
        )
        .outputs(vec!["out.txt".into()])
        .optional_outputs(vec!["*.log".into(), "sub/*".into()])
        .build();
    let state = build_all(&config, None, vec![target]).await?;
    assert_eq!(state, BuildState::Built);

    let out_dir = temp.path().join("plz-out/gen/pkg");
    assert_eq!(
        fs::read_buffered(out_dir.join("extra.log")).await?.unwrap(),
        b"log\n"
    );
    assert_eq!(
        fs::read_buffered(out_dir.join("sub/data.txt")).await?.unwrap(),
        b"d\n"
    );
    // Build definition files never sweep in, even from subdirectories.
    assert!(fs::metadata(out_dir.join("sub/BUILD")).await?.is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn link_labels_expose_outputs_elsewhere() -> Result<()> {
    let temp = TempDir::new()?;
    let config = config_for(&temp);

    let target = Target::builder()
        .label(BuildLabel::new("pkg", "linked"))
        .kind(TargetKind::Command)
        .command("echo linked > $OUT")
        .outputs(vec!["linked.txt".into()])
        .labels(vec!["link:exposed".into()])
        .build();
    build_all(&config, None, vec![target]).await?;

    let link = temp.path().join("exposed/linked.txt");
    assert!(fs::symlink_metadata(&link).await?.unwrap().file_type().is_symlink());
    assert_eq!(fs::read_buffered(&link).await?.unwrap(), b"linked\n");
    Ok(())
}
