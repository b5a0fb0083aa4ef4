//! Build command execution.
//!
//! Commands run under `sh -c` in the target's temp directory with a fully
//! controlled environment; nothing from the host leaks in except variables
//! the target explicitly passes through.

use std::{path::Path, process::Stdio, time::Duration};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::{config::Configuration, hash::Digest, incremental::SourcePair, target::Target};

/// Captured output of a build command.
#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    /// Standard output alone; retained as build metadata and replayed into
    /// post-build hooks.
    pub stdout: Vec<u8>,

    /// Standard output followed by standard error; surfaced on failure.
    pub combined: Vec<u8>,
}

/// Assemble the environment for a target's build command.
pub fn build_env(
    config: &Configuration,
    target: &Target,
    tmp_dir: &Path,
    sources: &[SourcePair],
    stamp: Option<&Digest>,
) -> Vec<(String, String)> {
    let tmp = tmp_dir.to_string_lossy().into_owned();
    let mut env = vec![
        ("PATH".to_string(), config.build_path.clone()),
        ("PKG".to_string(), target.label.package.clone()),
        ("PKG_DIR".to_string(), target.label.package.clone()),
        ("NAME".to_string(), target.label.name.clone()),
        ("TMP_DIR".to_string(), tmp.clone()),
        ("HOME".to_string(), tmp.clone()),
    ];

    let srcs: Vec<String> = sources
        .iter()
        .filter(|pair| !pair.is_tool)
        .map(|pair| pair.tmp_dest.to_string_lossy().into_owned())
        .collect();
    env.push(("SRCS".to_string(), srcs.join(" ")));
    // Named variants carry the same resolved temp paths, one token per
    // resolved file, not per declared input.
    for name in target.named_sources.keys() {
        let group: Vec<String> = sources
            .iter()
            .filter(|pair| !pair.is_tool && pair.group.as_deref() == Some(name.as_str()))
            .map(|pair| pair.tmp_dest.to_string_lossy().into_owned())
            .collect();
        env.push((format!("SRCS_{}", name.to_uppercase()), group.join(" ")));
    }

    let outs: Vec<String> = target
        .declared_outputs()
        .iter()
        .map(|output| tmp_dir.join(output).to_string_lossy().into_owned())
        .collect();
    env.push(("OUTS".to_string(), outs.join(" ")));
    if let [only] = outs.as_slice() {
        env.push(("OUT".to_string(), only.clone()));
    }

    if let Some(stamp) = stamp {
        env.push(("STAMP".to_string(), stamp.to_string()));
    }
    for key in &target.pass_env {
        env.push((key.clone(), std::env::var(key).unwrap_or_default()));
    }
    // Target-declared overrides win over everything above.
    for (key, value) in &target.env {
        env.retain(|(existing, _)| existing != key);
        env.push((key.clone(), value.clone()));
    }
    env
}

/// Run the command in the temp directory, bounded by the configured build
/// timeout. Returns captured output; a non-zero exit or timeout is an error
/// carrying the combined output.
#[instrument(skip_all, fields(target = %target.label))]
pub async fn run_command(
    config: &Configuration,
    target: &Target,
    command: &str,
    env: &[(String, String)],
    tmp_dir: &Path,
) -> Result<ExecOutput> {
    let mut cmd = match (&config.sandbox_tool, target.sandbox) {
        (Some(tool), true) => {
            let mut cmd = Command::new(tool);
            cmd.arg("/bin/sh");
            cmd
        }
        _ => Command::new("/bin/sh"),
    };
    if target.exit_on_error {
        cmd.arg("-e");
    }
    cmd.arg("-c")
        .arg(command)
        .current_dir(tmp_dir)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(%command, "running build command");
    let child = cmd.spawn().with_context(|| format!("spawn: {command}"))?;
    let output = match tokio::time::timeout(config.build_timeout, child.wait_with_output()).await {
        Ok(output) => output.context("wait for build command")?,
        // Dropping the in-flight future kills the child.
        Err(_) => bail!(
            "build command timed out after {}",
            humantime(config.build_timeout)
        ),
    };

    let mut combined = output.stdout.clone();
    combined.extend_from_slice(&output.stderr);
    if !output.status.success() {
        bail!(
            "build command exited with {}:\n{}",
            output.status,
            String::from_utf8_lossy(&combined)
        );
    }
    Ok(ExecOutput {
        stdout: output.stdout,
        combined,
    })
}

fn humantime(duration: Duration) -> String {
    indicatif::HumanDuration(duration).to_string()
}
