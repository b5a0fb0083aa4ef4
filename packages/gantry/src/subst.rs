//! Command substitution.
//!
//! Expands the `$(location …)` family of placeholders in a command string
//! before execution. Anything else that looks like shell syntax, including
//! genuine `$(...)` command substitutions, passes through untouched.

use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use lazy_regex::regex;
use tracing::instrument;

use crate::{
    config::Configuration,
    graph::Graph,
    hasher::PathHasher,
    incremental,
    label::BuildLabel,
    target::{BuildInput, Target},
};

/// Expand all placeholders in a build command.
#[instrument(skip_all, fields(target = %target.label))]
pub async fn substitute(
    config: &Configuration,
    graph: &Graph,
    hasher: &PathHasher,
    target: &Target,
    command: &str,
) -> Result<String> {
    let pattern = regex!(
        r"\$\((location|locations|exe|out_exe|out_location|dir|hash|worker)\s+([^)]+)\)"
    );
    let mut out = String::with_capacity(command.len());
    let mut last = 0;
    for captures in pattern.captures_iter(command) {
        let matched = captures.get(0).expect("capture 0 always exists");
        // `\$(...)` is an escaped literal; drop the backslash, keep the rest.
        if matched.start() > 0 && command.as_bytes()[matched.start() - 1] == b'\\' {
            out.push_str(&command[last..matched.start() - 1]);
            out.push_str(matched.as_str());
            last = matched.end();
            continue;
        }
        out.push_str(&command[last..matched.start()]);
        let directive = &captures[1];
        let argument = captures[2].trim();
        out.push_str(
            &expand(config, graph, hasher, target, directive, argument)
                .await
                .with_context(|| format!("expand $({directive} {argument})"))?,
        );
        last = matched.end();
    }
    out.push_str(&command[last..]);
    Ok(out.replace("\\$", "$"))
}

/// Expand a test command. An empty test command means "run the target's own
/// binary", i.e. `$(exe <self>)`.
pub async fn substitute_test(
    config: &Configuration,
    graph: &Graph,
    hasher: &PathHasher,
    target: &Target,
) -> Result<String> {
    let command = match target.test_command.as_deref() {
        Some(command) if !command.trim().is_empty() => command.to_string(),
        _ => format!("$(exe {})", target.label),
    };
    substitute(config, graph, hasher, target, &command).await
}

async fn expand(
    config: &Configuration,
    graph: &Graph,
    hasher: &PathHasher,
    target: &Target,
    directive: &str,
    argument: &str,
) -> Result<String> {
    if directive == "worker" {
        // Worker subprocesses are no longer part of the build protocol.
        bail!("worker rules are not supported");
    }

    let label = BuildLabel::parse(argument, &target.label.package)
        .with_context(|| format!("parse label {argument:?}"))?;
    if label != target.label && !target.dependency_labels().contains(&label) {
        bail!("{label} is not a dependency of {}", target.label);
    }
    let is_tool = target
        .tools
        .iter()
        .any(|tool| matches!(tool, BuildInput::Target(l) if *l == label));
    let node = graph.target_or_die(&label)?;
    let dep = node.snapshot();
    let outputs = dep.declared_outputs();

    let single_output = || -> Result<&String> {
        match outputs.as_slice() {
            [only] => Ok(only),
            _ => bail!(
                "{label} has {} outputs; exactly one is required here",
                outputs.len()
            ),
        }
    };
    // Tools are addressed absolutely; everything else is relative to the
    // temp directory layout, which mirrors the repo.
    let output_path = |output: &str| -> PathBuf {
        if is_tool {
            dep.out_dir(config).join(output)
        } else {
            Path::new(&dep.label.package).join(output)
        }
    };
    let out_root_path = |output: &str| -> PathBuf {
        let out_dir = dep.out_dir(config);
        out_dir
            .strip_prefix(&config.repo_root)
            .unwrap_or(&out_dir)
            .join(output)
    };

    match directive {
        "location" => Ok(output_path(single_output()?).to_string_lossy().into_owned()),
        "locations" => {
            let paths: Vec<String> = outputs
                .iter()
                .map(|output| output_path(output).to_string_lossy().into_owned())
                .collect();
            Ok(paths.join(" "))
        }
        "exe" => Ok(exe_command(
            &dep,
            output_path(single_output()?).to_string_lossy().as_ref(),
        )?),
        "out_exe" => Ok(exe_command(
            &dep,
            out_root_path(single_output()?).to_string_lossy().as_ref(),
        )?),
        "out_location" => Ok(out_root_path(single_output()?)
            .to_string_lossy()
            .into_owned()),
        "dir" => {
            let dir = if is_tool {
                dep.out_dir(config)
            } else {
                PathBuf::from(&dep.label.package)
            };
            Ok(dir.to_string_lossy().into_owned())
        }
        "hash" => {
            if !target.stamp {
                bail!(
                    "$(hash …) requires {} to be marked for stamping",
                    target.label
                );
            }
            let digest = incremental::output_hash(config, hasher, &dep, false)
                .await
                .with_context(|| format!("hash outputs of {label}"))?;
            Ok(digest.to_string())
        }
        other => bail!("unknown substitution $({other} …)"),
    }
}

/// The command used to invoke a binary target's output, prefixed with a
/// runtime when the target is labelled as needing one.
fn exe_command(dep: &Target, path: &str) -> Result<String> {
    if !dep.is_binary {
        bail!("{} is not a binary target", dep.label);
    }
    if dep.labels.iter().any(|l| l == "java") {
        Ok(format!("java -jar {path}"))
    } else {
        Ok(path.to_string())
    }
}

/// Expand `$VAR` and `${VAR}` references against the host environment.
/// Unknown variables expand to the empty string.
pub fn expand_env_vars(s: &str) -> String {
    let pattern = regex!(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)");
    pattern
        .replace_all(s, |captures: &lazy_regex::Captures<'_>| {
            let name = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}
