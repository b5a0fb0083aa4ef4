//! The build audit log.
//!
//! When enabled, every executed build command and every remote-file download
//! attempt is appended to a newline-delimited JSON file, one file per record
//! category, under a per-invocation directory.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::Mutex,
};

use color_eyre::{Result, eyre::Context};
use serde::Serialize;
use tracing::warn;

use crate::label::BuildLabel;

/// Record of one executed build command.
#[derive(Debug, Serialize)]
struct BuildRecord<'a> {
    build_label: String,
    environment: BTreeMap<&'a str, &'a str>,
    command: &'a str,
}

/// Record of one remote file download attempt.
#[derive(Debug, Serialize)]
struct RemoteFileRecord<'a> {
    build_label: String,
    url: &'a str,
    success: bool,
    error_message: Option<String>,
}

/// Appends NDJSON records under a per-invocation directory.
///
/// Writes are serialized per category file; records from concurrent workers
/// interleave but never tear.
#[derive(Debug)]
pub struct Audit {
    dir: PathBuf,
    files: Mutex<HashMap<&'static str, File>>,
}

impl Audit {
    /// Create the audit directory and an empty log set.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create audit directory: {dir:?}"))?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Record an executed build command. Failures are logged, not fatal;
    /// auditing never breaks a build.
    pub fn record_build(&self, label: &BuildLabel, environment: &[(String, String)], command: &str) {
        let record = BuildRecord {
            build_label: label.to_string(),
            environment: environment
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            command,
        };
        if let Err(err) = self.append("build_commands", &record) {
            warn!(%err, "failed to write build audit record");
        }
    }

    /// Record a remote file download attempt, successful or not.
    pub fn record_remote_file(
        &self,
        label: &BuildLabel,
        url: &str,
        success: bool,
        error_message: Option<String>,
    ) {
        let record = RemoteFileRecord {
            build_label: label.to_string(),
            url,
            success,
            error_message,
        };
        if let Err(err) = self.append("remote_files", &record) {
            warn!(%err, "failed to write remote file audit record");
        }
    }

    fn append(&self, category: &'static str, record: &impl Serialize) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("encode audit record")?;
        line.push(b'\n');
        let mut files = self.files.lock().expect("audit lock poisoned");
        let file = match files.get_mut(category) {
            Some(file) => file,
            None => {
                let path = self.dir.join(format!("{category}.jsonl"));
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("open audit log: {path:?}"))?;
                files.entry(category).or_insert(file)
            }
        };
        file.write_all(&line).context("append audit record")
    }
}
