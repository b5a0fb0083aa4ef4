//! The remote-file fetcher.
//!
//! Downloads `remote_file` targets over a shared HTTP client with bounded
//! parallelism, retrying transient failures with backoff and falling through
//! the target's URL list until one succeeds. Bodies stream simultaneously to
//! the output file and a streaming hasher so the digest is known the moment
//! the download completes.

use std::{path::Path, sync::Arc, time::Duration};

use color_eyre::{
    Report, Result,
    eyre::{Context, ContextCompat, bail, eyre},
};
use futures::StreamExt;
use itertools::Itertools;
use reqwest::header::USER_AGENT;
use tokio::{io::AsyncWriteExt, sync::Semaphore};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{
    audit::Audit, config::Configuration, fs, hasher::PathHasher, progress::TransferBar,
    subst::expand_env_vars, target::Target,
};

/// Attempts per URL before falling through to the next one.
const ATTEMPTS: u32 = 3;

/// Base backoff between retries; doubles per attempt.
const BACKOFF: Duration = Duration::from_millis(500);

/// Bytes of an error response body surfaced for diagnostics.
const ERROR_BODY_LIMIT: usize = 1024;

enum FetchError {
    /// Worth retrying: connection trouble, timeouts, server errors.
    Transient(Report),
    /// Retrying will not help: bad URLs, client errors, bad labels.
    Permanent(Report),
}

impl FetchError {
    fn into_report(self) -> Report {
        match self {
            FetchError::Transient(report) | FetchError::Permanent(report) => report,
        }
    }
}

/// Authentication and header options parsed from `remote_file:*` labels.
#[derive(Default)]
struct RemoteOptions {
    headers: Vec<(String, String)>,
    username: Option<String>,
    password: Option<String>,
}

/// Shared downloader for all remote-file targets in a build.
pub struct Fetcher {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    user_agent: String,
}

impl Fetcher {
    pub fn new(config: &Configuration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.download_timeout);
        if let Some(proxy) = &config.http_proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str()).context("configure proxy")?);
        }
        Ok(Self {
            client: builder.build().context("build http client")?,
            semaphore: Arc::new(Semaphore::new(config.parallel_downloads.max(1))),
            user_agent: config.user_agent.clone(),
        })
    }

    /// Download the target's single output into `dest_dir`, trying each URL
    /// in order. The resulting digest is registered with the path hasher.
    #[instrument(skip_all, fields(target = %target.label))]
    pub async fn fetch(
        &self,
        config: &Configuration,
        hasher: &PathHasher,
        audit: Option<&Audit>,
        target: &Target,
        dest_dir: &Path,
    ) -> Result<()> {
        let outputs = target.declared_outputs();
        let [output] = outputs.as_slice() else {
            bail!(
                "remote file {} must declare exactly one output, has {}",
                target.label,
                outputs.len()
            );
        };
        if target.urls.is_empty() {
            bail!("remote file {} declares no URLs", target.label);
        }
        let dest = dest_dir.join(output);
        let options = remote_options(target).await?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("acquire download slot")?;

        let mut errors = Vec::new();
        for url in &target.urls {
            match self.fetch_url(config, hasher, target, &options, url, &dest).await {
                Ok(()) => {
                    if let Some(audit) = audit {
                        audit.record_remote_file(&target.label, url, true, None);
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(%url, %err, "download failed");
                    if let Some(audit) = audit {
                        audit.record_remote_file(&target.label, url, false, Some(format!("{err:#}")));
                    }
                    errors.push(err);
                }
            }
        }
        bail!(
            "failed to download {}: {}",
            target.label,
            errors.iter().map(|err| format!("{err:#}")).join("; ")
        )
    }

    async fn fetch_url(
        &self,
        config: &Configuration,
        hasher: &PathHasher,
        target: &Target,
        options: &RemoteOptions,
        url: &str,
        dest: &Path,
    ) -> Result<()> {
        let parsed = Url::parse(url).with_context(|| format!("parse URL {url:?}"))?;
        if parsed.scheme() == "file" {
            return fetch_local(config, hasher, &parsed, dest).await;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(hasher, target, options, url, dest).await {
                Ok(()) => return Ok(()),
                Err(FetchError::Transient(report)) if attempt < ATTEMPTS => {
                    let backoff = BACKOFF * 2u32.pow(attempt - 1);
                    debug!(%url, attempt, ?backoff, %report, "retrying download");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err.into_report()),
            }
        }
    }

    async fn attempt(
        &self,
        hasher: &PathHasher,
        target: &Target,
        options: &RemoteOptions,
        url: &str,
        dest: &Path,
    ) -> Result<(), FetchError> {
        let mut request = self.client.get(url).header(USER_AGENT, &self.user_agent);
        for (key, value) in &options.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if options.username.is_some() || options.password.is_some() {
            request = request.basic_auth(
                options.username.clone().unwrap_or_default(),
                options.password.clone(),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|err| FetchError::Transient(eyre!(err).wrap_err(format!("request {url}"))))?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(ERROR_BODY_LIMIT);
            let report = eyre!("{url}: HTTP {status}: {body}");
            return Err(if status.is_server_error() {
                FetchError::Transient(report)
            } else {
                FetchError::Permanent(report)
            });
        }

        let total = response.content_length().unwrap_or(0);
        let progress = TransferBar::new(total, format!("Downloading {}", target.label));

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(FetchError::Permanent)?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create {dest:?}"))
            .map_err(FetchError::Permanent)?;

        let mut hash_stream = hasher.new_hash();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|err| FetchError::Transient(eyre!(err).wrap_err("read response body")))?;
            file.write_all(&chunk)
                .await
                .context("write chunk")
                .map_err(FetchError::Permanent)?;
            hash_stream.update(&chunk);
            progress.add_bytes(chunk.len() as u64);
        }
        file.sync_all()
            .await
            .context("sync downloaded file")
            .map_err(FetchError::Permanent)?;

        let digest = hash_stream.finish();
        debug!(%url, ?dest, %digest, bytes = progress.bytes(), "downloaded");
        hasher.set(dest, digest);
        Ok(())
    }
}

/// Handle a `file://` URL by local copy. The path must be absolute and must
/// not point back into the repository (check the file in instead).
async fn fetch_local(
    config: &Configuration,
    hasher: &PathHasher,
    url: &Url,
    dest: &Path,
) -> Result<()> {
    let path = url
        .to_file_path()
        .map_err(|()| eyre!("invalid file URL {url}"))?;
    if !path.is_absolute() {
        bail!("file URL {url} must be absolute");
    }
    if path.starts_with(&config.repo_root) {
        bail!("file URL {url} points inside the repository; use a source instead");
    }
    fs::copy_file(&path, dest).await?;
    hasher.hash(dest, true, false, false).await.map(drop)
}

/// Parse `remote_file:*` labels into request options. Unknown labels under
/// that prefix are an error.
async fn remote_options(target: &Target) -> Result<RemoteOptions> {
    let mut options = RemoteOptions::default();
    for label in &target.labels {
        let Some(rest) = label.strip_prefix("remote_file:") else {
            continue;
        };
        if let Some(header) = rest.strip_prefix("header:") {
            let (key, value) = header
                .split_once(':')
                .with_context(|| format!("malformed header label {label:?}"))?;
            options.headers.push((key.to_string(), expand_env_vars(value)));
        } else if let Some(header) = rest.strip_prefix("secret_header:") {
            let (key, path) = header
                .split_once(':')
                .with_context(|| format!("malformed secret header label {label:?}"))?;
            let value = fs::read_buffered_utf8(Path::new(path))
                .await?
                .with_context(|| format!("secret header file {path:?} does not exist"))?;
            options
                .headers
                .push((key.to_string(), value.trim().to_string()));
        } else if let Some(username) = rest.strip_prefix("username:") {
            options.username = Some(username.to_string());
        } else if let Some(path) = rest.strip_prefix("password_file:") {
            let password = fs::read_buffered_utf8(Path::new(path))
                .await?
                .with_context(|| format!("password file {path:?} does not exist"))?;
            options.password = Some(password.trim().to_string());
        } else {
            bail!("unknown remote_file label {label:?}");
        }
    }
    Ok(options)
}
