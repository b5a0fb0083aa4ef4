use std::{net::SocketAddr, sync::Arc};

use color_eyre::Result;
use gantry::{
    build::Builder,
    cache::DirCache,
    config::Configuration,
    fs,
    graph::Graph,
    label::BuildLabel,
    target::{BuildState, Target, TargetKind},
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};

/// Serve exactly one HTTP request with a canned response, returning the raw
/// request text for assertions.
async fn stub_server(body: &str) -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buffer = vec![0u8; 8192];
        let read = socket.read(&mut buffer).await.unwrap();
        let request = String::from_utf8_lossy(&buffer[..read]).into_owned();
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        request
    });
    (addr, handle)
}

fn remote_file_target(url: String, labels: Vec<String>) -> Target {
    Target::builder()
        .label(BuildLabel::new("pkg", "rf"))
        .kind(TargetKind::RemoteFile)
        .urls(vec![url])
        .outputs(vec!["artifact.bin".into()])
        .labels(labels)
        .build()
}

async fn build_remote_file(config: &Arc<Configuration>, target: Target) -> Result<BuildState> {
    let label = target.label.clone();
    let graph = Arc::new(Graph::new());
    graph.add_target(target)?;
    let builder = Builder::<DirCache>::new(config.clone(), graph, None)?;
    builder.build(&label).await
}

#[test_log::test(tokio::test)]
async fn downloads_with_injected_headers() -> Result<()> {
    let temp = TempDir::new()?;
    let config = Arc::new(
        Configuration::builder()
            .repo_root(temp.path())
            .audit_dir(temp.path().join(".audit"))
            .build(),
    );
    let (addr, request) = stub_server("remote payload").await;

    let state = build_remote_file(
        &config,
        remote_file_target(
            format!("http://{addr}/artifact.bin"),
            vec!["remote_file:header:foo:fooval".into()],
        ),
    )
    .await?;
    assert_eq!(state, BuildState::Built);

    // The stub observed our header and user agent.
    let request = request.await.unwrap();
    assert!(request.contains("foo: fooval"), "request was: {request}");
    assert!(request.contains("gantry/"), "request was: {request}");

    // The file landed and its hash was recorded at download time.
    let output = temp.path().join("plz-out/gen/pkg/artifact.bin");
    assert_eq!(
        fs::read_buffered(&output).await?.unwrap(),
        b"remote payload"
    );

    // Both audit records exist: the download and nothing else.
    let audit = std::fs::read_to_string(temp.path().join(".audit/remote_files.jsonl"))?;
    let record: serde_json::Value = serde_json::from_str(audit.lines().next().unwrap())?;
    assert_eq!(record["build_label"], "//pkg:rf");
    assert_eq!(record["success"], true);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn download_hash_is_registered_with_the_hasher() -> Result<()> {
    let temp = TempDir::new()?;
    let config = Arc::new(Configuration::builder().repo_root(temp.path()).build());
    let (addr, _request) = stub_server("remote payload").await;

    let label = BuildLabel::new("pkg", "rf");
    let graph = Arc::new(Graph::new());
    graph.add_target(remote_file_target(
        format!("http://{addr}/artifact.bin"),
        Vec::new(),
    ))?;
    let builder = Builder::<DirCache>::new(config.clone(), graph, None)?;
    builder.build(&label).await?;

    let output = temp.path().join("plz-out/gen/pkg/artifact.bin");
    let recorded = builder.hasher().hash(&output, false, false, false).await?;
    assert_eq!(recorded, config.hash_algorithm.hash_bytes(b"remote payload"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn falls_through_to_the_next_url() -> Result<()> {
    let temp = TempDir::new()?;
    let config = Arc::new(Configuration::builder().repo_root(temp.path()).build());

    // Reserve a port and close it so the first URL refuses connections.
    let dead = TcpListener::bind("127.0.0.1:0").await?;
    let dead_addr = dead.local_addr()?;
    drop(dead);
    let (addr, _request) = stub_server("fallback worked").await;

    let target = Target::builder()
        .label(BuildLabel::new("pkg", "rf"))
        .kind(TargetKind::RemoteFile)
        .urls(vec![
            format!("http://{dead_addr}/artifact.bin"),
            format!("http://{addr}/artifact.bin"),
        ])
        .outputs(vec!["artifact.bin".into()])
        .build();
    let state = build_remote_file(&config, target).await?;
    assert_eq!(state, BuildState::Built);
    assert_eq!(
        fs::read_buffered(temp.path().join("plz-out/gen/pkg/artifact.bin"))
            .await?
            .unwrap(),
        b"fallback worked"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn pinned_hash_mismatches_fail_strict_builds() -> Result<()> {
    let temp = TempDir::new()?;
    let config = Arc::new(Configuration::builder().repo_root(temp.path()).build());
    let (addr, _request) = stub_server("remote payload").await;

    let mut target = remote_file_target(format!("http://{addr}/artifact.bin"), Vec::new());
    target.pinned_hashes = vec!["deadbeef".into()];
    assert!(build_remote_file(&config, target).await.is_err());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn pinned_raw_file_hashes_are_accepted() -> Result<()> {
    let temp = TempDir::new()?;
    let config = Arc::new(Configuration::builder().repo_root(temp.path()).build());
    let (addr, _request) = stub_server("remote payload").await;

    // Pin the raw SHA-256 of the file, not the combined output hash.
    let mut target = remote_file_target(format!("http://{addr}/artifact.bin"), Vec::new());
    target.pinned_hashes = vec![
        gantry::hash::HashAlgorithm::Sha256
            .hash_bytes(b"remote payload")
            .to_string(),
    ];
    let state = build_remote_file(&config, target).await?;
    assert_eq!(state, BuildState::Built);
    Ok(())
}
