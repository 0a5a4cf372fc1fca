//! Source materialization: shallow git clone or S3-archive fetch into
//! the per-build working directory.
//!
//! Grounded on `dispatch_build_and_push.py`'s `pull_files_from_git` /
//! `pull_files_from_job_store`. The Minio SDK has no counterpart in the
//! teacher's dependency graph, so the S3 fetch goes through a plain
//! `reqwest` streaming GET against a presigned-style endpoint instead
//! of introducing an S3 client crate (documented in DESIGN.md).

use std::io::Write as _;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{DispatchError, Result};
use crate::model::SourceDescriptor;

/// Clone the given ref at depth 1 into `dest`, forwarding stdout/stderr
/// line-by-line to `sink`.
pub async fn fetch_git(
    url: &str,
    git_ref: &str,
    dest: &Path,
    sink: &mut dyn FnMut(&str),
) -> Result<()> {
    run_and_forward(
        Command::new("git").args([
            "clone",
            "--depth",
            "1",
            "--branch",
            git_ref,
            url,
            dest.to_str().unwrap_or_default(),
        ]),
        sink,
    )
    .await
    .map_err(|e| DispatchError::SourceFetch(format!("git clone failed: {e}")))
}

/// Resolve the HEAD commit of the freshly cloned working tree.
pub async fn resolve_git_commit(dest: &Path) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dest)
        .args(["rev-parse", "HEAD"])
        .output()
        .await
        .map_err(|e| DispatchError::SourceFetch(format!("git rev-parse failed: {e}")))?;
    if !output.status.success() {
        return Err(DispatchError::SourceFetch(
            "git rev-parse did not exit successfully".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Normalize all file mtimes to a fixed epoch so buildah's layer cache
/// is deterministic across otherwise-identical source trees.
pub async fn normalize_mtimes(dest: &Path) -> Result<()> {
    let fixed = filetime::FileTime::from_unix_time(0, 0);
    let mut stack = vec![dest.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path.clone());
            }
            filetime::set_file_times(&path, fixed, fixed).ok();
        }
    }
    Ok(())
}

/// Append `.git` / `.gitmodules` to `.dockerignore` so the build
/// context excludes VCS metadata.
pub async fn append_dockerignore(dest: &Path) -> Result<()> {
    let path = dest.join(".dockerignore");
    let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    if !existing.is_empty() && !existing.ends_with('\n') {
        existing.push('\n');
    }
    existing.push_str(".git\n.gitmodules\n");
    tokio::fs::write(&path, existing).await?;
    Ok(())
}

/// Fetch an object-store archive into `dest`, verify it is a zip, and
/// extract it in place.
pub async fn fetch_s3(
    http: &reqwest::Client,
    object_store_url: &str,
    dest: &Path,
) -> Result<()> {
    tokio::fs::create_dir_all(dest).await?;
    let archive_path = dest.join("archive.zip");
    let resp = http
        .get(object_store_url)
        .send()
        .await
        .map_err(|e| DispatchError::SourceFetch(format!("S3 fetch failed: {e}")))?
        .error_for_status()
        .map_err(|e| DispatchError::SourceFetch(format!("S3 fetch returned an error status: {e}")))?;

    let mut file = std::fs::File::create(&archive_path)?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DispatchError::SourceFetch(format!("S3 stream error: {e}")))?;
        file.write_all(&chunk)?;
    }
    drop(file);

    let file = std::fs::File::open(&archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| DispatchError::SourceFetch(format!("{} is not a valid zip file: {e}", archive_path.display())))?;
    archive
        .extract(dest)
        .map_err(|e| DispatchError::SourceFetch(format!("zip extraction failed: {e}")))?;
    tokio::fs::remove_file(&archive_path).await?;
    Ok(())
}

pub async fn materialize(
    http: &reqwest::Client,
    source: &SourceDescriptor,
    dest: &Path,
    sink: &mut dyn FnMut(&str),
) -> Result<Option<String>> {
    match source {
        SourceDescriptor::Git { url, git_ref } => {
            fetch_git(url, git_ref, dest, sink).await?;
            let commit = resolve_git_commit(dest).await?;
            normalize_mtimes(dest).await?;
            append_dockerignore(dest).await?;
            Ok(Some(commit))
        }
        SourceDescriptor::S3 { object_store_url } => {
            fetch_s3(http, object_store_url, dest).await?;
            Ok(None)
        }
    }
}

pub(crate) async fn run_and_forward(command: &mut Command, sink: &mut dyn FnMut(&str)) -> std::io::Result<()> {
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::mpsc;

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let tx_out = tx.clone();
    let out_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(l)) = lines.next_line().await {
            let _ = tx_out.send(l);
        }
    });
    let err_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(l)) = lines.next_line().await {
            let _ = tx.send(l);
        }
    });
    while let Some(line) = rx.recv().await {
        sink(&line);
    }
    let _ = out_task.await;
    let _ = err_task.await;

    let status = child.wait().await?;
    if !status.success() {
        return Err(std::io::Error::other(format!(
            "command exited with status {status}"
        )));
    }
    Ok(())
}

/// Fresh per-build scratch directory under the builder root.
pub fn new_build_dir(builder_root: &Path) -> std::path::PathBuf {
    builder_root.join(uuid::Uuid::new_v4().to_string())
}

/// Remove sibling build directories older than 24h, logging failures
/// without propagating them (best-effort housekeeping).
pub async fn sweep_stale_dirs(builder_root: &Path) {
    let now = SystemTime::now();
    let mut entries = match tokio::fs::read_dir(builder_root).await {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "could not list image builder root for sweep");
            return;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Ok(meta) = entry.metadata().await else { continue };
        if !meta.is_dir() {
            continue;
        }
        let Ok(created) = meta.created().or_else(|_| meta.modified()) else { continue };
        let age = now.duration_since(created).unwrap_or_default();
        if age.as_secs() > 24 * 3600 {
            info!(path = %path.display(), "sweeping stale image build directory");
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %e, "failed to sweep stale build directory");
            }
        }
    }
}

#[allow(dead_code)]
fn _unix_epoch_anchor() -> SystemTime {
    UNIX_EPOCH
}
