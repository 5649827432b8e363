//! File-download mode: stream a body to disk, hash it, then commit.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use super::TransportError;
use super::constants::PARTIAL_SUFFIX;
use crate::delivery::ProgressListener;
use crate::request::{DownloadTarget, Request};

/// A committed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DownloadOutcome {
    pub(crate) path: PathBuf,
    pub(crate) bytes: u64,
    pub(crate) sha256: String,
}

/// Path the body is streamed to before the checksum is verified.
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

/// Streams `response` to `target`, verifying the checksum before renaming into place.
///
/// The partial file is removed on any error, including cancellation.
pub(crate) async fn download_to_target(
    response: reqwest::Response,
    request: &Request,
    target: &DownloadTarget,
    progress: Option<&dyn ProgressListener>,
) -> Result<DownloadOutcome, TransportError> {
    let part = partial_path(&target.path);
    if let Some(parent) = target.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransportError::io(parent, e))?;
    }

    let mut guard = PartialFile {
        path: part.clone(),
        committed: false,
    };
    let result = stream_and_commit(response, request, target, &part, progress).await;
    guard.committed = result.is_ok();
    result
}

/// Deletes the partial file on drop unless the download committed.
///
/// Dropping covers aborted tasks as well as error returns.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed && std::fs::remove_file(&self.path).is_ok() {
            debug!(path = %self.path.display(), "discarded partial download");
        }
    }
}

async fn stream_and_commit(
    response: reqwest::Response,
    request: &Request,
    target: &DownloadTarget,
    part: &Path,
    progress: Option<&dyn ProgressListener>,
) -> Result<DownloadOutcome, TransportError> {
    let total = response.content_length();
    let file = File::create(part)
        .await
        .map_err(|e| TransportError::io(part, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut hasher = Sha256::new();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        if request.is_cancelled() {
            return Err(TransportError::cancelled(request.url()));
        }
        let chunk = chunk_result.map_err(|e| TransportError::network(request.url(), e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| TransportError::io(part, e))?;
        hasher.update(&chunk);
        bytes_written += chunk.len() as u64;

        if let Some(listener) = progress {
            listener.on_progress(request.id(), bytes_written, total);
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| TransportError::io(part, e))?;
    drop(writer);

    let sha256 = format!("{:x}", hasher.finalize());
    if let Some(expected) = &target.expected_sha256
        && *expected != sha256
    {
        return Err(TransportError::integrity(&target.path, expected, sha256));
    }

    tokio::fs::rename(part, &target.path)
        .await
        .map_err(|e| TransportError::io(&target.path, e))?;

    info!(
        path = %target.path.display(),
        bytes = bytes_written,
        "download committed"
    );

    Ok(DownloadOutcome {
        path: target.path.clone(),
        bytes: bytes_written,
        sha256,
    })
}
