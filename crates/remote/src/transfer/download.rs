//! Single- and multi-connection archive download

use crate::client::http;
use crate::config::TransferConfig;
use crate::error::{RemoteError, Result};
use crate::retry::{retry_when, retry_with_backoff};
use crate::transfer::progress::DownloadProgress;
use crate::transfer::range::{ByteRange, parse_content_range_total, partition};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

/// Bytes buffered per range task before a positional write
const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Stream the whole archive over one connection.
///
/// Aborts without retrying when no bytes arrive within the configured
/// idle timeout, whether waiting for the response or for the body. When
/// the server reports a content length the written size must match it
/// exactly. Returns the number of bytes written.
#[instrument(skip(client, config), fields(path = %archive_path.display()))]
pub async fn download_single(
    client: &Client,
    config: &TransferConfig,
    url: &str,
    archive_path: &Path,
) -> Result<u64> {
    let idle = config.socket_timeout();
    let response = retry_when(
        &config.retry,
        "downloadCache",
        |e| e.is_retryable() && !matches!(e, RemoteError::Timeout { .. }),
        || async {
            let sent = tokio::time::timeout(idle, http::send("downloadCache", client.get(url)));
            let Ok(response) = sent.await else {
                return Err(stalled("downloadCache", idle));
            };
            http::ensure_success("downloadCache", response?).await
        },
    )
    .await?;

    let content_length = response.content_length();
    let progress = content_length.map(|len| Arc::new(DownloadProgress::new(len)));
    let timer = progress
        .as_ref()
        .map(|p| p.start_display_timer(config.progress_interval()));

    let mut file = tokio::fs::File::create(archive_path)
        .await
        .map_err(|e| RemoteError::io("create", archive_path, e))?;

    let mut stream = pin!(response.bytes_stream());
    while let Some(chunk) = next_chunk(&mut stream, idle, "downloadCache").await? {
        file.write_all(&chunk)
            .await
            .map_err(|e| RemoteError::io("write", archive_path, e))?;
        if let Some(progress) = &progress {
            progress.add_received_bytes(chunk.len() as u64);
        }
    }
    file.flush()
        .await
        .map_err(|e| RemoteError::io("flush", archive_path, e))?;
    drop(file);

    if let Some(timer) = timer {
        timer.stop();
    }

    let actual = tokio::fs::metadata(archive_path)
        .await
        .map_err(|e| RemoteError::io("stat", archive_path, e))?
        .len();

    match content_length {
        Some(expected) if expected != actual => {
            Err(RemoteError::IncompleteDownload { expected, actual })
        }
        Some(_) => Ok(actual),
        None => {
            debug!("Unable to validate download, no Content-Length header");
            Ok(actual)
        }
    }
}

/// Download the archive over `config.download_concurrency` ranged
/// connections written at their offsets into one pre-sized file.
///
/// Fails with [`RemoteError::RangeNotSupported`] when the server ignores
/// the first-byte `Range` request; choosing a fallback is up to the caller.
#[instrument(skip(client, config), fields(path = %archive_path.display(), connections = config.download_concurrency))]
pub async fn download_multi(
    client: &Client,
    config: &TransferConfig,
    url: &str,
    archive_path: &Path,
) -> Result<u64> {
    let total = fetch_length(client, config, url).await?;

    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(archive_path)
        .await
        .map_err(|e| RemoteError::io("open", archive_path, e))?;
    file.set_len(total)
        .await
        .map_err(|e| RemoteError::io("truncate", archive_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| RemoteError::io("sync", archive_path, e))?;
    let file = Arc::new(file.into_std().await);

    let progress = Arc::new(DownloadProgress::new(total));
    let timer = progress.start_display_timer(config.progress_interval());

    let ranges = partition(total, config.download_concurrency);
    let mut tasks = JoinSet::new();
    for range in ranges {
        let client = client.clone();
        let config = config.clone();
        let url = url.to_string();
        let path = archive_path.to_path_buf();
        let file = Arc::clone(&file);
        let progress = Arc::clone(&progress);

        tasks.spawn(async move {
            let operation = format!("downloadCache (range: {range})");
            retry_with_backoff(&config.retry, &operation, || {
                download_range(&client, &config, &url, &path, &file, &progress, range)
            })
            .await
        });
    }

    let mut written = 0;
    while let Some(joined) = tasks.join_next().await {
        // Dropping the set on error aborts the remaining ranges
        written += joined.map_err(|e| RemoteError::Task(e.to_string()))??;
    }

    let sync_file = Arc::clone(&file);
    tokio::task::spawn_blocking(move || sync_file.sync_all())
        .await
        .map_err(|e| RemoteError::Task(e.to_string()))?
        .map_err(|e| RemoteError::io("sync", archive_path, e))?;

    timer.stop();

    if written != total {
        return Err(RemoteError::IncompleteDownload {
            expected: total,
            actual: written,
        });
    }

    info!(bytes = total, "Download complete");
    Ok(total)
}

/// Request one byte to learn the archive length from `Content-Range`
async fn fetch_length(client: &Client, config: &TransferConfig, url: &str) -> Result<u64> {
    let first_byte = ByteRange::new(0, 1);
    let response = retry_with_backoff(&config.retry, "downloadCache", || async {
        let request = client.get(url).header(RANGE, first_byte.header_value());
        let response = http::send("downloadCache", request).await?;
        http::ensure_success("downloadCache", response).await
    })
    .await?;

    let Some(content_range) = response.headers().get(CONTENT_RANGE) else {
        debug!(status = %response.status(), "First-byte response has no Content-Range");
        return Err(RemoteError::RangeNotSupported);
    };
    let header = content_range
        .to_str()
        .map_err(|_| RemoteError::InvalidContentRange {
            header: String::from_utf8_lossy(content_range.as_bytes()).into_owned(),
        })?;
    parse_content_range_total(header)
}

/// Fetch one range and write it at its offset.
///
/// On failure the bytes this attempt reported are taken back out of the
/// progress tracker so a retry does not count them twice.
async fn download_range(
    client: &Client,
    config: &TransferConfig,
    url: &str,
    path: &Path,
    file: &Arc<std::fs::File>,
    progress: &DownloadProgress,
    range: ByteRange,
) -> Result<u64> {
    let mut reported = 0;
    let result = fetch_range(client, config, url, path, file, progress, range, &mut reported).await;
    if result.is_err() && reported > 0 {
        progress.remove_received_bytes(reported);
    }
    result
}

async fn fetch_range(
    client: &Client,
    config: &TransferConfig,
    url: &str,
    path: &Path,
    file: &Arc<std::fs::File>,
    progress: &DownloadProgress,
    range: ByteRange,
    reported: &mut u64,
) -> Result<u64> {
    let request = client.get(url).header(RANGE, range.header_value());
    let response = http::send("downloadCache", request).await?;
    let response = http::ensure_success("downloadCache", response).await?;
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(RemoteError::RangeNotSupported);
    }

    let mut stream = pin!(response.bytes_stream());
    let mut buffer = BytesMut::with_capacity(WRITE_BUFFER_SIZE);
    let mut offset = range.start;
    let mut received = 0;

    while let Some(chunk) = next_chunk(&mut stream, config.socket_timeout(), "downloadCache").await? {
        received += chunk.len() as u64;
        if received > range.len {
            return Err(RemoteError::IncompleteDownload {
                expected: range.len,
                actual: received,
            });
        }
        buffer.extend_from_slice(&chunk);
        progress.add_received_bytes(chunk.len() as u64);
        *reported += chunk.len() as u64;

        if buffer.len() >= WRITE_BUFFER_SIZE {
            let data = buffer.split().freeze();
            offset += write_at(file, path, data, offset).await?;
        }
    }
    if !buffer.is_empty() {
        write_at(file, path, buffer.freeze(), offset).await?;
    }

    if received != range.len {
        return Err(RemoteError::IncompleteDownload {
            expected: range.len,
            actual: received,
        });
    }
    Ok(received)
}

async fn write_at(file: &Arc<std::fs::File>, path: &Path, data: Bytes, offset: u64) -> Result<u64> {
    let file = Arc::clone(file);
    let len = data.len() as u64;
    tokio::task::spawn_blocking(move || write_all_at(&file, &data, offset))
        .await
        .map_err(|e| RemoteError::Task(e.to_string()))?
        .map_err(|e| RemoteError::io("write", path, e))?;
    Ok(len)
}

#[cfg(unix)]
fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    Ok(())
}

/// Next body chunk, or a timeout error when the connection goes idle
async fn next_chunk<S>(stream: &mut S, idle: Duration, operation: &str) -> Result<Option<Bytes>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    match tokio::time::timeout(idle, stream.next()).await {
        Err(_) => Err(stalled(operation, idle)),
        Ok(None) => Ok(None),
        Ok(Some(chunk)) => chunk.map(Some).map_err(|e| RemoteError::http(operation, e)),
    }
}

fn stalled(operation: &str, idle: Duration) -> RemoteError {
    debug!(
        timeout_ms = idle.as_millis(),
        "Aborting download, socket timed out"
    );
    RemoteError::timeout(operation, idle)
}
