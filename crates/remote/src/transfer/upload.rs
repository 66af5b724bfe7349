//! Chunked concurrent archive upload

use crate::client::contracts::UploadPart;
use crate::client::http;
use crate::config::RetryConfig;
use crate::error::{RemoteError, Result};
use crate::retry::retry_with_backoff;
use crate::transfer::range::{ByteRange, partition};
use futures::future::try_join_all;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Body, Client};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};

/// Upload `archive_path` to the reserved chunk URLs.
///
/// The file is split into `urls.len()` ranges of `ceil(size / urls.len())`
/// bytes; range `i` goes to `urls[i]`. All chunks upload concurrently,
/// each retried independently. Returns the parts in part-number order.
/// URLs left over when the file is too small for every chunk are unused.
#[instrument(skip(client, retry, urls), fields(path = %archive_path.display(), chunks = urls.len()))]
pub async fn upload_chunks(
    client: &Client,
    retry: &RetryConfig,
    urls: &[String],
    archive_path: &Path,
) -> Result<Vec<UploadPart>> {
    let file_size = tokio::fs::metadata(archive_path)
        .await
        .map_err(|e| RemoteError::io("stat", archive_path, e))?
        .len();

    if urls.is_empty() {
        return if file_size == 0 {
            Ok(Vec::new())
        } else {
            Err(RemoteError::Config(
                "cache reservation returned no upload URLs".to_string(),
            ))
        };
    }

    let ranges = partition(file_size, urls.len());
    debug!(file_size, parts = ranges.len(), "Awaiting all uploads");

    let uploads = ranges
        .into_iter()
        .zip(urls)
        .enumerate()
        .map(|(index, (range, url))| async move {
            let part_number = index + 1;
            let operation = format!("uploadChunk (start: {}, end: {})", range.start, range.last());
            let e_tag = retry_with_backoff(retry, &operation, || {
                upload_chunk(client, url, archive_path, range, part_number)
            })
            .await?;
            Ok::<_, RemoteError>(UploadPart { part_number, e_tag })
        });

    let parts = try_join_all(uploads).await?;
    info!(parts = parts.len(), "All chunks uploaded");
    Ok(parts)
}

async fn upload_chunk(
    client: &Client,
    url: &str,
    archive_path: &Path,
    range: ByteRange,
    part_number: usize,
) -> Result<String> {
    debug!(
        offset = range.start,
        size = range.len,
        part_number,
        "Uploading chunk"
    );

    // Each attempt reads its span afresh so retries resend the same bytes
    let mut file = tokio::fs::File::open(archive_path)
        .await
        .map_err(|e| RemoteError::io("open", archive_path, e))?;
    file.seek(SeekFrom::Start(range.start))
        .await
        .map_err(|e| RemoteError::io("seek", archive_path, e))?;
    let body = Body::wrap_stream(ReaderStream::new(file.take(range.len)));

    let request = client
        .put(url)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, range.len)
        .body(body);

    let response = http::send("uploadChunk", request).await?;
    let response = http::ensure_success("uploadChunk", response).await?;

    response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or(RemoteError::MissingETag { part_number })
}
