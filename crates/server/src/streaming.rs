//! Byte-range file serving, origin proxying and download-while-serving.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use common::{join_relpath, PodcastEpisode};
use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::feeds::validate_url;
use crate::scan::entry_path;
use crate::settings::{DOWNLOAD_PODCAST_EPISODES, PODCAST_DOWNLOAD_PATH};
use crate::state::AppState;
use crate::utils::json_error_response;

pub const STREAM_CHUNK_SIZE: usize = 1024 * 1024;
const REMOTE_CACHE_CONTROL: &str = "public, max-age=31536000";
const RELAYED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::CONTENT_RANGE,
    header::CONTENT_LENGTH,
    header::ACCEPT_RANGES,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    Invalid,
    Unsatisfiable,
}

/// Single `bytes=` range: `start-end`, `start-` or suffix `-n`. The end is
/// clamped to the last byte.
pub fn parse_range_header(value: &str, size: u64) -> Result<ByteRange, RangeError> {
    let range = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Invalid)?
        .trim();
    if range.contains(',') {
        return Err(RangeError::Invalid);
    }
    let (start_str, end_str) = range.split_once('-').ok_or(RangeError::Invalid)?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        let suffix: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        if suffix == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let start: u64 = start_str.parse().map_err(|_| RangeError::Invalid)?;
    let end = if end_str.is_empty() {
        None
    } else {
        let end: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        if end < start {
            return Err(RangeError::Invalid);
        }
        Some(end)
    };
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }
    let last = size - 1;
    Ok(ByteRange {
        start,
        end: end.map(|end| end.min(last)).unwrap_or(last),
    })
}

/// Serves a local file. Malformed ranges fall back to the full body.
pub async fn serve_file(path: &Path, range_header: Option<&str>) -> Response {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return json_error_response(StatusCode::NOT_FOUND, "file not found"),
    };
    let content_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();

    let range = match range_header.map(|value| parse_range_header(value, size)) {
        None | Some(Err(RangeError::Invalid)) => None,
        Some(Ok(range)) => Some(range),
        Some(Err(RangeError::Unsatisfiable)) => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", size))
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::empty())
                .unwrap_or_else(|_| internal_error());
        }
    };

    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            warn!("Failed to open {:?}: {}", path, err);
            return json_error_response(StatusCode::NOT_FOUND, "file not found");
        }
    };

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes");
    let result = match range {
        Some(range) => {
            if let Err(err) = file.seek(SeekFrom::Start(range.start)).await {
                warn!("Failed to seek {:?}: {}", path, err);
                return internal_error();
            }
            let stream = ReaderStream::with_capacity(file.take(range.len()), STREAM_CHUNK_SIZE);
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, range.len().to_string())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end, size),
                )
                .body(Body::from_stream(stream))
        }
        None => {
            let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE);
            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size.to_string())
                .body(Body::from_stream(stream))
        }
    };
    result.unwrap_or_else(|_| internal_error())
}

pub async fn stream_media(
    state: &AppState,
    user_id: &str,
    entry_id: &str,
    range_header: Option<&str>,
) -> Response {
    let entry = match state.catalog.get_media(user_id, entry_id) {
        Ok(Some(entry)) => entry,
        Ok(None) => return json_error_response(StatusCode::NOT_FOUND, "entry not found"),
        Err(err) => {
            return json_error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    };
    serve_file(&entry_path(state, &entry), range_header).await
}

/// Serves an episode from the local download when present, otherwise proxies
/// the origin. With downloads enabled, a missing local copy is fetched in the
/// background while the proxied response is served.
pub async fn stream_episode(
    state: &AppState,
    user_id: &str,
    episode_id: &str,
    range_header: Option<&str>,
) -> Response {
    let episode = match state.catalog.get_episode(user_id, episode_id) {
        Ok(Some(episode)) => episode,
        Ok(None) => return json_error_response(StatusCode::NOT_FOUND, "episode not found"),
        Err(err) => {
            return json_error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    };
    let media_url = match episode.media_url.as_deref() {
        Some(url) if !url.trim().is_empty() => url.trim().to_string(),
        _ => return json_error_response(StatusCode::NOT_FOUND, "episode has no media"),
    };
    if validate_url(&media_url).is_err() {
        return json_error_response(StatusCode::BAD_REQUEST, "unsupported media url");
    }

    if state.settings.get_bool(user_id, DOWNLOAD_PODCAST_EPISODES) {
        let target = download_path(state, &episode, &media_url);
        if target.is_file() {
            return serve_file(&target, range_header).await;
        }
        start_download(state, target, media_url.clone());
    }

    proxy_remote(&state.client, &media_url, range_header, state.external_timeout()).await
}

/// Relays an origin response. Only waiting for the response headers is
/// bounded by `timeout`; the body streams for as long as it takes.
pub async fn proxy_remote(
    client: &Client,
    url: &str,
    range_header: Option<&str>,
    timeout: Duration,
) -> Response {
    let mut request = client.get(url);
    if let Some(range) = range_header {
        request = request.header(reqwest::header::RANGE, range);
    }
    let upstream = match tokio::time::timeout(timeout, request.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            warn!("Origin request failed for {}: {}", url, err);
            return json_error_response(StatusCode::BAD_GATEWAY, "origin request failed");
        }
        Err(_) => {
            warn!("Origin request timed out for {}", url);
            return json_error_response(StatusCode::BAD_GATEWAY, "origin timed out");
        }
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder()
        .status(status)
        .header(header::CACHE_CONTROL, REMOTE_CACHE_CONTROL);
    for name in RELAYED_HEADERS.iter() {
        if let Some(value) = upstream.headers().get(name.as_str()) {
            if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                builder = builder.header(name, value);
            }
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| internal_error())
}

/// `<users_root>/<user>/<download folder>/<subscription>/<episode>.<ext>`
pub fn download_path(state: &AppState, episode: &PodcastEpisode, media_url: &str) -> PathBuf {
    let folder = state
        .settings
        .get_or_default(&episode.user_id, PODCAST_DOWNLOAD_PATH);
    join_relpath(&state.user_root(&episode.user_id), &folder)
        .join(&episode.subscription_id)
        .join(format!("{}.{}", episode.id, media_extension(media_url)))
}

fn media_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let name = path.rsplit('/').next().unwrap_or("");
    match name.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty()
                && ext.len() <= 5
                && ext.bytes().all(|b| b.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "mp3".to_string(),
    }
}

/// Starts at most one background download per target path.
fn start_download(state: &AppState, target: PathBuf, url: String) {
    if !state.downloads.lock().insert(target.clone()) {
        debug!("Download already running for {:?}", target);
        return;
    }
    let client = state.client.clone();
    let downloads = state.downloads.clone();
    let timeout = state.external_timeout();
    tokio::spawn(async move {
        match download_to(&client, &url, &target, timeout).await {
            Ok(bytes) => info!("Downloaded {} ({} bytes) to {:?}", url, bytes, target),
            Err(err) => warn!("Download of {} failed: {}", url, err),
        }
        downloads.lock().remove(&target);
    });
}

#[derive(Debug)]
enum DownloadError {
    Io(std::io::Error),
    Http(reqwest::Error),
    Status(u16),
    Timeout,
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::Io(err) => write!(f, "io error: {}", err),
            DownloadError::Http(err) => write!(f, "http error: {}", err),
            DownloadError::Status(status) => write!(f, "unexpected status: {}", status),
            DownloadError::Timeout => write!(f, "origin stalled"),
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Io(err)
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Http(err)
    }
}

/// Writes `url` to `target` through a `.part` file. `timeout` bounds the wait
/// for response headers and for each body chunk.
async fn download_to(
    client: &Client,
    url: &str,
    target: &Path,
    timeout: Duration,
) -> Result<u64, DownloadError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut part_name = target.as_os_str().to_owned();
    part_name.push(".part");
    let part = PathBuf::from(part_name);

    let result = write_part(client, url, &part, timeout).await;
    match result {
        Ok(bytes) => {
            tokio::fs::rename(&part, target).await?;
            Ok(bytes)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(err)
        }
    }
}

async fn write_part(
    client: &Client,
    url: &str,
    part: &Path,
    timeout: Duration,
) -> Result<u64, DownloadError> {
    let response = tokio::time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| DownloadError::Timeout)??;
    if !response.status().is_success() {
        return Err(DownloadError::Status(response.status().as_u16()));
    }
    let mut file = File::create(part).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = tokio::time::timeout(timeout, stream.next())
        .await
        .map_err(|_| DownloadError::Timeout)?
    {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

fn internal_error() -> Response {
    json_error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response")
}
