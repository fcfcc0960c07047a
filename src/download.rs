//! File downloads: byte ranges, accepted-poll handling and streaming into a sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    client::Body, response::header_string, ApiClient, ApiError, DownloadStartListener,
    OpenResponse, ProgressListener, Request, Result,
};

const FALLBACK_FILE_NAME: &str = "download";
const EXPIRATION: &str = "expiration";

/// A download call. Sent as GET with `log_content_access=true`.
#[derive(Clone)]
pub struct DownloadRequest {
    request: Request,
    resume: bool,
    progress: Option<Arc<dyn ProgressListener>>,
    on_start: Option<Arc<dyn DownloadStartListener>>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            request: Request::get(url).query("log_content_access", "true"),
            resume: false,
            progress: None,
            on_start: None,
        }
    }

    /// Downloads a specific file version.
    pub fn version(mut self, version_id: impl Into<String>) -> Self {
        self.request = self.request.query("version", version_id);
        self
    }

    /// Whether the server records this download as a content access.
    pub fn content_access(mut self, log: bool) -> Self {
        self.request = self.request.query("log_content_access", log.to_string());
        self
    }

    /// Requests bytes `start..=end`. A file sink is overwritten.
    pub fn range(mut self, start: u64, end: u64) -> Self {
        self.resume = false;
        self.request = self.request.header("Range", format!("bytes={start}-{end}"));
        self
    }

    /// Requests everything from `start` on and appends to an existing file sink.
    pub fn resume_from(mut self, start: u64) -> Self {
        self.resume = start > 0;
        self.request = self.request.header("Range", format!("bytes={start}-"));
        self
    }

    pub fn if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.request = self.request.if_none_match(etag);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request = self.request.header(name, value);
        self
    }

    /// Bounds the whole exchange, body included. Downloads have no default bound.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request = self.request.timeout(timeout);
        self
    }

    pub fn cancel_token(mut self, token: tokio_util::sync::CancellationToken) -> Self {
        self.request = self.request.cancel_token(token);
        self
    }

    pub fn progress_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.progress = Some(listener);
        self
    }

    pub fn start_listener(mut self, listener: Arc<dyn DownloadStartListener>) -> Self {
        self.on_start = Some(listener);
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }
}

/// `Content-Range` of a partial response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server sent `*`.
    pub total: Option<u64>,
}

/// Metadata of a finished (or skipped) download.
///
/// Left at its default when the server answered a 2xx other than 200/206.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DownloadInfo {
    pub file_name: Option<String>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_range: Option<ContentRange>,
    pub date: Option<DateTime<Utc>>,
    pub expiration: Option<DateTime<Utc>>,
    pub output_path: Option<PathBuf>,
    pub bytes_written: u64,
}

impl DownloadInfo {
    fn from_response(open: &OpenResponse) -> Self {
        let headers = open.headers();
        Self {
            file_name: header_string(headers, header::CONTENT_DISPOSITION.as_str())
                .and_then(|value| content_disposition_file_name(&value)),
            content_length: header_u64(headers, header::CONTENT_LENGTH.as_str()),
            content_type: open.content_type().map(str::to_owned),
            content_encoding: open.content_encoding().map(str::to_owned),
            content_range: header_string(headers, header::CONTENT_RANGE.as_str())
                .and_then(|value| parse_content_range(&value)),
            date: header_date(headers, header::DATE.as_str()),
            expiration: header_date(headers, EXPIRATION),
            output_path: None,
            bytes_written: 0,
        }
    }
}

impl ApiClient {
    /// Downloads into a file.
    ///
    /// When `target` is a directory the file is named after the server's
    /// `Content-Disposition`. A resumed download appends to the file.
    pub async fn download(
        &self,
        request: DownloadRequest,
        target: impl AsRef<Path>,
    ) -> Result<DownloadInfo> {
        let Some(mut open) = self.open_download(&request).await? else {
            return Ok(DownloadInfo::default());
        };
        let mut info = DownloadInfo::from_response(&open);

        let target = target.as_ref();
        let path = match tokio::fs::metadata(target).await {
            Ok(metadata) if metadata.is_dir() => target.join(safe_file_name(info.file_name.as_deref())),
            _ => target.to_path_buf(),
        };
        if let Some(listener) = &request.on_start {
            listener.on_start(&info);
        }

        let append = request.resume && open.status().as_u16() == 206;
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let mut file = options.open(&path).await?;

        match copy_body(&mut open, &mut file, &request, info.content_length).await {
            Ok(written) => {
                drop(open);
                file.flush().await?;
                info.bytes_written = written;
                info.output_path = Some(path);
                Ok(info)
            }
            Err(err) => {
                drop(open);
                // the copy error wins over a failing flush
                let _ = file.flush().await;
                drop(file);
                Err(err)
            }
        }
    }

    /// Downloads into a caller-owned writer. The writer is flushed on success
    /// and never closed.
    pub async fn download_to_writer<W>(
        &self,
        request: DownloadRequest,
        writer: &mut W,
    ) -> Result<DownloadInfo>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let Some(mut open) = self.open_download(&request).await? else {
            return Ok(DownloadInfo::default());
        };
        let mut info = DownloadInfo::from_response(&open);
        if let Some(listener) = &request.on_start {
            listener.on_start(&info);
        }

        let written = copy_body(&mut open, writer, &request, info.content_length).await;
        drop(open);
        info.bytes_written = written?;
        writer.flush().await?;
        Ok(info)
    }

    async fn open_download(&self, request: &DownloadRequest) -> Result<Option<OpenResponse>> {
        let open = self
            .execute(&request.request, &Body::Serialized(None), true, None)
            .await?;
        match open.status().as_u16() {
            200 | 206 => Ok(Some(open)),
            _status => {
                #[cfg(feature = "tracing")]
                tracing::debug!(status = _status, "download returned no content");
                Ok(None)
            }
        }
    }
}

async fn copy_body<W>(
    open: &mut OpenResponse,
    writer: &mut W,
    request: &DownloadRequest,
    total: Option<u64>,
) -> Result<u64>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let cancel = request.request.cancellation();
    let mut written = 0u64;
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            chunk = open.chunk() => chunk?,
        };
        let Some(bytes) = chunk else {
            return Ok(written);
        };
        writer.write_all(&bytes).await?;
        written += bytes.len() as u64;
        if let Some(listener) = &request.progress {
            listener.on_progress(written, total);
        }
    }
}

/// File name from `Content-Disposition`, preferring the RFC 5987 `filename*` form.
pub(crate) fn content_disposition_file_name(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';') {
        let Some((name, raw)) = part.split_once('=') else {
            continue;
        };
        let raw = raw.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
                if let Ok(decoded) = urlencoding::decode(encoded.trim_matches('"')) {
                    return Some(decoded.into_owned());
                }
            }
            "filename" => plain = Some(raw.trim_matches('"').to_owned()),
            _ => {}
        }
    }
    plain.filter(|name| !name.is_empty())
}

pub(crate) fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        total: total.trim().parse().ok(),
    })
}

fn safe_file_name(name: Option<&str>) -> String {
    name.and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .unwrap_or(FALLBACK_FILE_NAME)
        .to_owned()
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_string(headers, name).and_then(|value| value.trim().parse().ok())
}

fn header_date(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    header_string(headers, name)
        .and_then(|value| DateTime::parse_from_rfc2822(value.trim()).ok())
        .map(|date| date.with_timezone(&Utc))
}
