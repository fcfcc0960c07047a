use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{ready, Either};
use futures::{stream, StreamExt};
use serde_json::Value;
use tokio_util::io::ReaderStream;

use crate::{
    client::{buffer, Body},
    progress::report_progress,
    request::form_value,
    transport::Payload,
    ApiClient, ApiError, ApiObject, ProgressListener, Request, Result,
};

/// Fixed multipart boundary token.
pub const MULTIPART_BOUNDARY: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

/// Bytes to upload. A path is reopened for every attempt.
#[derive(Clone, Debug)]
pub enum UploadSource {
    Path(PathBuf),
    Bytes(Bytes),
}

/// A multipart file upload: form fields first, then the file part.
#[derive(Clone)]
pub struct UploadRequest {
    request: Request,
    file_name: String,
    source: UploadSource,
    progress: Option<Arc<dyn ProgressListener>>,
}

impl UploadRequest {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>, source: UploadSource) -> Self {
        Self {
            request: Request::post(url),
            file_name: file_name.into(),
            source,
            progress: None,
        }
    }

    /// Folder that receives a new file.
    pub fn parent_id(self, id: impl Into<String>) -> Self {
        self.field("parent_id", id.into())
    }

    /// Adds a form field written before the file part.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request = self.request.field(name, value);
        self
    }

    /// Uploads a new version only if the current one still has `etag`.
    pub fn if_match(mut self, etag: impl Into<String>) -> Self {
        self.request = self.request.if_match(etag);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request = self.request.header(name, value);
        self
    }

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

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Field parts plus the file part header, up to the first file byte.
    fn preamble(&self) -> String {
        let mut head = String::new();
        for (name, value) in self.request.fields() {
            let _ = write!(
                head,
                "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                quote(name),
                form_value(value)
            );
        }
        let _ = write!(
            head,
            "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            quote(&self.file_name)
        );
        head
    }

    /// Builds the streamed body for one attempt.
    pub(crate) async fn payload(&self) -> Result<Payload> {
        let (source, total) = match &self.source {
            UploadSource::Path(path) => {
                let file = tokio::fs::File::open(path).await?;
                let total = file.metadata().await?.len();
                (Either::Left(ReaderStream::new(file)), total)
            }
            UploadSource::Bytes(bytes) => (
                Either::Right(stream::once(ready(Ok(bytes.clone())))),
                bytes.len() as u64,
            ),
        };

        let head = stream::once(ready(Ok(Bytes::from(self.preamble()))));
        let tail = stream::once(ready(Ok(Bytes::from(format!(
            "\r\n--{MULTIPART_BOUNDARY}--\r\n"
        )))));
        let body = head
            .chain(report_progress(source, self.progress.clone(), Some(total)))
            .chain(tail);

        Ok(Payload::Stream {
            body: reqwest::Body::wrap_stream(body),
            content_type: format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
        })
    }
}

impl ApiClient {
    /// Uploads a file and returns the decoded response body.
    ///
    /// Shares the retry loop of every other call; each resend streams the
    /// whole source again.
    pub async fn upload(&self, request: UploadRequest) -> Result<ApiObject> {
        let wire = request.request();
        let open = self
            .execute(wire, &Body::Upload(&request), false, None)
            .await?;
        let response = buffer(open, wire).await?;
        serde_json::from_str(&response.body).map_err(|err| {
            ApiError::Decode(format!(
                "invalid upload response JSON: {err}; body: {}",
                response.body
            ))
        })
    }
}

fn quote(value: &str) -> String {
    value.replace('"', "%22").replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{UploadRequest, UploadSource, MULTIPART_BOUNDARY};

    #[test]
    fn preamble_writes_fields_before_file_part() {
        let request = UploadRequest::new(
            "https://upload.example.com/files/content",
            "q\"3.txt",
            UploadSource::Bytes(Bytes::from_static(b"hello")),
        )
        .parent_id("0");

        let head = request.preamble();
        let expected = format!(
            "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"parent_id\"\r\n\r\n0\r\n\
             --{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"q%223.txt\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        );
        assert_eq!(head, expected);
    }
}
