use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::{ApiError, ErrorKind, Result};

const OAUTH_ERROR_DIRECTIVE: &str = "error";
const OAUTH_INVALID_TOKEN: &str = "invalid_token";

/// A response whose body has not been consumed yet.
///
/// Dropping it releases the underlying connection.
#[derive(Debug)]
pub struct OpenResponse {
    status: StatusCode,
    headers: HeaderMap,
    content_type: Option<String>,
    content_encoding: Option<String>,
    inner: reqwest::Response,
}

impl OpenResponse {
    pub(crate) fn new(inner: reqwest::Response) -> Self {
        let headers = inner.headers().clone();
        Self {
            status: inner.status(),
            content_type: header_string(&headers, CONTENT_TYPE.as_str()),
            content_encoding: header_string(&headers, CONTENT_ENCODING.as_str()),
            headers,
            inner,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    /// Reads the next body chunk, `None` at end of body.
    pub(crate) async fn chunk(&mut self) -> Result<Option<bytes::Bytes>> {
        self.inner.chunk().await.map_err(ApiError::Network)
    }

    /// Reads the whole body into a [`Response`] envelope.
    pub async fn into_buffered(self) -> Result<Response> {
        let body = self.inner.text().await.map_err(ApiError::Network)?;
        Ok(Response {
            status: self.status,
            headers: self.headers,
            body,
        })
    }
}

/// Fully buffered response envelope for one attempt.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

/// Error payload returned by the API on failures.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ServerError {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl ServerError {
    /// Error code, preferring the OAuth `error` field over `code`.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_deref().or(self.code.as_deref())
    }
}

impl Response {
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        header_string(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<String> {
        self.header(CONTENT_TYPE.as_str())
    }

    /// True when `WWW-Authenticate` carries `error="invalid_token"`.
    pub fn has_invalid_token_challenge(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
            && self
                .headers
                .get_all(WWW_AUTHENTICATE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .any(challenge_has_invalid_token)
    }

    /// `Retry-After` in milliseconds, or `default_millis` when absent or invalid.
    pub fn retry_after_millis(&self, default_millis: u64) -> u64 {
        let Some(value) = self.header(RETRY_AFTER.as_str()) else {
            return default_millis;
        };
        match value.trim().parse::<i64>() {
            Ok(seconds) if seconds > 0 => u64::try_from(seconds)
                .unwrap_or(u64::MAX / 1000)
                .saturating_mul(1000),
            Ok(_) => 1000,
            Err(_) => default_millis,
        }
    }

    /// Parsed error payload, if the body is a JSON error object.
    pub fn server_error(&self) -> Option<ServerError> {
        serde_json::from_str::<ServerError>(&self.body).ok()
    }

    pub fn error_kind(&self) -> ErrorKind {
        let error = self.server_error();
        ErrorKind::from_error_info(
            error.as_ref().and_then(ServerError::error_code),
            self.status_code(),
        )
    }
}

fn challenge_has_invalid_token(header: &str) -> bool {
    header.split(',').any(|directive| {
        let mut parts = directive.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => {
                let key = key.trim();
                // first directive carries the scheme, e.g. `Bearer realm="x"`
                let key = key.rsplit(' ').next().unwrap_or(key);
                key.eq_ignore_ascii_case(OAUTH_ERROR_DIRECTIVE)
                    && value
                        .replace('"', "")
                        .trim()
                        .eq_ignore_ascii_case(OAUTH_INVALID_TOKEN)
            }
            _ => false,
        }
    })
}

pub(crate) fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}
