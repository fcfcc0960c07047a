use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::{ApiError, ClientOptions, OpenResponse, Request, Result, Session};

const SHARED_LINK_HEADER: &str = "BoxApi";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Outbound body of one attempt.
pub(crate) enum Payload {
    Empty,
    Text(String),
    Stream {
        body: reqwest::Body,
        content_type: String,
    },
}

/// Materializes requests into connections. One connection per call: nothing is
/// kept idle between attempts.
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    http: reqwest::Client,
    options: ClientOptions,
}

impl Transport {
    pub(crate) fn new(options: ClientOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .gzip(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ApiError::Network)?;
        Ok(Self { http, options })
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Headers for one attempt. Request overrides are applied last.
    pub(crate) fn build_headers(
        &self,
        request: &Request,
        session: &Session,
        token: Option<&str>,
        content_type: &str,
    ) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        if let Some(token) = token {
            headers.insert(header::AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
        }
        let user_agent = session.user_agent().unwrap_or(&self.options.user_agent);
        headers.insert(header::USER_AGENT, header_value(user_agent)?);
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(header::ACCEPT_CHARSET, HeaderValue::from_static("utf-8"));
        headers.insert(header::CONTENT_TYPE, header_value(content_type)?);

        if let Some(etag) = request.if_match_etag() {
            headers.insert(header::IF_MATCH, header_value(etag)?);
        }
        if let Some(etag) = request.if_none_match_etag() {
            headers.insert(header::IF_NONE_MATCH, header_value(etag)?);
        }
        if let Some(link) = session.shared_link() {
            headers.insert(
                header_name(SHARED_LINK_HEADER)?,
                header_value(&link.header_value())?,
            );
        }

        for (name, value) in request.headers() {
            headers.insert(header_name(name)?, header_value(value)?);
        }
        Ok(headers)
    }

    /// Opens one attempt and returns the response with its body unread.
    ///
    /// `default_timeout` bounds the whole exchange when the request sets none.
    pub(crate) async fn open(
        &self,
        request: &Request,
        session: &Session,
        token: Option<&str>,
        payload: Payload,
        default_timeout: Option<Duration>,
    ) -> Result<OpenResponse> {
        let url = request.build_url()?;
        let content_type = match &payload {
            Payload::Stream { content_type, .. } => content_type.clone(),
            _ => request.body_type().mime().to_owned(),
        };
        let headers = self.build_headers(request, session, token, &content_type)?;

        let mut builder = self
            .http
            .request(request.method().to_reqwest(), url)
            .headers(headers);
        if let Some(timeout) = request.timeout_override().or(default_timeout) {
            builder = builder.timeout(timeout);
        }
        builder = match payload {
            Payload::Empty => builder,
            Payload::Text(body) => builder.body(body),
            Payload::Stream { body, .. } => builder.body(body),
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(method = request.method().as_str(), url = request.url(), "sending request");

        let cancel = request.cancellation();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            sent = builder.send() => sent.map_err(ApiError::Network)?,
        };
        Ok(OpenResponse::new(response))
    }
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|err| ApiError::InvalidHeader(format!("{name}: {err}")))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| ApiError::InvalidHeader(format!("value: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::header;

    use super::{Transport, SHARED_LINK_HEADER};
    use crate::{
        ClientIdentity, ClientOptions, Credentials, OAuthProvider, Request, Session, SharedLink,
    };

    fn session() -> Session {
        Session::new(
            ClientIdentity::new("id", "secret"),
            Credentials::default(),
            Arc::new(OAuthProvider::new("https://auth.example.com")),
        )
    }

    #[test]
    fn headers_carry_token_and_preconditions() {
        let transport = Transport::new(ClientOptions::default()).expect("transport");
        let request = Request::put("https://api.example.com/files/1")
            .if_match("etag-1")
            .if_none_match("etag-2");

        let headers = transport
            .build_headers(&request, &session(), Some("tok"), "application/json")
            .expect("headers");

        assert_eq!(headers[header::AUTHORIZATION], "Bearer tok");
        assert_eq!(headers[header::ACCEPT_ENCODING], "gzip");
        assert_eq!(headers[header::ACCEPT_CHARSET], "utf-8");
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(headers[header::IF_MATCH], "etag-1");
        assert_eq!(headers[header::IF_NONE_MATCH], "etag-2");
        assert!(headers[header::USER_AGENT]
            .to_str()
            .expect("ascii")
            .starts_with("cloudapi-http/"));
    }

    #[test]
    fn no_token_means_no_authorization() {
        let transport = Transport::new(ClientOptions::default()).expect("transport");
        let request = Request::get("https://api.example.com/shared_items");
        let session = session()
            .with_shared_link(SharedLink::new("https://app.example.com/s/x"))
            .with_user_agent("custom/1.0");

        let headers = transport
            .build_headers(&request, &session, None, "application/json")
            .expect("headers");

        assert!(headers.get(header::AUTHORIZATION).is_none());
        assert_eq!(
            headers[SHARED_LINK_HEADER],
            "shared_link=https://app.example.com/s/x"
        );
        assert_eq!(headers[header::USER_AGENT], "custom/1.0");
    }

    #[test]
    fn request_overrides_win() {
        let transport = Transport::new(ClientOptions::default()).expect("transport");
        let request = Request::get("https://api.example.com/x").header("Accept-Encoding", "identity");

        let headers = transport
            .build_headers(&request, &session(), None, "application/json")
            .expect("headers");
        assert_eq!(headers[header::ACCEPT_ENCODING], "identity");
    }
}
