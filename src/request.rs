use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use url::{form_urlencoded, Url};

use crate::{ApiError, Result};

/// HTTP methods supported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }

    /// True for methods whose successful result should refresh a cache entry.
    pub fn is_mutating(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Delete)
    }

    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Encoding applied to the request body fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ContentType {
    #[default]
    Json,
    UrlEncoded,
    JsonPatch,
}

impl ContentType {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::UrlEncoded => "application/x-www-form-urlencoded",
            Self::JsonPatch => "application/json-patch+json",
        }
    }
}

/// One JSON-patch operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::with_value("add", path, value)
    }

    pub fn replace(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::with_value("replace", path, value)
    }

    pub fn test(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::with_value("test", path, value)
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: "remove".to_owned(),
            path: path.into(),
            value: None,
        }
    }

    fn with_value(op: &str, path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op: op.to_owned(),
            path: path.into(),
            value: Some(value.into()),
        }
    }
}

/// Identity of a request: method, URL, header overrides and query.
///
/// Credentials are not part of the identity, so it is stable across retries.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

/// Declarative description of one API call.
///
/// `Clone` produces an independent copy that shares the cancellation token.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    fields: Vec<(String, Value)>,
    patch: Vec<PatchOp>,
    string_body: Option<String>,
    headers: Vec<(String, String)>,
    content_type: ContentType,
    if_match: Option<String>,
    if_none_match: Option<String>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            fields: Vec::new(),
            patch: Vec::new(),
            string_body: None,
            headers: Vec::new(),
            content_type: ContentType::default(),
            if_match: None,
            if_none_match: None,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn options(url: impl Into<String>) -> Self {
        Self::new(Method::Options, url)
    }

    /// Appends a query parameter. Order is preserved on the wire.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.query.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.query.push((name, value)),
        }
        self
    }

    /// Sets a body field. Re-setting a field keeps its original position.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    /// Appends a JSON-patch operation and switches the content type.
    pub fn patch(mut self, op: PatchOp) -> Self {
        self.patch.push(op);
        self.content_type = ContentType::JsonPatch;
        self
    }

    /// Sends `body` verbatim instead of serializing fields.
    pub fn string_body(mut self, body: impl Into<String>) -> Self {
        self.string_body = Some(body.into());
        self
    }

    /// Adds a header override applied after the engine's own headers.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    pub fn if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Binds the call to an externally owned cancellation token.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body_type(&self) -> ContentType {
        self.content_type
    }

    pub fn if_match_etag(&self) -> Option<&str> {
        self.if_match.as_deref()
    }

    pub fn if_none_match_etag(&self) -> Option<&str> {
        self.if_none_match.as_deref()
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method,
            url: self.url.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
        }
    }

    /// Base URL with the URL-encoded query appended.
    pub fn build_url(&self) -> Result<Url> {
        let mut url =
            Url::parse(&self.url).map_err(|err| ApiError::InvalidUrl(format!("{}: {err}", self.url)))?;
        if !self.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(url)
    }

    /// Serialized body, or `None` when there is nothing to send.
    pub fn body_string(&self) -> Result<Option<String>> {
        if let Some(body) = &self.string_body {
            return Ok(Some(body.clone()));
        }

        match self.content_type {
            ContentType::Json => {
                if self.fields.is_empty() {
                    return Ok(None);
                }
                let object: Map<String, Value> = self.fields.iter().cloned().collect();
                serde_json::to_string(&object)
                    .map(Some)
                    .map_err(|err| ApiError::Decode(format!("invalid json body: {err}")))
            }
            ContentType::UrlEncoded => {
                if self.fields.is_empty() {
                    return Ok(None);
                }
                let mut form = form_urlencoded::Serializer::new(String::new());
                for (name, value) in &self.fields {
                    form.append_pair(name, &form_value(value));
                }
                Ok(Some(form.finish()))
            }
            ContentType::JsonPatch => {
                if self.patch.is_empty() {
                    return Ok(None);
                }
                serde_json::to_string(&self.patch)
                    .map(Some)
                    .map_err(|err| ApiError::Decode(format!("invalid json-patch body: {err}")))
            }
        }
    }
}

pub(crate) fn form_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};
    use url::form_urlencoded;

    use super::{ContentType, Method, PatchOp, Request};

    #[test]
    fn build_url_appends_encoded_query_in_order() {
        let request = Request::get("https://api.example.com/2.0/search")
            .query("query", "q3 report")
            .query("fields", "name,size")
            .query("limit", "10");

        let url = request.build_url().expect("url must build");
        assert_eq!(
            url.as_str(),
            "https://api.example.com/2.0/search?query=q3+report&fields=name%2Csize&limit=10"
        );
    }

    #[test]
    fn build_url_extends_existing_query() {
        let request = Request::get("https://api.example.com/files?version=2").query("a", "ü");
        let url = request.build_url().expect("url must build");
        assert_eq!(url.query(), Some("version=2&a=%C3%BC"));
    }

    #[test]
    fn build_url_rejects_relative_url() {
        assert!(Request::get("/relative/path").build_url().is_err());
    }

    #[test]
    fn json_body_round_trips_fields() {
        let request = Request::post("https://api.example.com/folders")
            .field("name", "Reports")
            .field("parent", json!({ "id": "0" }))
            .field("tags", json!(["a", "b"]))
            .field("size", 12.5)
            .field("shared", true);

        let body = request.body_string().expect("body").expect("non-empty");
        let parsed: Map<String, Value> = serde_json::from_str(&body).expect("valid json");

        assert_eq!(parsed.len(), request.fields().len());
        for (name, value) in request.fields() {
            assert_eq!(parsed.get(name), Some(value));
        }
        let keys: Vec<&str> = parsed.keys().map(String::as_str).collect();
        assert_eq!(keys, ["name", "parent", "tags", "size", "shared"]);
    }

    #[test]
    fn form_body_round_trips_fields() {
        let request = Request::post("https://api.example.com/oauth2/token")
            .content_type(ContentType::UrlEncoded)
            .field("grant_type", "refresh_token")
            .field("refresh_token", "r&t=1")
            .field("client_id", "id with space");

        let body = request.body_string().expect("body").expect("non-empty");
        let parsed: Vec<(String, String)> = form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect();

        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], ("grant_type".to_owned(), "refresh_token".to_owned()));
        assert_eq!(parsed[1], ("refresh_token".to_owned(), "r&t=1".to_owned()));
        assert_eq!(parsed[2], ("client_id".to_owned(), "id with space".to_owned()));
    }

    #[test]
    fn json_patch_body_is_array_of_operations() {
        let request = Request::put("https://api.example.com/files/1/metadata")
            .patch(PatchOp::replace("/name", "new.txt"))
            .patch(PatchOp::remove("/tag"));

        assert_eq!(request.body_type(), ContentType::JsonPatch);
        let body = request.body_string().expect("body").expect("non-empty");
        let parsed: Value = serde_json::from_str(&body).expect("valid json");
        assert_eq!(
            parsed,
            json!([
                { "op": "replace", "path": "/name", "value": "new.txt" },
                { "op": "remove", "path": "/tag" }
            ])
        );
    }

    #[test]
    fn empty_fields_send_no_body() {
        let request = Request::get("https://api.example.com/users/me");
        assert_eq!(request.body_string().expect("body"), None);
    }

    #[test]
    fn string_body_is_sent_verbatim() {
        let request = Request::post("https://api.example.com/x")
            .field("ignored", 1)
            .string_body("{\"raw\":true}");
        assert_eq!(
            request.body_string().expect("body").as_deref(),
            Some("{\"raw\":true}")
        );
    }

    #[test]
    fn repeated_field_keeps_position() {
        let request = Request::post("https://api.example.com/x")
            .field("a", 1)
            .field("b", 2)
            .field("a", 3);
        assert_eq!(request.fields().len(), 2);
        assert_eq!(request.fields()[0], ("a".to_owned(), json!(3)));
    }

    #[test]
    fn accessors_reflect_builder_settings() {
        let request = Request::put("https://api.example.com/files/1")
            .content_type(ContentType::UrlEncoded)
            .if_match("etag-1")
            .if_none_match("etag-2")
            .timeout(std::time::Duration::from_secs(5));

        assert_eq!(request.body_type(), ContentType::UrlEncoded);
        assert_eq!(request.if_match_etag(), Some("etag-1"));
        assert_eq!(request.if_none_match_etag(), Some("etag-2"));
        assert_eq!(request.timeout_override(), Some(std::time::Duration::from_secs(5)));
        assert!(!request.cancellation().is_cancelled());
    }

    #[test]
    fn clone_keeps_identity_and_cancellation() {
        let request = Request::delete("https://api.example.com/files/9")
            .header("X-Trace", "abc")
            .query("force", "true");
        let copy = request.clone();

        assert_eq!(copy.key(), request.key());
        assert_eq!(copy.method(), Method::Delete);
        request.cancellation().cancel();
        assert!(copy.is_cancelled());
    }
}
