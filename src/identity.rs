use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header;

use crate::{AuthFailure, ClientOptions, ContentType, Credentials, ErrorKind, Request, Response};

const TOKEN_PATH: &str = "/oauth2/token";
const REVOKE_PATH: &str = "/oauth2/revoke";

/// OAuth client registration sent along with every token request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub client_secret: String,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            device_id: None,
            device_name: None,
        }
    }

    /// Adds the device fields the server uses for device pinning.
    pub fn with_device(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.device_id = Some(id.into());
        self.device_name = Some(name.into());
        self
    }

    fn sign(&self, mut request: Request) -> Request {
        request = request
            .field("client_id", self.client_id.as_str())
            .field("client_secret", self.client_secret.as_str());
        if let Some(id) = self.device_id.as_deref().filter(|id| !id.is_empty()) {
            request = request.field("device_id", id);
        }
        if let Some(name) = self.device_name.as_deref().filter(|name| !name.is_empty()) {
            request = request.field("device_name", name);
        }
        request
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .finish()
    }
}

/// Token endpoint used by a session. Only the session's refresh, login and
/// logout operations call it.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchanges the refresh token for new credentials.
    async fn refresh(
        &self,
        client: &ClientIdentity,
        credentials: &Credentials,
    ) -> Result<Credentials, AuthFailure>;

    /// Runs a first-time login and returns the resulting credentials.
    async fn authorize(&self, client: &ClientIdentity) -> Result<Credentials, AuthFailure>;

    /// Invalidates the credentials server-side.
    async fn revoke(&self, client: &ClientIdentity, credentials: &Credentials)
        -> Result<(), AuthFailure>;
}

/// Interactive part of a login, implemented by the host application.
#[async_trait]
pub trait LoginFlow: Send + Sync {
    /// Shows the login UI and returns the authorization code it produced.
    async fn authorization_code(&self) -> Result<String, AuthFailure>;
}

/// [`IdentityProvider`] talking to `<base>/oauth2/token` and `<base>/oauth2/revoke`
/// with form-encoded requests.
#[derive(Clone)]
pub struct OAuthProvider {
    http: reqwest::Client,
    base_url: String,
    user_agent: String,
    timeout: Duration,
    login: Option<Arc<dyn LoginFlow>>,
}

impl fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .field("login", &self.login.is_some())
            .finish()
    }
}

impl OAuthProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let options = ClientOptions::default();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            timeout: options.timeout(),
            user_agent: options.user_agent,
            login: None,
        }
    }

    /// Applies timeout and user agent.
    pub fn with_options(mut self, options: &ClientOptions) -> Self {
        self.timeout = options.timeout();
        self.user_agent = options.user_agent.clone();
        self
    }

    pub fn with_login_flow(mut self, login: Arc<dyn LoginFlow>) -> Self {
        self.login = Some(login);
        self
    }

    pub fn token_url(&self) -> String {
        format!("{}{TOKEN_PATH}", self.base_url)
    }

    pub fn revoke_url(&self) -> String {
        format!("{}{REVOKE_PATH}", self.base_url)
    }

    async fn post_form(&self, request: Request) -> Result<Response, AuthFailure> {
        let url = request
            .build_url()
            .map_err(|err| AuthFailure::non_fatal(err.to_string()))?;
        let body = request
            .body_string()
            .map_err(|err| AuthFailure::non_fatal(err.to_string()))?
            .unwrap_or_default();

        let sent = self
            .http
            .post(url)
            .header(header::CONTENT_TYPE, ContentType::UrlEncoded.mime())
            .header(header::USER_AGENT, &self.user_agent)
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(network_failure)?;

        let status = sent.status();
        let headers = sent.headers().clone();
        let body = sent.text().await.map_err(network_failure)?;
        let response = Response {
            status,
            headers,
            body,
        };

        if !status.is_success() {
            return Err(failure_from_response(&response));
        }
        Ok(response)
    }

    async fn request_token(&self, request: Request) -> Result<Credentials, AuthFailure> {
        let response = self.post_form(request).await?;
        let mut credentials: Credentials = serde_json::from_str(&response.body).map_err(|err| {
            AuthFailure::non_fatal(format!("invalid token response JSON: {err}"))
        })?;
        if credentials.access_token.is_none() {
            return Err(AuthFailure::non_fatal("token response has no access_token"));
        }
        credentials.refreshed_at = Some(Utc::now());
        Ok(credentials)
    }

    fn form(&self, url: String) -> Request {
        Request::post(url).content_type(ContentType::UrlEncoded)
    }
}

#[async_trait]
impl IdentityProvider for OAuthProvider {
    async fn refresh(
        &self,
        client: &ClientIdentity,
        credentials: &Credentials,
    ) -> Result<Credentials, AuthFailure> {
        let Some(refresh_token) = credentials.refresh_token.as_deref() else {
            return Err(AuthFailure::from_kind(
                ErrorKind::InvalidGrantInvalidToken,
                None,
                "no refresh token available",
            ));
        };

        let request = self
            .form(self.token_url())
            .field("grant_type", "refresh_token")
            .field("refresh_token", refresh_token);
        self.request_token(client.sign(request)).await
    }

    async fn authorize(&self, client: &ClientIdentity) -> Result<Credentials, AuthFailure> {
        let Some(login) = &self.login else {
            return Err(AuthFailure::non_fatal("no interactive login flow configured"));
        };
        let code = login.authorization_code().await?;

        let request = self
            .form(self.token_url())
            .field("grant_type", "authorization_code")
            .field("code", code);
        self.request_token(client.sign(request)).await
    }

    async fn revoke(
        &self,
        client: &ClientIdentity,
        credentials: &Credentials,
    ) -> Result<(), AuthFailure> {
        let token = credentials
            .refresh_token
            .as_deref()
            .or(credentials.access_token.as_deref());
        let Some(token) = token else {
            return Ok(());
        };

        let request = self.form(self.revoke_url()).field("token", token);
        self.post_form(client.sign(request)).await.map(|_| ())
    }
}

fn network_failure(err: reqwest::Error) -> AuthFailure {
    AuthFailure::from_kind(ErrorKind::NetworkError, None, err.to_string())
}

fn failure_from_response(response: &Response) -> AuthFailure {
    let message = response
        .server_error()
        .and_then(|error| error.error_description.or(error.message))
        .unwrap_or_else(|| response.body.clone());
    AuthFailure::from_kind(response.error_kind(), Some(response.status_code()), message)
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;

    use super::{failure_from_response, ClientIdentity, OAuthProvider};
    use crate::{ErrorKind, Request, Response};

    #[test]
    fn endpoint_urls_strip_trailing_slash() {
        let provider = OAuthProvider::new("https://auth.example.com/");
        assert_eq!(provider.token_url(), "https://auth.example.com/oauth2/token");
        assert_eq!(provider.revoke_url(), "https://auth.example.com/oauth2/revoke");
    }

    #[test]
    fn sign_adds_client_and_device_fields() {
        let client = ClientIdentity::new("id", "secret").with_device("dev-1", "Pixel");
        let request = client.sign(Request::post("https://auth.example.com/oauth2/token"));
        let names: Vec<&str> = request.fields().iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["client_id", "client_secret", "device_id", "device_name"]);
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", ClientIdentity::new("id", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn invalid_grant_is_fatal() {
        let response = Response {
            status: StatusCode::BAD_REQUEST,
            headers: HeaderMap::new(),
            body: r#"{"error":"invalid_grant","error_description":"Refresh token has expired"}"#
                .to_owned(),
        };
        let failure = failure_from_response(&response);
        assert!(failure.fatal);
        assert_eq!(failure.kind, ErrorKind::InvalidGrantTokenExpired);
        assert_eq!(failure.message, "Refresh token has expired");
    }

    #[test]
    fn unavailable_is_not_fatal() {
        let response = Response {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers: HeaderMap::new(),
            body: r#"{"error":"temporarily_unavailable"}"#.to_owned(),
        };
        assert!(!failure_from_response(&response).fatal);
    }
}
