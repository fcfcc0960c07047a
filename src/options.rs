use std::time::Duration;

use crate::session::Credentials;

/// Default OAuth endpoint base used by [`crate::OAuthProvider`].
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://api.box.com";

/// Configures transport timeout and identification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt timeout in milliseconds, overridable per request.
    pub timeout_ms: u64,
    /// Value of the `User-Agent` header when the session sets none.
    pub user_agent: String,
}

impl ClientOptions {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: concat!("cloudapi-http/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

/// Session parameters read from the environment.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub client_id: String,
    pub client_secret: String,
    pub credentials: Credentials,
    pub oauth_base_url: String,
}

impl SessionConfig {
    /// Reads session configuration from environment variables.
    ///
    /// Reads:
    /// - `CLOUDAPI_CLIENT_ID` / `CLOUDAPI_CLIENT_SECRET`: OAuth client
    /// - `CLOUDAPI_ACCESS_TOKEN`: current access token (optional)
    /// - `CLOUDAPI_REFRESH_TOKEN`: refresh token
    /// - `CLOUDAPI_OAUTH_BASE_URL`: token endpoint base (optional)
    ///
    /// Returns an error if a required variable is missing or empty.
    pub fn from_env() -> Result<Self, String> {
        let client_id = required_env("CLOUDAPI_CLIENT_ID")?;
        let client_secret = required_env("CLOUDAPI_CLIENT_SECRET")?;
        let refresh_token = required_env("CLOUDAPI_REFRESH_TOKEN")?;
        let access_token = std::env::var("CLOUDAPI_ACCESS_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let oauth_base_url = std::env::var("CLOUDAPI_OAUTH_BASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OAUTH_BASE_URL.to_owned());

        Ok(Self {
            client_id,
            client_secret,
            credentials: Credentials {
                access_token,
                refresh_token: Some(refresh_token),
                ..Credentials::default()
            },
            oauth_base_url,
        })
    }
}

fn required_env(name: &str) -> Result<String, String> {
    let value =
        std::env::var(name).map_err(|_| format!("missing {name} environment variable"))?;
    if value.trim().is_empty() {
        return Err(format!("{name} is set but empty"));
    }
    Ok(value.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::ClientOptions;

    #[test]
    fn default_options_identify_the_crate() {
        let options = ClientOptions::default();
        assert_eq!(options.timeout_ms, 30_000);
        assert!(options.user_agent.starts_with("cloudapi-http/"));
    }
}
