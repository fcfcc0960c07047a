use std::fmt;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// I/O failure before a response was obtained.
    #[error("network error: {0}")]
    Network(reqwest::Error),
    /// The call was cancelled through its cancellation token.
    #[error("request cancelled")]
    Cancelled,
    /// The session could not refresh its credentials.
    #[error("credential refresh failed: {0}")]
    AuthRefresh(AuthFailure),
    /// Authentication kept failing after the bounded number of refreshes.
    #[error("exceeded max refresh retries ({attempts}), response code {status}: {body}")]
    AuthRetriesExhausted {
        attempts: u32,
        status: u16,
        body: String,
    },
    /// Server kept answering 429 after the allowed retry.
    #[error("rate limit retries exceeded after {attempts} attempt(s)")]
    RateLimitExceeded { attempts: u32 },
    /// Server kept answering 202 beyond the poll wait cap.
    #[error("max wait time exceeded after {attempts} accepted poll(s)")]
    MaxPollWaitExceeded { attempts: u32 },
    /// The account must accept new terms of service before continuing.
    #[error("terms of service must be accepted")]
    TermsOfServiceRequired,
    /// Access is denied for the caller's IP address or location.
    #[error("access blocked from this location or ip address (status {status})")]
    LocationOrIpBlocked { status: u16, body: String },
    /// A cached result was requested but no cache is configured.
    #[error("no response cache configured")]
    CacheUnavailable,
    /// A cached result was requested but the cache had no entry.
    #[error("no cached result for request")]
    CacheMiss,
    /// Non-success HTTP status code with raw response body.
    #[error("request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },
    /// The request URL could not be built.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// A header name or value is not valid HTTP.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    /// Response decoding error.
    #[error("decode error: {0}")]
    Decode(String),
    /// Local file or stream I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// HTTP status of the response that caused this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::AuthRetriesExhausted { status, .. }
            | Self::LocationOrIpBlocked { status, .. }
            | Self::RequestFailed { status, .. } => Some(*status),
            Self::AuthRefresh(failure) => failure.status,
            Self::Network(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

/// Server-side error classification derived from an error body and status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidGrantTokenExpired,
    InvalidGrantInvalidToken,
    AccessDenied,
    InvalidRequest,
    InvalidClient,
    PasswordResetRequired,
    TermsOfServiceRequired,
    NoCreditCardTrialEnded,
    TemporarilyUnavailable,
    ServiceBlocked,
    UnauthorizedDevice,
    GracePeriodExpired,
    NetworkError,
    LocationBlocked,
    IpBlocked,
    Unauthorized,
    NewOwnerNotCollaborator,
    InternalError,
    Other,
}

const KIND_TABLE: &[(ErrorKind, &str, u16)] = &[
    (ErrorKind::InvalidGrantTokenExpired, "invalid_grant", 400),
    (ErrorKind::InvalidGrantInvalidToken, "invalid_grant", 400),
    (ErrorKind::AccessDenied, "access_denied", 403),
    (ErrorKind::InvalidRequest, "invalid_request", 400),
    (ErrorKind::InvalidClient, "invalid_client", 400),
    (ErrorKind::PasswordResetRequired, "password_reset_required", 400),
    (ErrorKind::TermsOfServiceRequired, "terms_of_service_required", 400),
    (ErrorKind::NoCreditCardTrialEnded, "no_credit_card_trial_ended", 400),
    (ErrorKind::TemporarilyUnavailable, "temporarily_unavailable", 429),
    (ErrorKind::ServiceBlocked, "service_blocked", 400),
    (ErrorKind::UnauthorizedDevice, "unauthorized_device", 400),
    (ErrorKind::GracePeriodExpired, "grace_period_expired", 403),
    (ErrorKind::NetworkError, "bad_connection_network_error", 0),
    (ErrorKind::LocationBlocked, "access_from_location_blocked", 403),
    (ErrorKind::IpBlocked, "error_access_from_ip_not_allowed", 403),
    (ErrorKind::Unauthorized, "unauthorized", 401),
    (ErrorKind::NewOwnerNotCollaborator, "new_owner_not_collaborator", 400),
    (ErrorKind::InternalError, "internal_server_error", 500),
];

impl ErrorKind {
    /// Maps a server error code and HTTP status to a kind.
    ///
    /// An exact `(code, status)` match wins; otherwise the code alone decides,
    /// so that e.g. `terms_of_service_required` is recognised on a 401.
    pub fn from_error_info(code: Option<&str>, status: u16) -> Self {
        if status == 500 {
            return Self::InternalError;
        }
        let Some(code) = code else {
            return Self::Other;
        };
        KIND_TABLE
            .iter()
            .find(|(_, value, kind_status)| *value == code && *kind_status == status)
            .or_else(|| KIND_TABLE.iter().find(|(_, value, _)| *value == code))
            .map_or(Self::Other, |(kind, _, _)| *kind)
    }

    /// Wire code for this kind, empty for [`ErrorKind::Other`].
    pub fn code(self) -> &'static str {
        KIND_TABLE
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map_or("", |(_, value, _)| *value)
    }

    /// Refresh failures of these kinds cannot be recovered without a new login.
    pub fn is_fatal_for_refresh(self) -> bool {
        matches!(
            self,
            Self::InvalidGrantInvalidToken
                | Self::InvalidGrantTokenExpired
                | Self::AccessDenied
                | Self::NoCreditCardTrialEnded
                | Self::ServiceBlocked
                | Self::InvalidClient
                | Self::UnauthorizedDevice
                | Self::GracePeriodExpired
                | Self::Unauthorized
        )
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, Self::IpBlocked | Self::LocationBlocked)
    }
}

/// Outcome of a failed credential refresh or login.
///
/// Cloneable because every caller joined to one in-flight refresh receives
/// the same failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthFailure {
    /// Fatal failures revoke the session and require interactive login.
    pub fatal: bool,
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl AuthFailure {
    /// Builds a failure whose fatality follows its kind.
    pub fn from_kind(kind: ErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            fatal: kind.is_fatal_for_refresh(),
            kind,
            status,
            message: message.into(),
        }
    }

    pub fn non_fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: false,
            kind: ErrorKind::Other,
            status: None,
            message: message.into(),
        }
    }

    pub(crate) fn interrupted() -> Self {
        Self {
            fatal: false,
            kind: ErrorKind::Other,
            status: None,
            message: "authentication task was interrupted".to_owned(),
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = if self.fatal { "fatal" } else { "non-fatal" };
        match self.status {
            Some(status) => write!(f, "{severity} ({status}): {}", self.message),
            None => write!(f, "{severity}: {}", self.message),
        }
    }
}
