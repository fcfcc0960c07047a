//! `cloudapi-http` is an async engine for authenticated cloud-storage API calls.
//!
//! An [`ApiClient`] turns a declarative [`Request`] into an HTTP exchange and
//! retries it transparently:
//! - expired credentials are refreshed once through the [`Session`], shared
//!   by every concurrent caller
//! - a rate-limited call is retried once after `Retry-After`
//! - a download answered with 202 polls with growing waits
//!
//! Entry points:
//! - [`ApiClient::send_json`] / [`ApiClient::send_with`]
//! - [`ApiClient::download`] / [`ApiClient::download_to_writer`]
//! - [`ApiClient::upload`]

mod cache;
mod client;
mod download;
mod error;
mod flight;
mod identity;
mod notify;
mod options;
mod payload;
mod progress;
mod request;
mod response;
pub mod retry;
mod scheduler;
mod session;
mod transport;
mod upload;

pub use cache::{MemoryCache, ResponseCache};
pub use client::ApiClient;
pub use download::{ContentRange, DownloadInfo, DownloadRequest};
pub use error::{ApiError, AuthFailure, ErrorKind};
pub use identity::{ClientIdentity, IdentityProvider, LoginFlow, OAuthProvider};
pub use notify::{AuthNotifier, NoopNotifier};
pub use options::{ClientOptions, SessionConfig, DEFAULT_OAUTH_BASE_URL};
pub use payload::ApiObject;
pub use progress::{DownloadStartListener, ProgressListener};
pub use request::{ContentType, Method, PatchOp, Request, RequestKey};
pub use response::{OpenResponse, Response, ServerError};
pub use scheduler::{Scheduler, Sleeper, TokioSleeper};
pub use session::{AuthListener, Credentials, FlightKey, Session, SharedLink, TaskKey};
pub use upload::{UploadRequest, UploadSource, MULTIPART_BOUNDARY};

pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, ApiError>;
