use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{
    cache::ResponseCache,
    retry::{self, RetryState, Verdict},
    transport::{Payload, Transport},
    upload::UploadRequest,
    ApiError, ApiObject, AuthFailure, ClientOptions, ErrorKind, Method, OpenResponse, Request,
    Response, Result, Scheduler, Session,
};

/// Body source of a call, materialized again for every attempt.
pub(crate) enum Body<'a> {
    Serialized(Option<String>),
    Upload(&'a UploadRequest),
}

impl Body<'_> {
    async fn payload(&self) -> Result<Payload> {
        match self {
            Self::Serialized(None) => Ok(Payload::Empty),
            Self::Serialized(Some(text)) => Ok(Payload::Text(text.clone())),
            Self::Upload(upload) => upload.payload().await,
        }
    }
}

/// Executes [`Request`]s on behalf of a [`Session`].
///
/// Every call runs through one retry loop: expired credentials are refreshed
/// through the session, a 429 is retried once, and downloads poll while the
/// server answers 202.
#[derive(Clone)]
pub struct ApiClient {
    session: Arc<Session>,
    transport: Transport,
    cache: Option<Arc<dyn ResponseCache>>,
    scheduler: Scheduler,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("session", &self.session)
            .field("options", self.transport.options())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl ApiClient {
    pub fn new(session: Arc<Session>) -> Result<Self> {
        Ok(Self {
            scheduler: session.scheduler().clone(),
            transport: Transport::new(ClientOptions::default())?,
            cache: None,
            session,
        })
    }

    /// Applies client options such as timeout and user agent.
    pub fn with_options(mut self, options: ClientOptions) -> Result<Self> {
        self.transport = Transport::new(options)?;
        Ok(self)
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Runs waits and spawned calls on `scheduler` instead of the session's.
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Sends `request` and decodes the JSON body into `T`.
    ///
    /// With a cache configured, GET calls are answered from it when possible
    /// and successful results are written back (see [`ApiClient::send_cached`]).
    pub async fn send_json<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        if request.method() == Method::Get {
            if let Some(cache) = &self.cache {
                if let Some(value) = cache.get(&request.key()).await {
                    return decode_value(value);
                }
            }
        }

        let value = self.send_with(request.clone(), decode_json).await?;
        self.update_cache(&request, &value).await;
        decode_value(value)
    }

    /// Sends `request` and returns the body as an [`ApiObject`].
    pub async fn send_object(&self, request: Request) -> Result<ApiObject> {
        self.send_json(request).await
    }

    /// Sends `request` and hands the successful response to `decode`.
    pub async fn send_with<T, F>(&self, request: Request, decode: F) -> Result<T>
    where
        F: FnOnce(Response) -> Result<T>,
    {
        let body = Body::Serialized(request.body_string()?);
        let open = self
            .execute(&request, &body, false, Some(self.transport.options().timeout()))
            .await?;
        let response = buffer(open, &request).await?;
        decode(response)
    }

    /// Sends `request` and returns the buffered response envelope.
    pub async fn send_raw(&self, request: Request) -> Result<Response> {
        self.send_with(request, Ok).await
    }

    /// Answers `request` from the cache only; nothing is sent.
    pub async fn send_cached<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        let cache = self.cache.as_ref().ok_or(ApiError::CacheUnavailable)?;
        let value = cache.get(&request.key()).await.ok_or(ApiError::CacheMiss)?;
        decode_value(value)
    }

    /// Spawns [`ApiClient::send_json`] on the client's scheduler.
    pub fn to_task<T>(&self, request: Request) -> JoinHandle<Result<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        self.scheduler
            .spawn(async move { client.send_json(request).await })
    }

    /// The shared retry loop. Returns the first deliverable response unread.
    ///
    /// A 2xx is deliverable unless `polls` is set and it is a 202. Every other
    /// response is buffered, classified and either retried or turned into an
    /// error. Attempts are strictly sequential: the previous response is
    /// dropped, and its connection closed, before the next one is opened.
    pub(crate) async fn execute(
        &self,
        request: &Request,
        body: &Body<'_>,
        polls: bool,
        timeout: Option<std::time::Duration>,
    ) -> Result<OpenResponse> {
        let cancel = request.cancellation();
        let mut state = RetryState::default();

        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }

            let token = self.session.access_token();
            let payload = body.payload().await?;
            let open = self
                .transport
                .open(request, &self.session, token.as_deref(), payload, timeout)
                .await?;

            if cancel.is_cancelled() {
                drop(open);
                return Err(ApiError::Cancelled);
            }

            let status = open.status().as_u16();
            if open.status().is_success() && !(polls && status == 202) {
                return Ok(open);
            }

            let response = buffer(open, request).await?;

            #[cfg(feature = "tracing")]
            tracing::debug!(status, url = request.url(), ?state, "classifying response");

            match retry::classify(&response, &mut state, polls) {
                Verdict::Success => {
                    // deliverable statuses return above
                    return Err(ApiError::RequestFailed {
                        status,
                        body: response.body,
                    });
                }
                Verdict::Refresh { terms_required, .. } => {
                    if terms_required {
                        self.session.notify_terms_required();
                    }

                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        attempt = state.refresh_attempts,
                        "refreshing credentials before resend"
                    );

                    self.session
                        .refresh_after(token.as_deref())
                        .await
                        .map_err(refresh_error)?;
                }
                Verdict::Blocked => {
                    self.session.notify_blocked(response.error_kind());
                    return Err(ApiError::LocationOrIpBlocked {
                        status,
                        body: response.body,
                    });
                }
                Verdict::Backoff(wait) | Verdict::Poll(wait) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(status, wait_ms = wait.as_millis() as u64, "waiting before resend");

                    self.scheduler.sleep(wait, cancel).await?;
                }
                Verdict::Fail(ApiError::AuthRetriesExhausted { .. })
                    if response.error_kind() == ErrorKind::TermsOfServiceRequired =>
                {
                    return Err(ApiError::TermsOfServiceRequired);
                }
                Verdict::Fail(err) => return Err(err),
            }
        }
    }

    /// Only JSON objects are cached. A mutation that yields anything else
    /// drops the cached GET of its resource.
    async fn update_cache(&self, request: &Request, value: &Value) {
        let Some(cache) = &self.cache else {
            return;
        };
        let method = request.method();
        if method == Method::Get {
            if value.is_object() {
                cache.put(request.key(), value.clone()).await;
            }
            return;
        }
        if !method.is_mutating() {
            return;
        }

        // A mutation's result is what a GET of the same resource would return.
        let mut key = request.key();
        key.method = Method::Get;
        if method != Method::Delete && value.is_object() {
            cache.put(key, value.clone()).await;
        } else {
            cache.remove(&key).await;
        }
    }
}

fn refresh_error(failure: AuthFailure) -> ApiError {
    if failure.kind == ErrorKind::TermsOfServiceRequired {
        ApiError::TermsOfServiceRequired
    } else {
        ApiError::AuthRefresh(failure)
    }
}

/// Reads the whole body unless the call is cancelled first.
pub(crate) async fn buffer(open: OpenResponse, request: &Request) -> Result<Response> {
    tokio::select! {
        _ = request.cancellation().cancelled() => Err(ApiError::Cancelled),
        response = open.into_buffered() => response,
    }
}

fn decode_json(response: Response) -> Result<Value> {
    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&response.body).map_err(|err| {
        ApiError::Decode(format!(
            "invalid response JSON: {err}; body: {}",
            response.body
        ))
    })
}

fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|err| ApiError::Decode(format!("unexpected payload: {err}")))
}
