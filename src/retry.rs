//! Response classification for the per-call retry state machine.
//!
//! Each attempt's response is classified into a [`Verdict`]; the client
//! loop acts on it and re-enters with the same [`RetryState`]. Bounds are
//! fixed so the worst-case latency of a call is predictable.

use std::time::Duration;

use rand::Rng;

use crate::{ApiError, ErrorKind, Response};

/// Resends allowed after a 429.
pub const MAX_RATE_LIMIT_RETRIES: u32 = 1;
/// Credential refreshes allowed per logical call, shared by every 401/403 path.
pub const MAX_REFRESH_RETRIES: u32 = 4;
/// Polls that use the server-suggested wait before backoff growth starts.
pub const MAX_ACCEPTED_POLLS: u32 = 2;
/// Upper bound of a single accepted-poll wait.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(90);
/// Poll wait used when a 202 carries no `Retry-After`.
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(1);

const RATE_LIMIT_WAIT_MILLIS: std::ops::Range<u64> = 20_000..30_000;

/// Mutable counters owned by one logical call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryState {
    pub rate_limit_attempts: u32,
    pub refresh_attempts: u32,
    pub accepted_polls: u32,
    pub poll_wait: Duration,
}

/// What the client loop must do with an attempt's response.
#[derive(Debug)]
pub enum Verdict {
    /// Hand the body to the call's decoder.
    Success,
    /// Refresh credentials through the session, then resend.
    Refresh {
        /// The server flagged the bearer token as `invalid_token`.
        expired_token: bool,
        /// The host must be told that new terms need accepting.
        terms_required: bool,
    },
    /// Access denied for the caller's IP or location; notify and fail.
    Blocked,
    /// Rate limited: wait, then resend.
    Backoff(Duration),
    /// Accepted but not ready: wait, then poll again.
    Poll(Duration),
    Fail(ApiError),
}

/// Classifies `response` and advances `state`.
///
/// `polls_accepted` is set by calls (downloads) for which a 202 means the
/// resource is still being generated.
pub fn classify(response: &Response, state: &mut RetryState, polls_accepted: bool) -> Verdict {
    let status = response.status_code();

    if response.has_invalid_token_challenge() {
        return state.take_refresh(response, true, false);
    }

    if status == 401 || status == 403 {
        let kind = response.error_kind();
        if kind.is_blocked() {
            return Verdict::Blocked;
        }
        let terms_required = kind == ErrorKind::TermsOfServiceRequired;
        return state.take_refresh(response, false, terms_required);
    }

    if status == 429 {
        if state.rate_limit_attempts < MAX_RATE_LIMIT_RETRIES {
            state.rate_limit_attempts += 1;
            let wait = response.retry_after_millis(default_rate_limit_wait_millis());
            return Verdict::Backoff(Duration::from_millis(wait));
        }
        return Verdict::Fail(ApiError::RateLimitExceeded {
            attempts: state.rate_limit_attempts,
        });
    }

    if status == 202 && polls_accepted {
        return state.next_poll(response);
    }

    if (200..300).contains(&status) {
        return Verdict::Success;
    }

    Verdict::Fail(ApiError::RequestFailed {
        status,
        body: response.body.clone(),
    })
}

impl RetryState {
    fn take_refresh(
        &mut self,
        response: &Response,
        expired_token: bool,
        terms_required: bool,
    ) -> Verdict {
        if self.refresh_attempts >= MAX_REFRESH_RETRIES {
            return Verdict::Fail(ApiError::AuthRetriesExhausted {
                attempts: self.refresh_attempts,
                status: response.status_code(),
                body: response.body.clone(),
            });
        }
        self.refresh_attempts += 1;
        Verdict::Refresh {
            expired_token,
            terms_required,
        }
    }

    fn next_poll(&mut self, response: &Response) -> Verdict {
        if self.accepted_polls < MAX_ACCEPTED_POLLS {
            self.accepted_polls += 1;
            let default_millis = DEFAULT_POLL_WAIT.as_millis() as u64;
            self.poll_wait = Duration::from_millis(response.retry_after_millis(default_millis));
            return Verdict::Poll(self.poll_wait);
        }

        if self.poll_wait >= MAX_POLL_WAIT {
            return Verdict::Fail(ApiError::MaxPollWaitExceeded {
                attempts: self.accepted_polls,
            });
        }

        self.accepted_polls += 1;
        self.poll_wait = grow_poll_wait(self.poll_wait);
        Verdict::Poll(self.poll_wait)
    }
}

pub(crate) fn default_rate_limit_wait_millis() -> u64 {
    rand::thread_rng().gen_range(RATE_LIMIT_WAIT_MILLIS)
}

/// Multiplies the wait by a random factor in `[1.5, 2.5)`, capped at [`MAX_POLL_WAIT`].
pub(crate) fn grow_poll_wait(current: Duration) -> Duration {
    let factor = 1.5 + rand::thread_rng().gen::<f64>();
    // a zero wait would never reach the cap
    let base = current.max(Duration::from_millis(1));
    base.mul_f64(factor).min(MAX_POLL_WAIT)
}
