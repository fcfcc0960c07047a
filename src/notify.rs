use crate::{AuthFailure, ErrorKind};

/// One-way notifications for unrecoverable authentication states.
///
/// Implemented by the host application; the engine never drives any UI itself.
/// Calls may arrive from background tasks.
pub trait AuthNotifier: Send + Sync {
    /// Access was denied for the caller's IP address or location.
    fn notify_blocked(&self, _kind: ErrorKind) {}

    /// The account must accept new terms of service.
    fn notify_terms_required(&self) {}

    /// Credentials were revoked; an interactive login is needed.
    fn notify_login_required(&self, _failure: &AuthFailure) {}
}

/// Ignores every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl AuthNotifier for NoopNotifier {}
