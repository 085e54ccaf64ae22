use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::ClientError;

/// Result of an operation that depends on the store being reachable.
///
/// `Disabled` is not an error. It means no store is configured, or the store failed to answer, and
/// the caller should fall back: allow the request for rate limits, use the cookie-only scheme for
/// captchas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Ready(T),
    Disabled,
}

impl<T> Outcome<T> {
    pub fn is_disabled(&self) -> bool {
        matches!(self, Outcome::Disabled)
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Outcome::Ready(value) => Some(value),
            Outcome::Disabled => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Ready(value) => Outcome::Ready(f(value)),
            Outcome::Disabled => Outcome::Disabled,
        }
    }
}

/// Awaits `op`, bounded by `timeout` when one is set. Failures and timeouts are logged and become
/// `Disabled`.
///
/// A timed-out command is not withdrawn. Its side effect may still land on the store.
pub(crate) async fn guarded<T, F>(
    operation: &'static str,
    timeout: Option<Duration>,
    op: F,
) -> Outcome<T>
where
    F: Future<Output = Result<T, ClientError>>,
{
    let result = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, op).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, ?timeout, "store did not answer in time, degrading");
                return Outcome::Disabled;
            }
        },
        None => op.await,
    };

    match result {
        Ok(value) => Outcome::Ready(value),
        Err(err) => {
            warn!(operation, "store unavailable, degrading: {}", err);
            Outcome::Disabled
        }
    }
}
