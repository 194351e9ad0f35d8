//! Async timeout helpers and default durations.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default bound on one TCP connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept()` before the next one.
pub const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Bound on flushing the write half while a connection shuts down.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run `future`, failing with [`ProtocolError::Timeout`] once `duration`
/// elapses.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

/// Like [`with_timeout_error`] with a caller supplied error on expiry.
pub async fn with_timeout_or<F, T>(future: F, duration: Duration, on_elapsed: ProtocolError) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(on_elapsed),
    }
}

/// Bounded by `duration`, or unbounded when `duration` is zero.
pub async fn with_optional_timeout<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if duration.is_zero() {
        future.await
    } else {
        with_timeout_error(future, duration).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn elapsed_maps_to_timeout() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn custom_error_on_expiry() {
        let result: Result<()> = with_timeout_or(
            std::future::pending(),
            Duration::from_millis(10),
            ProtocolError::ConnectionTimeout,
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::ConnectionTimeout)));
    }

    #[tokio::test]
    async fn zero_means_unbounded() {
        let value = with_optional_timeout(async { Ok(7) }, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
