//! Shared timeout constants and helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Default timeout for connection-level operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an unauthorized transport may sit waiting for the host to
/// answer an auth token before it is kicked.
pub const AUTH_TOKEN_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for graceful daemon shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a future with a deadline, mapping expiry to [`BridgeError::Timeout`].
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expiry_maps_to_timeout_error() {
        let res: Result<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(BridgeError::Timeout)));
    }

    #[tokio::test]
    async fn completion_passes_through() {
        let res = with_timeout(Duration::from_secs(5), async { Ok(7u32) }).await;
        assert_eq!(res.unwrap(), 7);
    }
}
