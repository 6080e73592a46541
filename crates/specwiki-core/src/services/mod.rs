//! Remote service adapters and shared RPC plumbing.
//!
//! Every upstream collaborator sits behind a narrow async trait with a mock
//! implementation for tests. Calls into these traits are suspension points;
//! callers wrap them in [`with_timeout`] and, for transient failures,
//! [`with_retry`].

pub mod chat;
pub mod embedding;
pub mod partition;
pub mod rate_limit;
pub mod vlm;

pub use chat::{
    ChatClient, ChatOptions, ChatRunner, MockChatClient, OpenRouterChatClient, ResponseFormat,
};
pub use embedding::{EmbeddingClient, MockEmbeddingClient, VoyageEmbeddingClient};
pub use partition::{
    MockPartitionClient, PartitionClient, RawElement, RawPartition, UnstructuredPartitionClient,
};
pub use rate_limit::{RateLimiters, TokenBucket};
pub use vlm::{Caption, MockVlmClient, OpenRouterVlmClient, VlmClient, VlmInput};

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{CoreError, Result};

/// Await an RPC future under the service's timeout.
pub async fn with_timeout<T, F>(service: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout { service, timeout }),
    }
}

/// Call an RPC, retrying once with jittered backoff on transient errors.
///
/// Non-transient errors (malformed responses, bad input, permission) are
/// returned immediately.
pub async fn with_retry<T, F, Fut>(op: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match call().await {
        Ok(value) => Ok(value),
        Err(e) if e.is_transient() => {
            let backoff = Duration::from_millis(500 + rand::rng().random_range(0..500));
            tracing::warn!(
                op,
                error = %e,
                backoff_ms = backoff.as_millis() as u64,
                "Transient failure, retrying once"
            );
            tokio::time::sleep(backoff).await;
            call().await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn timeout_maps_to_typed_error() {
        let result: Result<()> = with_timeout("chat", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(CoreError::Timeout { service, .. }) => assert_eq!(service, "chat"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_retries_transient_once() {
        let attempts = AtomicUsize::new(0);
        let result = with_retry("embed", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(CoreError::UpstreamUnavailable("503".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_does_not_retry_permanent_errors() {
        let attempts = AtomicUsize::new(0);
        let result: Result<i32> = with_retry("chat", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::UpstreamMalformedResponse("bad json".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_second_transient_failure() {
        let attempts = AtomicUsize::new(0);
        let result: Result<i32> = with_retry("vlm", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::UpstreamRateLimited("429".into())) }
        })
        .await;
        assert!(matches!(result, Err(CoreError::UpstreamRateLimited(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
