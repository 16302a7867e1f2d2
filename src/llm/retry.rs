//! Call-site retry policy: transient failures get exactly one more attempt.

use std::future::Future;

use tracing::warn;

use crate::error::LlmError;

/// Run `call`, retrying once if the first failure is transient.
pub(crate) async fn with_single_retry<F, Fut, T>(label: &str, mut call: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    match call().await {
        Ok(v) => Ok(v),
        Err(e) if e.is_transient() => {
            warn!(call = label, error = %e, "Transient model failure, retrying once");
            call().await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn transient() -> LlmError {
        LlmError::RequestFailed {
            provider: "mock".into(),
            reason: "503".into(),
        }
    }

    #[tokio::test]
    async fn retries_transient_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, _> = with_single_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n == 0 { Err(transient()) } else { Ok(7) } }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_second_failure() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, _> = with_single_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_auth_failure() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, _> = with_single_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlmError::AuthFailed {
                    provider: "mock".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
