use std::future::Future;

use tokio::time::{Duration, sleep};

/// Retry an operation with exponential backoff: 1s, 2s, 4s, ... capped
/// at 30s between attempts.
pub async fn retry_with_backoff<F, Fut, T, E>(max_retries: u32, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut retries = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                retries += 1;
                if retries >= max_retries {
                    log::error!("Operation failed after {} retries: {:?}", max_retries, e);
                    return Err(e);
                }

                let delay_ms = (1000 * 2_u64.pow(retries - 1)).min(30000);
                log::warn!(
                    "Operation failed (attempt {}/{}): {:?}, retrying in {}ms",
                    retries,
                    max_retries,
                    e,
                    delay_ms
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff(3, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("transient") } else { Ok(n) } }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff(3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("permanent") }
        })
        .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
