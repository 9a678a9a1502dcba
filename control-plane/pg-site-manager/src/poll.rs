//! Timeout-bounded polling shared by every wait loop in the crate.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Evaluate `predicate` immediately and then every `interval` until it
/// returns `Ok(true)` or `timeout` elapses.
///
/// Returns `Ok(true)` when the condition was met, `Ok(false)` on timeout and
/// the predicate's error as soon as one is produced.
pub async fn poll_with_timeout<F, Fut, E>(
    interval: Duration,
    timeout: Duration,
    mut predicate: F,
) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate().await? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// Retry `op` until it succeeds, `retryable` rejects its error, or `timeout`
/// elapses. The last error is returned when the budget runs out.
pub async fn retry_with_timeout<T, E, F, Fut, R>(
    interval: Duration,
    timeout: Duration,
    mut op: F,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if retryable(&e) && Instant::now() < deadline => {
                sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn first_check_runs_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let started = Instant::now();
        let res: Result<bool, ()> =
            poll_with_timeout(Duration::from_secs(5), Duration::from_secs(60), || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            })
            .await;
        assert_eq!(res, Ok(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_false() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let res: Result<bool, ()> =
            poll_with_timeout(Duration::from_secs(5), Duration::from_secs(20), || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            })
            .await;
        assert_eq!(res, Ok(false));
        // t = 0, 5, 10, 15, 20
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_error_stops_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let res: Result<bool, &str> =
            poll_with_timeout(Duration::from_secs(1), Duration::from_secs(60), || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n == 2 { Err("boom") } else { Ok(false) }
                }
            })
            .await;
        assert_eq!(res, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_on_non_retryable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let res: Result<(), u16> = retry_with_timeout(
            Duration::from_secs(1),
            Duration::from_secs(60),
            || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n == 0 { Err(409) } else { Err(500) }
                }
            },
            |code| *code == 409,
        )
        .await;
        assert_eq!(res, Err(500));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
