use std::thread::sleep;
use std::time::Duration;

/// Retries the execution of `f` after the `interval` has elapsed, until
/// `max_attempts` is reached. Returns the first successful result or the
/// latest error if all attempts fail.
pub fn retry<F, T, E>(max_attempts: usize, interval: Duration, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut last_err = None;
    for _ in 0..max_attempts {
        match f() {
            Ok(result) => return Ok(result),
            Err(err) => {
                last_err = Some(err);
                sleep(interval);
            }
        }
    }
    Err(last_err.expect("some error must exist at this point"))
}

/// Retry with exponential backoff. The interval doubles after each failed
/// attempt starting from `initial_interval`. `is_retryable` classifies
/// errors; a non-retryable error is returned immediately.
pub fn retry_with_backoff<F, T, E, C>(
    max_attempts: usize,
    initial_interval: Duration,
    is_retryable: C,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    C: Fn(&E) -> bool,
{
    let mut interval = initial_interval;
    let mut last_err = None;
    for attempt in 0..max_attempts {
        match f() {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }
                last_err = Some(err);
                if attempt + 1 < max_attempts {
                    sleep(interval);
                    interval = interval.saturating_mul(2);
                }
            }
        }
    }
    Err(last_err.expect("some error must exist at this point"))
}
