use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::app::error::HarnessError;

/// Calls `ready` up to `retries` times, sleeping `interval` between attempts.
///
/// An `Err` from `ready` counts as "not yet ready". Running out of attempts is a profiler error
/// that carries the last failure, if any.
pub fn wait_until<F>(
    what: &str,
    retries: u32,
    interval: Duration,
    mut ready: F,
) -> Result<(), HarnessError>
where
    F: FnMut() -> Result<bool, HarnessError>,
{
    let mut last_error = None;
    for attempt in 1..=retries.max(1) {
        match ready() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => {
                debug!(what, attempt, error = %err, "poll attempt failed");
                last_error = Some(err);
            }
        }
        if attempt < retries {
            thread::sleep(interval);
        }
    }
    let detail = last_error
        .map(|err| format!(" (last error: {})", err.error))
        .unwrap_or_default();
    Err(HarnessError::profiler(
        format!("Timed out waiting for {what} after {} attempts{detail}", retries.max(1)),
        "",
    ))
}
