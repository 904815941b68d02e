use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};

/// Calls `probe` every `interval` until it yields a value.
///
/// `Ok(None)` and temporary errors keep polling, any other error is
/// returned as is. Gives up with a `Driver` error after `timeout`.
pub(crate) async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match probe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => debug!("waiting for {}", what),
            Err(e) if e.is_temporary() => debug!("waiting for {}: {}", what, e),
            Err(e) => return Err(e),
        }
        if Instant::now() + interval > deadline {
            return Err(Error::Driver(format!(
                "timed out after {:?} waiting for {}",
                timeout, what
            )));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(interval) => (),
        }
    }
}

/// JSON patch turning `current` into `current` overlaid with `desired`.
/// Fields absent from `desired` are left alone.
pub(crate) fn overlay_patch(current: &serde_json::Value, desired: &serde_json::Value) -> json_patch::Patch {
    let mut target = current.clone();
    json_patch::merge(&mut target, desired);
    json_patch::diff(current, &target)
}
