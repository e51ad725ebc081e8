//! Backoff arithmetic and cancellable sleeps for the polling loops

use skyplan_core::{Result, SkyError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// `base * 2^attempt`, capped at `cap`
pub fn backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Sleep unless the token fires first
pub async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(SkyError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

pub fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(SkyError::Cancelled)
    } else {
        Ok(())
    }
}
