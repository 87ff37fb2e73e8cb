//! Wall-clock milliseconds for value timestamps.
//!
//! Timestamps are anchored to the system clock once per thread and then
//! advanced with `tokio::time::Instant`. This keeps them monotonic and lets
//! tests with a paused tokio clock observe timestamps that move with virtual
//! time.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

thread_local! {
    static ANCHOR: (u64, Instant) = (system_ms(), Instant::now());
}

fn system_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    ANCHOR.with(|(wall, instant)| {
        let elapsed = Instant::now().saturating_duration_since(*instant);
        wall + elapsed.as_millis() as u64
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn now_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_virtual_time() {
        let before = now_ms();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(now_ms() - before >= 1_500);
    }
}
