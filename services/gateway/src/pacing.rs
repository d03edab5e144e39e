//! Bounded waits that wake early on shutdown.

use tokio::sync::watch;
use tokio::time::{Duration, sleep};

/// What a pipeline iteration asks for before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Loop again without waiting (e.g. straight to reconnect).
    Immediately,
    /// Connection attempt failed; wait the reconnect backoff.
    Backoff,
    /// Short idle interval.
    Idle,
    /// Full polling interval.
    Poll,
}

/// Sleep for `delay` unless shutdown is requested first.
///
/// Returns `true` when the pipeline should stop.  A dropped sender counts as
/// shutdown.
pub async fn sleep_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    if delay.is_zero() {
        return false;
    }
    tokio::select! {
        _ = sleep(delay) => *shutdown_rx.borrow(),
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn returns_false_after_full_delay() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(&mut rx, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn wakes_early_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter =
            tokio::spawn(async move { sleep_or_shutdown(&mut rx, Duration::from_secs(60)).await });
        tx.send(true).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait must end on shutdown")
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(sleep_or_shutdown(&mut rx, Duration::from_secs(60)).await);
    }
}
