use std::time::Duration;

use tracing::{info, warn};

use crate::queue::EventQueues;

/// One reap pass over every known queue. Idempotent and safe to run
/// concurrently with live traffic — a queue that gained fresh events since
/// the recipient list was taken simply fails the idle check. Returns the
/// number of queues removed.
pub fn sweep(queues: &EventQueues, idle_threshold: Duration) -> usize {
    let recipients = match queues.recipients() {
        Ok(recipients) => recipients,
        Err(e) => {
            warn!("Reaper: event store unavailable: {}", e);
            return 0;
        }
    };

    let mut pruned = 0;
    for recipient in recipients {
        match queues.reap_if_idle(recipient, idle_threshold) {
            Ok(true) => pruned += 1,
            Ok(false) => {}
            Err(e) => warn!("Reaper: failed to check queue for user {}: {}", recipient, e),
        }
    }
    pruned
}

/// Background task that prunes idle event queues.
///
/// Runs on an interval; a queue is removed once its newest event is older
/// than `idle_threshold` (or it holds no events at all).
pub async fn run_reaper_loop(queues: EventQueues, interval: Duration, idle_threshold: Duration) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let pruned = sweep(&queues, idle_threshold);
        if pruned > 0 {
            info!("Reaper: pruned {} idle queues", pruned);
        }
    }
}
