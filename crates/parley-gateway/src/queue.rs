use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Lower bound of the adaptive consume batch size.
pub const MIN_BATCH: usize = 10;
/// Upper bound of the adaptive consume batch size.
pub const MAX_BATCH: usize = 1000;

/// Queue-assigned event id: unix-ms timestamp plus a per-queue sequence
/// number disambiguating same-millisecond appends. The string form
/// `<ms>-<seq>` is what clients hand back as their resume cursor; the
/// embedded timestamp is what the reaper reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    pub ms: i64,
    pub seq: u64,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid event id: {0:?}")]
pub struct InvalidEventId(pub String);

impl FromStr for EventId {
    type Err = InvalidEventId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s.split_once('-').ok_or_else(|| InvalidEventId(s.to_string()))?;
        let ms = ms.parse().map_err(|_| InvalidEventId(s.to_string()))?;
        let seq = seq.parse().map_err(|_| InvalidEventId(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

/// Where to start consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Only events appended after the consume call begins.
    Latest,
    /// Resume strictly after this id — the replay a reconnecting client needs.
    After(EventId),
}

/// An entry of a recipient's queue: the assigned id plus the serialized
/// envelope exactly as the delivery path appended it. Payloads are opaque
/// here; consumers parse them and skip entries that fail to parse.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: EventId,
    pub payload: String,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("event store unavailable")]
    Unavailable,
}

#[derive(Default)]
struct QueueSlot {
    events: Vec<StoredEvent>,
    notify: Arc<Notify>,
}

impl QueueSlot {
    fn next_id(&self) -> EventId {
        let now_ms = Utc::now().timestamp_millis();
        match self.events.last() {
            Some(last) if last.id.ms >= now_ms => EventId {
                ms: last.id.ms,
                seq: last.id.seq + 1,
            },
            _ => EventId { ms: now_ms, seq: 0 },
        }
    }
}

/// Per-recipient append-only event logs with blocking range reads. One
/// logical writer (the delivery path) appends; the recipient's own session
/// consumes. Queues come and go: idle ones are reaped and the next append
/// recreates them.
#[derive(Clone, Default)]
pub struct EventQueues {
    inner: Arc<Mutex<HashMap<i64, QueueSlot>>>,
}

impl EventQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<i64, QueueSlot>>, QueueError> {
        self.inner.lock().map_err(|_| QueueError::Unavailable)
    }

    /// Append a serialized envelope to the recipient's queue, creating the
    /// queue if needed. Returns the assigned id.
    pub fn append(&self, recipient_id: i64, payload: String) -> Result<EventId, QueueError> {
        let mut map = self.lock()?;
        let slot = map.entry(recipient_id).or_default();
        let id = slot.next_id();
        slot.events.push(StoredEvent { id, payload });
        slot.notify.notify_one();
        Ok(id)
    }

    /// Block up to `block_timeout` for events strictly after the cursor.
    /// Returns as soon as at least one is available (up to `max_batch`), or
    /// an empty batch on timeout.
    pub async fn consume(
        &self,
        recipient_id: i64,
        cursor: Cursor,
        block_timeout: Duration,
        max_batch: usize,
    ) -> Result<Vec<StoredEvent>, QueueError> {
        let deadline = Instant::now() + block_timeout;

        // "latest" means: only events appended after this call begins.
        let floor = match cursor {
            Cursor::After(id) => Some(id),
            Cursor::Latest => self.tail_id(recipient_id)?,
        };

        loop {
            let notify = {
                let mut map = self.lock()?;
                let slot = map.entry(recipient_id).or_default();
                let batch: Vec<StoredEvent> = slot
                    .events
                    .iter()
                    .filter(|e| floor.is_none_or(|f| e.id > f))
                    .take(max_batch)
                    .cloned()
                    .collect();
                if !batch.is_empty() {
                    return Ok(batch);
                }
                slot.notify.clone()
            };

            // Wait outside the lock. A missed wakeup is impossible: notify_one
            // stores a permit when no consumer is parked yet.
            if tokio::time::timeout_at(deadline, notify.notified()).await.is_err() {
                return Ok(vec![]);
            }
        }
    }

    /// Remove the recipient's queue when it is empty or its newest event is
    /// older than `idle_threshold`. Returns whether the queue was removed.
    pub fn reap_if_idle(
        &self,
        recipient_id: i64,
        idle_threshold: Duration,
    ) -> Result<bool, QueueError> {
        let mut map = self.lock()?;
        let Some(slot) = map.get(&recipient_id) else {
            return Ok(false);
        };

        let idle = match slot.events.last() {
            None => true,
            Some(event) => {
                let age_ms = Utc::now().timestamp_millis() - event.id.ms;
                age_ms >= idle_threshold.as_millis() as i64
            }
        };

        if idle {
            if let Some(slot) = map.remove(&recipient_id) {
                // Wake any parked consumer so it re-checks instead of
                // sleeping out its timeout on a dead queue.
                slot.notify.notify_one();
            }
        }
        Ok(idle)
    }

    /// Recipient ids with a live queue, for the reaper's sweep.
    pub fn recipients(&self) -> Result<Vec<i64>, QueueError> {
        Ok(self.lock()?.keys().copied().collect())
    }

    fn tail_id(&self, recipient_id: i64) -> Result<Option<EventId>, QueueError> {
        Ok(self
            .lock()?
            .get(&recipient_id)
            .and_then(|slot| slot.events.last())
            .map(|event| event.id))
    }

    #[cfg(test)]
    pub(crate) fn ensure_queue(&self, recipient_id: i64) -> Result<(), QueueError> {
        self.lock()?.entry(recipient_id).or_default();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn append_with_ms(
        &self,
        recipient_id: i64,
        payload: &str,
        ms: i64,
    ) -> Result<EventId, QueueError> {
        let mut map = self.lock()?;
        let slot = map.entry(recipient_id).or_default();
        let seq = match slot.events.last() {
            Some(last) if last.id.ms == ms => last.id.seq + 1,
            _ => 0,
        };
        let id = EventId { ms, seq };
        slot.events.push(StoredEvent {
            id,
            payload: payload.to_string(),
        });
        slot.notify.notify_one();
        Ok(id)
    }
}

/// Running batch size for a queue consumer: doubles after a non-empty batch,
/// halves after an empty one, clamped to [MIN_BATCH, MAX_BATCH]. Keeps
/// latency low under light load without sacrificing burst throughput.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveBatch {
    size: usize,
}

impl AdaptiveBatch {
    pub fn new() -> Self {
        Self { size: MIN_BATCH }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn record(&mut self, received: usize) {
        if received > 0 {
            self.size = (self.size * 2).min(MAX_BATCH);
        } else {
            self.size = (self.size / 2).max(MIN_BATCH);
        }
    }
}

impl Default for AdaptiveBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_round_trips_and_orders() {
        let id: EventId = "1748779200000-3".parse().unwrap();
        assert_eq!(id, EventId { ms: 1_748_779_200_000, seq: 3 });
        assert_eq!(id.to_string(), "1748779200000-3");

        let later = EventId { ms: 1_748_779_200_000, seq: 4 };
        assert!(later > id);
        assert!(EventId { ms: 1_748_779_200_001, seq: 0 } > later);

        assert!("nope".parse::<EventId>().is_err());
        assert!("12x-0".parse::<EventId>().is_err());
    }

    #[tokio::test]
    async fn consume_after_cursor_is_strict() {
        let queues = EventQueues::new();
        let first = queues.append(7, "a".into()).unwrap();
        let second = queues.append(7, "b".into()).unwrap();
        let third = queues.append(7, "c".into()).unwrap();
        assert!(first < second && second < third);

        let batch = queues
            .consume(7, Cursor::After(first), Duration::from_millis(10), 100)
            .await
            .unwrap();
        let ids: Vec<EventId> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![second, third]);
        assert!(ids.iter().all(|id| *id > first));
    }

    #[tokio::test]
    async fn latest_skips_preexisting_events() {
        let queues = EventQueues::new();
        queues.append(7, "old".into()).unwrap();

        let consumer = {
            let queues = queues.clone();
            tokio::spawn(async move {
                queues
                    .consume(7, Cursor::Latest, Duration::from_secs(5), 100)
                    .await
                    .unwrap()
            })
        };
        tokio::task::yield_now().await;

        queues.append(7, "new".into()).unwrap();
        let batch = consumer.await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn consume_times_out_empty() {
        let queues = EventQueues::new();
        let batch = queues
            .consume(7, Cursor::Latest, Duration::from_secs(2), 100)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn consume_wakes_on_append() {
        let queues = EventQueues::new();
        let consumer = {
            let queues = queues.clone();
            tokio::spawn(async move {
                queues
                    .consume(9, Cursor::Latest, Duration::from_secs(5), 100)
                    .await
                    .unwrap()
            })
        };
        tokio::task::yield_now().await;

        queues.append(9, "wake".into()).unwrap();
        let batch = consumer.await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn consume_respects_max_batch() {
        let queues = EventQueues::new();
        for i in 0..25 {
            queues.append(7, format!("e{i}")).unwrap();
        }
        let batch = queues
            .consume(7, Cursor::After(EventId { ms: 0, seq: 0 }), Duration::from_millis(10), 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 10);
    }

    #[tokio::test]
    async fn reconnect_replays_exactly_the_gap() {
        let queues = EventQueues::new();
        for i in 0..3 {
            queues.append(7, format!("seen{i}")).unwrap();
        }
        let cursor = queues
            .consume(7, Cursor::After(EventId { ms: 0, seq: 0 }), Duration::from_millis(10), 100)
            .await
            .unwrap()
            .last()
            .unwrap()
            .id;

        // Disconnected: three more arrive.
        let missed: Vec<EventId> = (0..3)
            .map(|i| queues.append(7, format!("missed{i}")).unwrap())
            .collect();

        let replay = queues
            .consume(7, Cursor::After(cursor), Duration::from_millis(10), 100)
            .await
            .unwrap();
        let ids: Vec<EventId> = replay.iter().map(|e| e.id).collect();
        assert_eq!(ids, missed);
    }

    #[test]
    fn reap_removes_empty_and_stale_queues() {
        let queues = EventQueues::new();
        let threshold = Duration::from_secs(60);

        // Unknown recipient: nothing to reap.
        assert!(!queues.reap_if_idle(1, threshold).unwrap());

        // Stale events.
        let old_ms = Utc::now().timestamp_millis() - 120_000;
        queues.append_with_ms(2, "stale", old_ms).unwrap();
        assert!(queues.reap_if_idle(2, threshold).unwrap());
        assert!(queues.recipients().unwrap().is_empty());

        // Fresh events survive repeated sweeps.
        queues.append(3, "fresh".into()).unwrap();
        for _ in 0..5 {
            assert!(!queues.reap_if_idle(3, threshold).unwrap());
        }
        assert_eq!(queues.recipients().unwrap(), vec![3]);
    }

    #[test]
    fn adaptive_batch_stays_in_bounds() {
        let mut batch = AdaptiveBatch::new();
        assert_eq!(batch.size(), MIN_BATCH);

        for _ in 0..20 {
            batch.record(batch.size());
            assert!(batch.size() <= MAX_BATCH);
        }
        assert_eq!(batch.size(), MAX_BATCH);

        for _ in 0..20 {
            batch.record(0);
            assert!(batch.size() >= MIN_BATCH);
        }
        assert_eq!(batch.size(), MIN_BATCH);
    }

    #[test]
    fn same_millisecond_appends_stay_ordered() {
        let queues = EventQueues::new();
        let ms = Utc::now().timestamp_millis();
        let a = queues.append_with_ms(7, "a", ms).unwrap();
        let b = queues.append_with_ms(7, "b", ms).unwrap();
        assert_eq!(a.ms, b.ms);
        assert!(b.seq > a.seq);
    }
}
