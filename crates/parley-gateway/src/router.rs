use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use parley_types::events::{EventEnvelope, EventKind, PushMessage};

use crate::presence::PresenceTracker;
use crate::push::PushNotifier;
use crate::queue::EventQueues;

/// Where one recipient's copy of an event goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Append to the recipient's live queue.
    Queue,
    /// Hand to the push-notification collaborator.
    Push,
    /// Discard silently.
    Drop,
}

/// Per-event-type policy: given whether the recipient is actively viewing
/// the event's channel, pick the delivery path.
pub trait DeliveryStrategy: Send + Sync {
    fn decide(&self, viewing: bool) -> Delivery;
}

/// Chat messages reach every subscriber: live when viewing, push otherwise.
struct ChatMessageStrategy;

impl DeliveryStrategy for ChatMessageStrategy {
    fn decide(&self, viewing: bool) -> Delivery {
        if viewing { Delivery::Queue } else { Delivery::Push }
    }
}

/// Best-effort events (locations, read receipts, user updates) only matter to
/// someone looking at the channel right now; everyone else drops them.
struct LiveOnlyStrategy;

impl DeliveryStrategy for LiveOnlyStrategy {
    fn decide(&self, viewing: bool) -> Delivery {
        if viewing { Delivery::Queue } else { Delivery::Drop }
    }
}

/// Routes events to subscribers, choosing live queue vs. push per recipient.
/// The strategy table is built once at startup; there is no global registry
/// to mutate.
pub struct DeliveryRouter {
    strategies: HashMap<EventKind, Box<dyn DeliveryStrategy>>,
    presence: PresenceTracker,
    queues: EventQueues,
    push: Arc<dyn PushNotifier>,
}

impl DeliveryRouter {
    pub fn new(presence: PresenceTracker, queues: EventQueues, push: Arc<dyn PushNotifier>) -> Self {
        let mut strategies: HashMap<EventKind, Box<dyn DeliveryStrategy>> = HashMap::new();
        strategies.insert(EventKind::Stream, Box::new(ChatMessageStrategy));
        strategies.insert(EventKind::User, Box::new(LiveOnlyStrategy));
        strategies.insert(EventKind::Location, Box::new(LiveOnlyStrategy));
        strategies.insert(EventKind::Read, Box::new(LiveOnlyStrategy));
        Self {
            strategies,
            presence,
            queues,
            push,
        }
    }

    /// Fan an event out to the channel's recipients. Presence is looked up
    /// once for the whole list. The message is already persisted by the time
    /// this runs, so a delivery failure only delays real-time visibility —
    /// push failures are swallowed, queue appends get one retry.
    pub async fn fan_out(&self, channel_id: i64, recipients: &[i64], envelope: &EventEnvelope) {
        if recipients.is_empty() {
            return;
        }
        let Some(strategy) = self.strategies.get(&envelope.kind) else {
            warn!("no delivery strategy for event type {}", envelope.kind.as_str());
            return;
        };

        let payload = match serde_json::to_string(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("unserializable {} event: {}", envelope.kind.as_str(), e);
                return;
            }
        };

        let active = self.presence.get_active_bulk(recipients);
        for &recipient in recipients {
            let viewing = active.get(&recipient).copied().flatten() == Some(channel_id);
            match strategy.decide(viewing) {
                Delivery::Queue => self.append_with_retry(recipient, &payload),
                Delivery::Push => {
                    let message = PushMessage::new(recipient, envelope.clone());
                    if let Err(e) = self.push.notify(message).await {
                        warn!("push delivery to user {} failed: {}", recipient, e);
                    }
                }
                Delivery::Drop => {
                    trace!(
                        "dropping {} event for inactive user {}",
                        envelope.kind.as_str(),
                        recipient
                    );
                }
            }
        }
    }

    fn append_with_retry(&self, recipient: i64, payload: &str) {
        if self.queues.append(recipient, payload.to_string()).is_ok() {
            return;
        }
        if let Err(e) = self.queues.append(recipient, payload.to_string()) {
            warn!("queue append for user {} failed twice: {}", recipient, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use futures_util::future::BoxFuture;

    use parley_types::models::Message;

    use super::*;
    use crate::queue::Cursor;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<PushMessage>>,
    }

    impl PushNotifier for RecordingNotifier {
        fn notify<'a>(&'a self, message: PushMessage) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.sent.lock().unwrap().push(message);
                Ok(())
            })
        }
    }

    struct FailingNotifier;

    impl PushNotifier for FailingNotifier {
        fn notify<'a>(&'a self, _message: PushMessage) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move { Err(anyhow::anyhow!("push endpoint down")) })
        }
    }

    fn sample_message(channel_id: i64, sender_id: i64) -> Message {
        Message {
            id: 1,
            channel_id,
            sender_id,
            content: "hi".to_string(),
            rendered_content: "hi".to_string(),
            sent_at: chrono::Utc::now(),
        }
    }

    async fn drain(queues: &EventQueues, recipient: i64) -> Vec<String> {
        queues
            .consume(
                recipient,
                Cursor::After(crate::queue::EventId { ms: 0, seq: 0 }),
                Duration::from_millis(10),
                100,
            )
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.payload)
            .collect()
    }

    #[tokio::test]
    async fn chat_message_routes_by_presence() {
        let presence = PresenceTracker::new();
        let queues = EventQueues::new();
        let push = Arc::new(RecordingNotifier::default());
        let router = DeliveryRouter::new(presence.clone(), queues.clone(), push.clone());

        // B is viewing channel 7, C is not.
        presence.set_active(2, 7, Duration::from_secs(300));

        let envelope = EventEnvelope::stream_message(7, &sample_message(7, 1));
        router.fan_out(7, &[2, 3], &envelope).await;

        assert_eq!(drain(&queues, 2).await.len(), 1);
        assert!(drain(&queues, 3).await.is_empty());

        let pushed = push.sent.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].user_id, 3);
        assert_eq!(pushed[0].body, "hi");
    }

    #[tokio::test]
    async fn viewing_another_channel_counts_as_absent() {
        let presence = PresenceTracker::new();
        let queues = EventQueues::new();
        let push = Arc::new(RecordingNotifier::default());
        let router = DeliveryRouter::new(presence.clone(), queues.clone(), push.clone());

        presence.set_active(2, 9, Duration::from_secs(300));

        let envelope = EventEnvelope::stream_message(7, &sample_message(7, 1));
        router.fan_out(7, &[2], &envelope).await;

        assert!(drain(&queues, 2).await.is_empty());
        assert_eq!(push.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn live_only_events_are_dropped_for_absent_users() {
        let presence = PresenceTracker::new();
        let queues = EventQueues::new();
        let push = Arc::new(RecordingNotifier::default());
        let router = DeliveryRouter::new(presence.clone(), queues.clone(), push.clone());

        presence.set_active(2, 7, Duration::from_secs(300));

        for envelope in [
            EventEnvelope::location(7, 1, 36.7, 127.1),
            EventEnvelope::read_receipt(7, 1, &[10, 11]),
        ] {
            router.fan_out(7, &[2, 3], &envelope).await;
        }

        // The viewer got both events live; the absent user got nothing at all.
        assert_eq!(drain(&queues, 2).await.len(), 2);
        assert!(drain(&queues, 3).await.is_empty());
        assert!(push.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_failure_is_swallowed() {
        let presence = PresenceTracker::new();
        let queues = EventQueues::new();
        let router = DeliveryRouter::new(presence.clone(), queues.clone(), Arc::new(FailingNotifier));

        let envelope = EventEnvelope::stream_message(7, &sample_message(7, 1));
        // Must not panic or error: the message itself is already persisted.
        router.fan_out(7, &[3], &envelope).await;
        assert!(drain(&queues, 3).await.is_empty());
    }
}
