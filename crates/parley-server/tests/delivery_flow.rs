//! End-to-end delivery flows below the HTTP layer: persist, fan out, consume.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

use parley_gateway::presence::PresenceTracker;
use parley_gateway::push::PushNotifier;
use parley_gateway::queue::{Cursor, EventId, EventQueues, StoredEvent};
use parley_gateway::router::DeliveryRouter;
use parley_store::Database;
use parley_types::api::Anchor;
use parley_types::events::{EventEnvelope, PushMessage};
use parley_types::models::Message;

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

struct Fixture {
    db: Database,
    presence: PresenceTracker,
    queues: EventQueues,
    router: DeliveryRouter,
    push: Arc<RecordingNotifier>,
}

fn fixture() -> Fixture {
    let db = Database::open_in_memory().unwrap();
    let presence = PresenceTracker::new();
    let queues = EventQueues::new();
    let push = Arc::new(RecordingNotifier::default());
    let router = DeliveryRouter::new(presence.clone(), queues.clone(), push.clone());
    Fixture {
        db,
        presence,
        queues,
        router,
        push,
    }
}

/// The send path as the REST handler runs it: persist, create markers, then
/// fan out to every subscriber except the sender.
async fn send_message(fx: &Fixture, channel_id: i64, sender_id: i64, content: &str) -> Message {
    let subscribers = fx.db.subscribers(channel_id).unwrap();
    assert!(subscribers.contains(&sender_id));

    let message = fx.db.append_message(channel_id, sender_id, content).unwrap();
    fx.db
        .mark_subscribed(message.id, &subscribers, sender_id)
        .unwrap();

    let recipients: Vec<i64> = subscribers
        .into_iter()
        .filter(|&id| id != sender_id)
        .collect();
    let envelope = EventEnvelope::stream_message(channel_id, &message);
    fx.router.fan_out(channel_id, &recipients, &envelope).await;

    message
}

async fn drain_queue(queues: &EventQueues, recipient: i64) -> Vec<StoredEvent> {
    queues
        .consume(
            recipient,
            Cursor::After(EventId { ms: 0, seq: 0 }),
            Duration::from_millis(10),
            100,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn send_routes_live_viewers_and_pushes_the_rest() {
    // Channel 7 with subscribers {A=1, B=2, C=3}; B is actively viewing it.
    let fx = fixture();
    let channel = fx.db.create_channel("channel-7", 1).unwrap();
    for user in [1, 2, 3] {
        fx.db.subscribe(channel.id, user).unwrap();
    }
    fx.presence.set_active(2, channel.id, Duration::from_secs(300));

    let message = send_message(&fx, channel.id, 1, "hi").await;

    // One persisted row.
    let stored = fx.db.get_message(message.id).unwrap().unwrap();
    assert_eq!(stored.channel_id, channel.id);
    assert_eq!(stored.sender_id, 1);
    assert_eq!(stored.content, "hi");

    // Markers for all three; the sender's own is pre-read.
    assert_eq!(fx.db.unread_count(1, channel.id).unwrap(), 0);
    assert_eq!(fx.db.unread_count(2, channel.id).unwrap(), 1);
    assert_eq!(fx.db.unread_count(3, channel.id).unwrap(), 1);

    // B got exactly one live event with the message payload.
    let b_events = drain_queue(&fx.queues, 2).await;
    assert_eq!(b_events.len(), 1);
    let envelope: EventEnvelope = serde_json::from_str(&b_events[0].payload).unwrap();
    assert_eq!(envelope.data["content"], "hi");
    assert_eq!(envelope.data["channel_id"], channel.id);

    // C got nothing live and exactly one push; A got neither.
    assert!(drain_queue(&fx.queues, 3).await.is_empty());
    assert!(drain_queue(&fx.queues, 1).await.is_empty());
    let pushed = fx.push.sent.lock().unwrap();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].user_id, 3);
    assert_eq!(pushed[0].body, "hi");
}

#[tokio::test]
async fn partial_read_then_first_unread_window() {
    // Five messages; the reader has read only the first. first_unread must
    // anchor on the second, and a (2, 2) window spans the first four.
    let fx = fixture();
    let channel = fx.db.create_channel("catch-up", 1).unwrap();
    for user in [1, 2] {
        fx.db.subscribe(channel.id, user).unwrap();
    }

    let mut sent = Vec::new();
    for i in 0..5 {
        sent.push(send_message(&fx, channel.id, 1, &format!("m{i}")).await);
    }

    let flipped = fx.db.mark_read(2, channel.id, sent[0].id, 0, 0).unwrap();
    assert_eq!(flipped, vec![sent[0].id]);

    let anchor = fx
        .db
        .resolve_anchor(channel.id, 2, Anchor::FirstUnread)
        .unwrap();
    assert_eq!(anchor, sent[1].id);

    let window = fx.db.visible_window(channel.id, 2, anchor, 2, 2).unwrap();
    let ids: Vec<i64> = window.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![sent[0].id, sent[1].id, sent[2].id, sent[3].id]);
}

#[tokio::test]
async fn read_receipts_reach_only_live_viewers() {
    let fx = fixture();
    let channel = fx.db.create_channel("receipts", 1).unwrap();
    for user in [1, 2, 3] {
        fx.db.subscribe(channel.id, user).unwrap();
    }

    let message = send_message(&fx, channel.id, 1, "read me").await;
    let pushes_after_send = fx.push.sent.lock().unwrap().len();

    // User 1 is watching the channel; user 3 is not.
    fx.presence.set_active(1, channel.id, Duration::from_secs(300));

    // User 2 marks the message read; the receipt goes out to the others.
    let flipped = fx.db.mark_read(2, channel.id, message.id, 0, 0).unwrap();
    assert_eq!(flipped, vec![message.id]);
    let envelope = EventEnvelope::read_receipt(channel.id, 2, &flipped);
    fx.router.fan_out(channel.id, &[1, 3], &envelope).await;

    let viewer_events = drain_queue(&fx.queues, 1).await;
    assert_eq!(viewer_events.len(), 1);
    let receipt: EventEnvelope = serde_json::from_str(&viewer_events[0].payload).unwrap();
    assert_eq!(receipt.data["user_id"], 2);
    assert_eq!(receipt.data["message_ids"][0], message.id);

    // Read receipts are live-only: nothing queued and no new push for user 3.
    assert!(drain_queue(&fx.queues, 3).await.is_empty());
    assert_eq!(fx.push.sent.lock().unwrap().len(), pushes_after_send);
}

#[tokio::test]
async fn delivery_preserves_per_recipient_order() {
    let fx = fixture();
    let channel = fx.db.create_channel("ordered", 1).unwrap();
    for user in [1, 2] {
        fx.db.subscribe(channel.id, user).unwrap();
    }
    fx.presence.set_active(2, channel.id, Duration::from_secs(300));

    for i in 0..10 {
        send_message(&fx, channel.id, 1, &format!("m{i}")).await;
    }

    let events = drain_queue(&fx.queues, 2).await;
    assert_eq!(events.len(), 10);
    for (i, event) in events.iter().enumerate() {
        let envelope: EventEnvelope = serde_json::from_str(&event.payload).unwrap();
        assert_eq!(envelope.data["content"], format!("m{i}"));
    }
    assert!(events.windows(2).all(|pair| pair[0].id < pair[1].id));
}
