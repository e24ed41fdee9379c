use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_types::events::{EventEnvelope, WireEvent};

use crate::auth::{AuthError, VerifiedUser};
use crate::manager::ConnectionManager;
use crate::queue::{AdaptiveBatch, Cursor, EventId, EventQueues};

/// Close codes sent on the policy paths of session setup and teardown.
pub mod close_code {
    /// No credential in the connection handshake, or one that fails to verify.
    pub const MISSING_CREDENTIAL: u16 = 4001;
    /// The account is suspended.
    pub const INACTIVE_ACCOUNT: u16 = 4003;
    /// The account has not completed verification.
    pub const UNVERIFIED_ACCOUNT: u16 = 4004;
    /// The server is closing the connection (shutdown, takeover).
    pub const SERVER_CLOSE: u16 = 1001;
}

impl AuthError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::MissingCredential | Self::InvalidToken => close_code::MISSING_CREDENTIAL,
            Self::InactiveAccount => close_code::INACTIVE_ACCOUNT,
            Self::UnverifiedAccount => close_code::UNVERIFIED_ACCOUNT,
        }
    }

    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing credential",
            Self::InvalidToken => "invalid credential",
            Self::InactiveAccount => "account is inactive",
            Self::UnverifiedAccount => "account is not verified",
        }
    }
}

/// Lifecycle of one persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Upper bound on a single blocking consume. Keep this short: it is also
    /// the bound on how long a session takes to observe cancellation.
    pub block_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(2),
        }
    }
}

/// Max consecutive consume failures before the session is torn down instead
/// of being left in an inconsistent state.
const MAX_BACKEND_FAILURES: u32 = 3;

fn transition(user_id: i64, state: &mut SessionState, to: SessionState) {
    *state = to;
    debug!("user {} session state -> {:?}", user_id, state);
}

/// Drive one accepted WebSocket to completion: authenticate, stream the
/// owner's queue, tear down. `auth` is the result of resolving the
/// subprotocol credential at upgrade time; `resume` is the raw
/// `last_event_id` query parameter, if any.
pub async fn serve_socket(
    mut socket: WebSocket,
    auth: Result<VerifiedUser, AuthError>,
    resume: Option<String>,
    manager: ConnectionManager,
    queues: EventQueues,
    config: SessionConfig,
) {
    let mut state = SessionState::Connecting;
    debug!("gateway session opened ({:?})", state);

    let auth = auth.and_then(|user| {
        if !user.active {
            Err(AuthError::InactiveAccount)
        } else if !user.verified {
            Err(AuthError::UnverifiedAccount)
        } else {
            Ok(user)
        }
    });

    let user = match auth {
        Ok(user) => user,
        Err(e) => {
            warn!("rejecting connection: {}", e);
            let frame = CloseFrame {
                code: e.close_code(),
                reason: e.close_reason().into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            state = SessionState::Closed;
            debug!("unauthenticated session closed ({:?})", state);
            return;
        }
    };
    let user_id = user.user_id;
    transition(user_id, &mut state, SessionState::Authenticated);

    let cursor = match resume.as_deref() {
        None => Cursor::Latest,
        Some(raw) => match raw.parse::<EventId>() {
            Ok(id) => Cursor::After(id),
            Err(_) => {
                warn!("user {} sent malformed resume cursor {:?}, subscribing from latest", user_id, raw);
                Cursor::Latest
            }
        },
    };

    // Registering marks the owner online and cancels any previous session.
    let (conn_id, cancel) = manager.register(user_id);
    transition(user_id, &mut state, SessionState::Streaming);
    info!("user {} connected to gateway (conn {})", user_id, conn_id);

    let (sender, receiver) = socket.split();
    let outbound = tokio::spawn(outbound_loop(
        sender,
        queues.clone(),
        user_id,
        cursor,
        cancel.clone(),
        config,
    ));
    let inbound = tokio::spawn(inbound_loop(receiver, user_id, cancel.clone()));

    // Either loop failing cancels the token; the other observes it within one
    // blocking-wait interval. Teardown below runs regardless of which side
    // went first.
    let _ = tokio::join!(outbound, inbound);

    transition(user_id, &mut state, SessionState::Closing);
    cancel.cancel();
    manager.release(user_id, conn_id);
    transition(user_id, &mut state, SessionState::Closed);
    info!("user {} disconnected from gateway (conn {})", user_id, conn_id);
}

/// Consume the owner's queue from the resume cursor and write each event to
/// the client, advancing the local cursor as frames go out.
async fn outbound_loop(
    mut sender: SplitSink<WebSocket, Message>,
    queues: EventQueues,
    user_id: i64,
    mut cursor: Cursor,
    cancel: CancellationToken,
    config: SessionConfig,
) {
    let mut batch = AdaptiveBatch::new();
    let mut backend_failures = 0u32;

    loop {
        let events = tokio::select! {
            _ = cancel.cancelled() => {
                // Server-initiated close (shutdown or a takeover by a newer
                // session). Best-effort: the peer may already be gone.
                let frame = CloseFrame {
                    code: close_code::SERVER_CLOSE,
                    reason: "stream closed by server".into(),
                };
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            }
            result = queues.consume(user_id, cursor, config.block_timeout, batch.size()) => {
                match result {
                    Ok(events) => {
                        backend_failures = 0;
                        events
                    }
                    Err(e) => {
                        backend_failures += 1;
                        if backend_failures >= MAX_BACKEND_FAILURES {
                            warn!("event store unavailable for user {}, tearing down: {}", user_id, e);
                            cancel.cancel();
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        batch.record(events.len());
        for event in events {
            // A payload that fails to parse is skipped, never fatal: the
            // cursor still advances past it.
            let envelope: EventEnvelope = match serde_json::from_str(&event.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("skipping malformed event {} for user {}: {}", event.id, user_id, e);
                    cursor = Cursor::After(event.id);
                    continue;
                }
            };

            let frame = WireEvent::new(envelope, event.id.to_string());
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("unserializable event {} for user {}: {}", event.id, user_id, e);
                    cursor = Cursor::After(event.id);
                    continue;
                }
            };

            if sender.send(Message::Text(text.into())).await.is_err() {
                cancel.cancel();
                return;
            }
            cursor = Cursor::After(event.id);
        }
    }
}

/// Read client frames solely to detect liveness. Payloads are discarded.
async fn inbound_loop(
    mut receiver: SplitStream<WebSocket>,
    user_id: i64,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                debug!("user {} inbound frame discarded ({} bytes)", user_id, text.len());
            }
            Some(Ok(Message::Close(_))) | None => {
                cancel.cancel();
                break;
            }
            Some(Ok(_)) => {} // ping/pong/binary: liveness only
            Some(Err(e)) => {
                debug!("user {} transport error: {}", user_id, e);
                cancel.cancel();
                break;
            }
        }
    }
}
