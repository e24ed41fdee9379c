use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_api::middleware::{JwtVerifier, require_auth};
use parley_api::{AppState, AppStateInner, channels, messages};
use parley_gateway::auth::{AuthError, TokenVerifier};
use parley_gateway::connection::{self, SessionConfig};
use parley_gateway::manager::{ConnectionManager, InMemoryOnlineStatus, OnlineStatus};
use parley_gateway::presence::PresenceTracker;
use parley_gateway::push::PushNotifier;
use parley_gateway::queue::EventQueues;
use parley_gateway::router::DeliveryRouter;
use parley_store::Database;

use crate::config::Config;

/// Everything the routes need, REST and gateway alike.
#[derive(Clone)]
pub struct ServerState {
    pub app: AppState,
    pub manager: ConnectionManager,
    pub queues: EventQueues,
    pub verifier: Arc<dyn TokenVerifier>,
    pub session: SessionConfig,
}

pub fn build_state(store: Database, config: &Config, push: Arc<dyn PushNotifier>) -> ServerState {
    let queues = EventQueues::new();
    let presence = PresenceTracker::new();
    let router = DeliveryRouter::new(presence.clone(), queues.clone(), push);

    let app: AppState = Arc::new(AppStateInner {
        store,
        router,
        presence,
        jwt_secret: config.jwt_secret.clone(),
        presence_ttl: config.presence_ttl,
    });

    let online: Arc<dyn OnlineStatus> = Arc::new(InMemoryOnlineStatus::default());
    let manager = ConnectionManager::new(online);
    let verifier: Arc<dyn TokenVerifier> = Arc::new(JwtVerifier::new(config.jwt_secret.clone()));

    ServerState {
        app,
        manager,
        queues,
        verifier,
        session: SessionConfig {
            block_timeout: config.queue_block,
        },
    }
}

pub fn build_router(state: ServerState) -> Router {
    let protected = Router::new()
        .route("/messages", get(messages::get_messages))
        .route("/messages/send", post(messages::send_message))
        .route("/messages/flags", post(messages::update_flags))
        .route(
            "/channels",
            post(channels::create_channel).get(channels::list_channels),
        )
        .route(
            "/channels/{channel_id}/subscribe",
            post(channels::subscribe_channel).delete(channels::unsubscribe_channel),
        )
        .route("/channels/{channel_id}/active", post(channels::set_active))
        .route("/channels/active", delete(channels::clear_active))
        .route("/channels/{channel_id}/location", post(channels::send_location))
        .layer(middleware::from_fn_with_state(state.app.clone(), require_auth))
        .with_state(state.app.clone());

    let ws_route = Router::new()
        .route("/connect", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(protected)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    last_event_id: Option<String>,
}

/// Upgrade a gateway connection. The credential rides in the
/// `Sec-WebSocket-Protocol` header — never a query parameter, which would
/// leak it into request logs — and is echoed back on accept as the selected
/// subprotocol. `last_event_id` picks the resume cursor.
async fn ws_upgrade(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let auth = match token.as_deref() {
        None => Err(AuthError::MissingCredential),
        Some(raw) => state.verifier.verify(raw),
    };

    let ws = match token {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    ws.on_upgrade(move |socket| {
        connection::serve_socket(
            socket,
            auth,
            params.last_event_id,
            state.manager,
            state.queues,
            state.session,
        )
    })
}
