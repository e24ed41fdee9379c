use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use tracing::debug;

use parley_store::StoreError;
use parley_types::api::{
    MessagesQuery, SendMessageRequest, UpdateFlagsRequest, UpdateFlagsResponse,
};
use parley_types::events::EventEnvelope;
use parley_types::models::Message;

use crate::AppState;
use crate::error::ApiError;
use crate::middleware::Claims;

/// Fetch a window of messages around an anchor. The caller must be in the
/// channel's subscriber set; the join fence is applied on every call.
pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let user_id = claims.sub;

    // Run blocking DB work off the async runtime
    let db = state.clone();
    let messages = tokio::task::spawn_blocking(move || -> Result<Vec<Message>, ApiError> {
        if !db.store.is_subscriber(query.channel_id, user_id)? {
            return Err(ApiError::Forbidden);
        }
        let anchor_id = db
            .store
            .resolve_anchor(query.channel_id, user_id, query.anchor)?;
        let messages = db.store.visible_window(
            query.channel_id,
            user_id,
            anchor_id,
            query.num_before,
            query.num_after,
        )?;
        Ok(messages)
    })
    .await??;

    Ok(Json(messages))
}

/// Persist a message and fan it out to the channel's subscribers. Fan-out
/// only starts after the row and its read markers are durable, so a delivery
/// hiccup can never lose the message.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let sender_id = claims.sub;
    let channel_id = req.channel_id;

    let db = state.clone();
    let (message, subscribers) =
        tokio::task::spawn_blocking(move || -> Result<(Message, Vec<i64>), ApiError> {
            let subscribers = db.store.subscribers(channel_id)?;
            if !subscribers.contains(&sender_id) {
                return Err(ApiError::Forbidden);
            }

            let message = match db.store.append_message(channel_id, sender_id, &req.content) {
                Ok(message) => message,
                // One retry on a transient store failure before giving up.
                Err(StoreError::Db(e)) => {
                    debug!("retrying message append after transient error: {}", e);
                    db.store.append_message(channel_id, sender_id, &req.content)?
                }
                Err(e) => return Err(e.into()),
            };

            db.store
                .mark_subscribed(message.id, &subscribers, sender_id)?;
            Ok((message, subscribers))
        })
        .await??;

    // The sender's client already has the message; everyone else gets it
    // routed live or via push.
    let recipients: Vec<i64> = subscribers
        .into_iter()
        .filter(|&id| id != sender_id)
        .collect();
    let envelope = EventEnvelope::stream_message(channel_id, &message);
    state.router.fan_out(channel_id, &recipients, &envelope).await;

    Ok((StatusCode::CREATED, Json(message)))
}

/// Mark the anchor window read. Emits a read receipt to whoever is watching
/// the channel — but only when something actually flipped.
pub async fn update_flags(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateFlagsRequest>,
) -> Result<Json<UpdateFlagsResponse>, ApiError> {
    let user_id = claims.sub;
    let channel_id = req.channel_id;

    let db = state.clone();
    let (flipped, subscribers) =
        tokio::task::spawn_blocking(move || -> Result<(Vec<i64>, Vec<i64>), ApiError> {
            if !db.store.is_subscriber(channel_id, user_id)? {
                return Err(ApiError::Forbidden);
            }
            let anchor_id = db.store.resolve_anchor(channel_id, user_id, req.anchor)?;
            let flipped = db.store.mark_read(
                user_id,
                channel_id,
                anchor_id,
                req.num_before,
                req.num_after,
            )?;
            let subscribers = db.store.subscribers(channel_id)?;
            Ok((flipped, subscribers))
        })
        .await??;

    if !flipped.is_empty() {
        let recipients: Vec<i64> = subscribers
            .into_iter()
            .filter(|&id| id != user_id)
            .collect();
        let envelope = EventEnvelope::read_receipt(channel_id, user_id, &flipped);
        state.router.fan_out(channel_id, &recipients, &envelope).await;
    }

    Ok(Json(UpdateFlagsResponse { messages: flipped }))
}
