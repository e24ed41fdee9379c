use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};

use parley_types::api::{ChannelOverview, CreateChannelRequest, LocationRequest};
use parley_types::events::EventEnvelope;
use parley_types::models::Channel;

use crate::AppState;
use crate::error::ApiError;
use crate::middleware::Claims;

pub async fn create_channel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateChannelRequest>,
) -> Result<(StatusCode, Json<Channel>), ApiError> {
    if req.name.is_empty() || req.name.len() > 64 {
        return Err(ApiError::BadRequest(
            "channel name must be 1-64 characters".into(),
        ));
    }

    let creator_id = claims.sub;
    let db = state.clone();
    let channel = tokio::task::spawn_blocking(move || -> Result<Channel, ApiError> {
        let channel = db.store.create_channel(&req.name, creator_id)?;
        db.store.subscribe(channel.id, creator_id)?;
        Ok(channel)
    })
    .await??;

    Ok((StatusCode::CREATED, Json(channel)))
}

/// The caller's subscriptions, each with its subscriber list, unread count
/// and most recent visible message.
pub async fn list_channels(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ChannelOverview>>, ApiError> {
    let user_id = claims.sub;
    let db = state.clone();
    let overview = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
        Ok(db.store.subscription_overview(user_id)?)
    })
    .await??;

    Ok(Json(overview))
}

pub async fn subscribe_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    let user_id = claims.sub;
    let db = state.clone();
    tokio::task::spawn_blocking(move || -> Result<(), ApiError> {
        Ok(db.store.subscribe(channel_id, user_id)?)
    })
    .await??;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn unsubscribe_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    let user_id = claims.sub;
    let db = state.clone();
    tokio::task::spawn_blocking(move || -> Result<(), ApiError> {
        Ok(db.store.unsubscribe(channel_id, user_id)?)
    })
    .await??;

    Ok(StatusCode::NO_CONTENT)
}

/// Mark the caller as actively viewing this channel. Clients renew on a
/// heartbeat; the record expires on its own when they stop.
pub async fn set_active(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    let user_id = claims.sub;

    let db = state.clone();
    let subscribed = tokio::task::spawn_blocking(move || -> Result<bool, ApiError> {
        Ok(db.store.is_subscriber(channel_id, user_id)?)
    })
    .await??;
    if !subscribed {
        return Err(ApiError::Forbidden);
    }

    state.presence.set_active(user_id, channel_id, state.presence_ttl);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_active(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    state.presence.clear_active(claims.sub);
    Ok(StatusCode::NO_CONTENT)
}

/// Share a live location with whoever is viewing the channel right now.
/// Nothing is persisted and nobody gets a push for it.
pub async fn send_location(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<LocationRequest>,
) -> Result<StatusCode, ApiError> {
    let user_id = claims.sub;

    let db = state.clone();
    let subscribers = tokio::task::spawn_blocking(move || -> Result<Vec<i64>, ApiError> {
        let subscribers = db.store.subscribers(channel_id)?;
        if !subscribers.contains(&user_id) {
            return Err(ApiError::Forbidden);
        }
        Ok(subscribers)
    })
    .await??;

    let recipients: Vec<i64> = subscribers
        .into_iter()
        .filter(|&id| id != user_id)
        .collect();
    let envelope = EventEnvelope::location(channel_id, user_id, req.lat, req.lng);
    state.router.fan_out(channel_id, &recipients, &envelope).await;

    Ok(StatusCode::NO_CONTENT)
}
