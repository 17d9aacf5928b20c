use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use catalog::CatalogError;
use common::{EpisodePlay, PlayAction, PodcastEpisode, PodcastSubscription};
use serde::{Deserialize, Serialize};

use crate::api::internal_error;
use crate::jobs::Job;
use crate::podcasts::{import_gpodder, subscribe_url};
use crate::state::{AppState, AuthContext, ErrorResponse, JsonResult, QueuedResponse};
use crate::streaming;
use crate::utils::{json_error, json_error_response, now_secs};

#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub url: String,
}

#[derive(Deserialize)]
pub struct TrackRequest {
    pub episode_id: String,
    pub action: String,
    pub position: Option<u64>,
    pub total: Option<u64>,
    pub timestamp: Option<u64>,
    pub device: Option<String>,
}

#[derive(Serialize)]
pub struct PositionResponse {
    pub episode_id: String,
    pub position: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImportQuery {
    pub background: Option<bool>,
    pub delayed_fetch: Option<bool>,
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> JsonResult<Vec<PodcastSubscription>> {
    let subscriptions = state
        .catalog
        .list_subscriptions(&ctx.user.id)
        .map_err(internal_error)?;
    Ok(Json(subscriptions))
}

pub async fn subscribe(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<PodcastSubscription>), (StatusCode, Json<ErrorResponse>)> {
    let (subscription, created) = subscribe_url(&state, &ctx.user.id, &payload.url)
        .await
        .map_err(|err| json_error(err.status(), err.to_string()))?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(subscription)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(subscription_id): AxumPath<String>,
) -> JsonResult<PodcastSubscription> {
    match state
        .catalog
        .get_subscription(&ctx.user.id, &subscription_id)
        .map_err(internal_error)?
    {
        Some(subscription) => Ok(Json(subscription)),
        None => Err(json_error(StatusCode::NOT_FOUND, "subscription not found")),
    }
}

/// Marks the subscription inactive. Episodes and plays are kept.
pub async fn unsubscribe(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(subscription_id): AxumPath<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let removed = state
        .catalog
        .unsubscribe(&ctx.user.id, &subscription_id)
        .map_err(internal_error)?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(json_error(StatusCode::NOT_FOUND, "subscription not found"))
    }
}

pub async fn list_episodes(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(subscription_id): AxumPath<String>,
) -> JsonResult<Vec<PodcastEpisode>> {
    let exists = state
        .catalog
        .get_subscription(&ctx.user.id, &subscription_id)
        .map_err(internal_error)?
        .is_some();
    if !exists {
        return Err(json_error(StatusCode::NOT_FOUND, "subscription not found"));
    }
    let episodes = state
        .catalog
        .list_episodes(&ctx.user.id, &subscription_id)
        .map_err(internal_error)?;
    Ok(Json(episodes))
}

pub async fn refresh_subscription(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(subscription_id): AxumPath<String>,
) -> Result<(StatusCode, Json<QueuedResponse>), (StatusCode, Json<ErrorResponse>)> {
    let exists = state
        .catalog
        .get_subscription(&ctx.user.id, &subscription_id)
        .map_err(internal_error)?
        .is_some();
    if !exists {
        return Err(json_error(StatusCode::NOT_FOUND, "subscription not found"));
    }
    let queued = state.jobs.submit(Job::FetchEpisodes {
        user_id: ctx.user.id.clone(),
        subscription_id,
    });
    Ok((StatusCode::ACCEPTED, Json(QueuedResponse { queued })))
}

pub async fn track_action(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<TrackRequest>,
) -> JsonResult<EpisodePlay> {
    let action: PlayAction = payload
        .action
        .parse()
        .map_err(|err: String| json_error(StatusCode::BAD_REQUEST, err))?;
    let timestamp = payload.timestamp.unwrap_or_else(now_secs);
    let play = state
        .catalog
        .record_action(
            &ctx.user.id,
            &payload.episode_id,
            action,
            timestamp,
            payload.position,
            payload.total,
            payload.device,
        )
        .map_err(|err| match err {
            CatalogError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "episode not found"),
            err => internal_error(err),
        })?;
    Ok(Json(play))
}

pub async fn next_episodes(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> JsonResult<Vec<PodcastEpisode>> {
    let episodes = state
        .catalog
        .next_unfinished_per_subscription(&ctx.user.id)
        .map_err(internal_error)?;
    Ok(Json(episodes))
}

pub async fn get_position(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(episode_id): AxumPath<String>,
) -> Json<PositionResponse> {
    let position = state
        .catalog
        .position_for(&ctx.user.id, &episode_id)
        .unwrap_or(0);
    Json(PositionResponse {
        episode_id,
        position,
    })
}

pub async fn stream_episode(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(episode_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    streaming::stream_episode(&state, &ctx.user.id, &episode_id, range).await
}

/// gpodder import. `background=true` queues the whole import; otherwise it
/// runs in-request and the metadata of new subscriptions is fetched inline
/// unless `delayed_fetch=true`.
pub async fn import_external(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ImportQuery>,
) -> Response {
    if ctx.user.gpodder.is_none() {
        return json_error_response(StatusCode::BAD_REQUEST, "no gpodder account configured");
    }
    if query.background.unwrap_or(false) {
        let queued = state.jobs.submit(Job::ImportGpodder {
            user_id: ctx.user.id.clone(),
        });
        return (StatusCode::ACCEPTED, Json(QueuedResponse { queued })).into_response();
    }
    match import_gpodder(&state, &ctx.user.id, query.delayed_fetch.unwrap_or(false)).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => json_error_response(err.status(), err.to_string()),
    }
}
