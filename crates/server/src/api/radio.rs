use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    Extension, Json,
};
use common::RadioStation;
use serde::Serialize;
use tracing::warn;

use crate::api::catalog::{FavoriteRequest, FavoriteResponse};
use crate::api::internal_error;
use crate::jobs::Job;
use crate::radio::search_directory;
use crate::state::{
    AppState, AuthContext, ErrorResponse, JsonResult, ListResponse, PageQuery, QueuedResponse,
};
use crate::utils::{json_error, page_limit};

#[derive(Serialize)]
pub struct StationResponse {
    pub id: String,
    pub name: String,
    pub stream_url: String,
    pub homepage: String,
    pub country: String,
    pub state: String,
    pub language: String,
    pub bitrate: Option<u32>,
    pub codec: String,
    pub tags: String,
    pub has_favicon: bool,
    pub favorited: bool,
}

impl From<RadioStation> for StationResponse {
    fn from(station: RadioStation) -> Self {
        Self {
            has_favicon: station.favicon.is_some(),
            id: station.id,
            name: station.name,
            stream_url: station.stream_url,
            homepage: station.homepage,
            country: station.country,
            state: station.state,
            language: station.language,
            bitrate: station.bitrate,
            codec: station.codec,
            tags: station.tags,
            favorited: station.favorited,
        }
    }
}

pub async fn list_stations(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<PageQuery>,
) -> JsonResult<ListResponse<StationResponse>> {
    let (items, total) = state
        .catalog
        .list_stations(
            &ctx.user.id,
            query.search.as_deref(),
            page_limit(query.limit),
            query.offset.unwrap_or(0),
        )
        .map_err(internal_error)?;
    Ok(Json(ListResponse {
        items: items.into_iter().map(StationResponse::from).collect(),
        total,
    }))
}

pub async fn list_favorites(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<PageQuery>,
) -> JsonResult<ListResponse<StationResponse>> {
    let (items, total) = state
        .catalog
        .list_favorite_stations(
            &ctx.user.id,
            page_limit(query.limit),
            query.offset.unwrap_or(0),
        )
        .map_err(internal_error)?;
    Ok(Json(ListResponse {
        items: items.into_iter().map(StationResponse::from).collect(),
        total,
    }))
}

#[derive(Serialize)]
pub struct StationDetailResponse {
    #[serde(flatten)]
    pub station: StationResponse,
    /// Stored favicon as a `data:` URI.
    pub favicon: Option<String>,
}

pub async fn get_station(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(station_id): AxumPath<String>,
) -> JsonResult<StationDetailResponse> {
    let station = state
        .catalog
        .get_station(&ctx.user.id, &station_id)
        .map_err(internal_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "station not found"))?;
    let favicon = station.favicon.as_deref().map(metadata::cover_data_uri);
    Ok(Json(StationDetailResponse {
        station: StationResponse::from(station),
        favicon,
    }))
}

#[derive(Serialize)]
pub struct DirectoryStationResponse {
    pub remote_uuid: String,
    pub name: String,
    pub stream_url: String,
    pub homepage: String,
    pub country: String,
    pub language: String,
    pub bitrate: Option<u32>,
    pub codec: String,
    pub tags: String,
}

impl From<RadioStation> for DirectoryStationResponse {
    fn from(station: RadioStation) -> Self {
        Self {
            remote_uuid: station.remote_uuid,
            name: station.name,
            stream_url: station.stream_url,
            homepage: station.homepage,
            country: station.country,
            language: station.language,
            bitrate: station.bitrate,
            codec: station.codec,
            tags: station.tags,
        }
    }
}

pub async fn search_stations(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> JsonResult<Vec<DirectoryStationResponse>> {
    let name = name.trim();
    if name.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "name is required"));
    }
    let directory_url = state.config.read().radio_directory_url.clone();
    match search_directory(&state.client, &directory_url, name, state.external_timeout()).await {
        Ok(stations) => Ok(Json(
            stations.into_iter().map(DirectoryStationResponse::from).collect(),
        )),
        Err(err) => {
            warn!("Station directory search failed: {}", err);
            Err(json_error(StatusCode::BAD_GATEWAY, "station search failed"))
        }
    }
}

pub async fn set_favorite(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(station_id): AxumPath<String>,
    Json(payload): Json<FavoriteRequest>,
) -> JsonResult<FavoriteResponse> {
    let updated = state
        .catalog
        .set_station_favorite(&ctx.user.id, &station_id, payload.favorited)
        .map_err(internal_error)?;
    if !updated {
        return Err(json_error(StatusCode::NOT_FOUND, "station not found"));
    }
    Ok(Json(FavoriteResponse {
        id: station_id,
        favorited: payload.favorited,
    }))
}

pub async fn import_stations(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<(StatusCode, Json<QueuedResponse>), (StatusCode, Json<ErrorResponse>)> {
    let queued = state.jobs.submit(Job::ImportRadio {
        user_id: ctx.user.id.clone(),
    });
    if !queued {
        return Err(json_error(StatusCode::SERVICE_UNAVAILABLE, "job queue unavailable"));
    }
    Ok((StatusCode::ACCEPTED, Json(QueuedResponse { queued })))
}
