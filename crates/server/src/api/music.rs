use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    Extension, Json,
};
use catalog::{AlbumGroup, ArtistDetail, ArtistGroup};

use crate::api::internal_error;
use crate::state::{AppState, AuthContext, JsonResult};
use crate::utils::json_error;

pub async fn list_albums(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> JsonResult<Vec<AlbumGroup>> {
    let albums = state
        .catalog
        .list_albums(&ctx.user.id)
        .map_err(internal_error)?;
    Ok(Json(albums))
}

pub async fn list_artists(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> JsonResult<Vec<ArtistGroup>> {
    let artists = state
        .catalog
        .list_artists(&ctx.user.id)
        .map_err(internal_error)?;
    Ok(Json(artists))
}

/// `album_key` is the `album_artist|album` key from the album listing.
pub async fn get_album(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(album_key): AxumPath<String>,
) -> JsonResult<AlbumGroup> {
    match state
        .catalog
        .get_album(&ctx.user.id, &album_key)
        .map_err(internal_error)?
    {
        Some(album) => Ok(Json(album)),
        None => Err(json_error(StatusCode::NOT_FOUND, "album not found")),
    }
}

pub async fn get_artist(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(name): AxumPath<String>,
) -> JsonResult<ArtistDetail> {
    match state
        .catalog
        .get_artist(&ctx.user.id, &name)
        .map_err(internal_error)?
    {
        Some(artist) => Ok(Json(artist)),
        None => Err(json_error(StatusCode::NOT_FOUND, "artist not found")),
    }
}
