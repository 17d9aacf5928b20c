use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Extension, Json,
};
use catalog::ScanReport;
use common::{MediaEntry, MediaKind};
use serde::{Deserialize, Serialize};

use crate::api::internal_error;
use crate::scan::scan_user;
use crate::state::{AppState, AuthContext, JsonResult, ListResponse, PageQuery};
use crate::streaming::stream_media;
use crate::utils::{json_error, page_limit};

#[derive(Serialize)]
pub struct MediaEntryResponse {
    pub id: String,
    pub kind: MediaKind,
    pub path: String,
    pub title: String,
    pub artist: String,
    pub album_artist: String,
    pub album: String,
    pub track_number: Option<u32>,
    pub duration_secs: Option<u32>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub bitrate_kbps: Option<u32>,
    pub codec: Option<String>,
    pub file_size: u64,
    pub has_album_art: bool,
    pub favorited: bool,
}

impl From<MediaEntry> for MediaEntryResponse {
    fn from(entry: MediaEntry) -> Self {
        Self {
            has_album_art: entry.album_art.is_some(),
            id: entry.id,
            kind: entry.kind,
            path: entry.path,
            title: entry.title,
            artist: entry.artist,
            album_artist: entry.album_artist,
            album: entry.album,
            track_number: entry.track_number,
            duration_secs: entry.duration_secs,
            genre: entry.genre,
            year: entry.year,
            bitrate_kbps: entry.bitrate_kbps,
            codec: entry.codec,
            file_size: entry.file_size,
            favorited: entry.favorited,
        }
    }
}

#[derive(Deserialize)]
pub struct FavoriteRequest {
    pub favorited: bool,
}

#[derive(Serialize)]
pub struct FavoriteResponse {
    pub id: String,
    pub favorited: bool,
}

fn parse_kind(raw: &str) -> Result<MediaKind, (StatusCode, Json<crate::state::ErrorResponse>)> {
    raw.parse()
        .map_err(|err: String| json_error(StatusCode::BAD_REQUEST, err))
}

pub async fn list_catalog(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(kind): AxumPath<String>,
    Query(query): Query<PageQuery>,
) -> JsonResult<ListResponse<MediaEntryResponse>> {
    let kind = parse_kind(&kind)?;
    let (items, total) = state
        .catalog
        .list_media(
            &ctx.user.id,
            kind,
            query.search.as_deref(),
            page_limit(query.limit),
            query.offset.unwrap_or(0),
        )
        .map_err(internal_error)?;
    Ok(Json(ListResponse {
        items: items.into_iter().map(MediaEntryResponse::from).collect(),
        total,
    }))
}

pub async fn stream_entry(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(entry_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    stream_media(&state, &ctx.user.id, &entry_id, range).await
}

pub async fn set_favorite(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(entry_id): AxumPath<String>,
    Json(payload): Json<FavoriteRequest>,
) -> JsonResult<FavoriteResponse> {
    let updated = state
        .catalog
        .set_media_favorite(&ctx.user.id, &entry_id, payload.favorited)
        .map_err(internal_error)?;
    if !updated {
        return Err(json_error(StatusCode::NOT_FOUND, "entry not found"));
    }
    Ok(Json(FavoriteResponse {
        id: entry_id,
        favorited: payload.favorited,
    }))
}

/// Runs the scan in-request and reports the outcome.
pub async fn scan(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(kind): AxumPath<String>,
) -> JsonResult<ScanReport> {
    let kind = parse_kind(&kind)?;
    let report = scan_user(&state, &ctx.user.id, kind)
        .await
        .map_err(|err| json_error(err.status(), err.to_string()))?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use crate::api::api_router;
    use crate::api::tests::call;
    use crate::test_support::test_state;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn scan_list_and_favorite() {
        let (_dir, state) = test_state();
        let root = state.user_root("bob").join("Music").join("Artist");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join("one.wav"),
            metadata::fixtures::wav_bytes(Some("One"), Some("Artist"), Some("Album"), 1),
        )
        .unwrap();
        std::fs::write(root.join("notes.txt"), b"not media").unwrap();
        let router = api_router(state);
        let token = Some("bob-token");

        let (status, report) = call(router.clone(), Method::POST, "/scan/music", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["inserted"], 1);

        let (status, _) = call(router.clone(), Method::POST, "/scan/video", token, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(router.clone(), Method::POST, "/scan/books", token, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, list) =
            call(router.clone(), Method::GET, "/catalog/music?search=one", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["total"], 1);
        let id = list["items"][0]["id"].as_str().unwrap().to_string();
        assert!(list["items"][0].get("album_art").is_none());

        let uri = format!("/catalog/entries/{}/favorite", id);
        let (status, body) = call(
            router.clone(),
            Method::POST,
            &uri,
            token,
            Some(json!({ "favorited": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["favorited"], true);

        let (status, _) = call(
            router,
            Method::POST,
            "/catalog/entries/unknown/favorite",
            token,
            Some(json!({ "favorited": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
