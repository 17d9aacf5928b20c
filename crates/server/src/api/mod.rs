pub mod catalog;
pub mod music;
pub mod podcasts;
pub mod radio;
pub mod settings;

use axum::{
    body::Body,
    extract::State,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::state::{AppState, AuthContext, ErrorResponse, HealthResponse};
use crate::utils::{extract_token, json_error, json_error_response};

pub fn api_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/catalog/:kind", get(catalog::list_catalog))
        .route("/catalog/entries/:entry_id/stream", get(catalog::stream_entry))
        .route("/catalog/entries/:entry_id/favorite", post(catalog::set_favorite))
        .route("/scan/:kind", post(catalog::scan))
        .route("/music/albums", get(music::list_albums))
        .route("/music/albums/:album_key", get(music::get_album))
        .route("/music/artists", get(music::list_artists))
        .route("/music/artists/:name", get(music::get_artist))
        .route(
            "/podcasts/subscriptions",
            get(podcasts::list_subscriptions).post(podcasts::subscribe),
        )
        .route(
            "/podcasts/subscriptions/:subscription_id",
            get(podcasts::get_subscription).delete(podcasts::unsubscribe),
        )
        .route(
            "/podcasts/subscriptions/:subscription_id/episodes",
            get(podcasts::list_episodes),
        )
        .route(
            "/podcasts/subscriptions/:subscription_id/refresh",
            post(podcasts::refresh_subscription),
        )
        .route("/podcasts/track", post(podcasts::track_action))
        .route("/podcasts/next", get(podcasts::next_episodes))
        .route("/podcasts/episodes/:episode_id/position", get(podcasts::get_position))
        .route("/podcasts/episodes/:episode_id/stream", get(podcasts::stream_episode))
        .route("/podcasts/import", post(podcasts::import_external))
        .route("/radio/stations", get(radio::list_stations))
        .route("/radio/stations/:station_id", get(radio::get_station))
        .route("/radio/favorites", get(radio::list_favorites))
        .route("/radio/search/:name", get(radio::search_stations))
        .route("/radio/stations/:station_id/favorite", post(radio::set_favorite))
        .route("/radio/import", post(radio::import_stations))
        .route(
            "/settings/:name",
            get(settings::get_setting).put(settings::put_setting),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let token = match extract_token(req.headers()) {
        Some(token) => token,
        None => return json_error_response(StatusCode::UNAUTHORIZED, "unauthorized"),
    };
    let user = state.config.read().user_by_token(&token).cloned();
    match user {
        Some(user) => {
            req.extensions_mut().insert(AuthContext { user });
            next.run(req).await
        }
        None => json_error_response(StatusCode::UNAUTHORIZED, "unauthorized"),
    }
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

pub(crate) fn internal_error(
    err: impl std::fmt::Display,
) -> (StatusCode, Json<ErrorResponse>) {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_support::test_state;
    use axum::body::to_bytes;
    use axum::http::{header, Method, Request};
    use tower::ServiceExt;

    pub(crate) async fn call(
        router: Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_is_public_and_rest_requires_a_token() {
        let (_dir, state) = test_state();
        let router = api_router(state);

        let (status, body) = call(router.clone(), Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) =
            call(router.clone(), Method::GET, "/catalog/music", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) =
            call(router.clone(), Method::GET, "/catalog/music", Some("wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) =
            call(router, Method::GET, "/catalog/music", Some("bob-token"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
    }
}
