use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::api::internal_error;
use crate::settings::is_valid_name;
use crate::state::{AppState, AuthContext, JsonResult};
use crate::utils::json_error;

#[derive(Deserialize)]
pub struct SettingRequest {
    pub value: String,
}

#[derive(Serialize)]
pub struct SettingResponse {
    pub name: String,
    pub value: String,
}

pub async fn get_setting(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(name): AxumPath<String>,
) -> JsonResult<SettingResponse> {
    if !is_valid_name(&name) {
        return Err(json_error(StatusCode::BAD_REQUEST, "invalid setting name"));
    }
    match state
        .settings
        .get(&ctx.user.id, &name)
        .map_err(internal_error)?
    {
        Some(value) => Ok(Json(SettingResponse { name, value })),
        None => Err(json_error(StatusCode::NOT_FOUND, "setting not found")),
    }
}

pub async fn put_setting(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AxumPath(name): AxumPath<String>,
    Json(payload): Json<SettingRequest>,
) -> JsonResult<SettingResponse> {
    if !is_valid_name(&name) {
        return Err(json_error(StatusCode::BAD_REQUEST, "invalid setting name"));
    }
    state
        .settings
        .set(&ctx.user.id, &name, &payload.value)
        .map_err(internal_error)?;
    Ok(Json(SettingResponse {
        name,
        value: payload.value,
    }))
}
