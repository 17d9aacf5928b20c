use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::Json;
use catalog::Catalog;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{resolve_path, ServerConfig, UserAccount};
use crate::jobs::JobQueue;
use crate::settings::SettingsStore;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub settings: SettingsStore,
    pub config_path: PathBuf,
    pub config: Arc<RwLock<ServerConfig>>,
    pub client: Client,
    pub jobs: JobQueue,
    pub downloads: Arc<Mutex<HashSet<PathBuf>>>,
}

impl AppState {
    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.config.read().external_timeout_secs)
    }

    pub fn scratch_limit(&self) -> u64 {
        self.config.read().scratch_limit_bytes
    }

    /// `<users_root>/<user>`, resolved against the config file directory.
    pub fn user_root(&self, user_id: &str) -> PathBuf {
        let users_root = self.config.read().users_root.clone();
        resolve_path(&self.config_path, &users_root).join(user_id)
    }

    pub fn user_account(&self, user_id: &str) -> Option<UserAccount> {
        self.config.read().user(user_id).cloned()
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct QueuedResponse {
    pub queued: bool,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub search: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Clone)]
pub struct AuthContext {
    pub user: UserAccount,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;
