use std::path::PathBuf;

use catalog::ScanReport;
use common::{join_relpath, MediaEntry, MediaKind};
use tracing::{info, warn};

use crate::jobs::JobError;
use crate::settings::{MUSIC_FOLDER_PATH, VIDEO_FOLDER_PATH};
use crate::state::AppState;

pub fn folder_setting(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Music => MUSIC_FOLDER_PATH,
        MediaKind::Video => VIDEO_FOLDER_PATH,
    }
}

/// `<users_root>/<user>/<folder setting>` for the given kind.
pub fn media_root(state: &AppState, user_id: &str, kind: MediaKind) -> PathBuf {
    let folder = state.settings.get_or_default(user_id, folder_setting(kind));
    join_relpath(&state.user_root(user_id), &folder)
}

pub fn entry_path(state: &AppState, entry: &MediaEntry) -> PathBuf {
    join_relpath(&media_root(state, &entry.user_id, entry.kind), &entry.path)
}

/// Scans one user's media folder for `kind` on the blocking pool.
pub async fn scan_user(
    state: &AppState,
    user_id: &str,
    kind: MediaKind,
) -> Result<ScanReport, JobError> {
    let root = media_root(state, user_id, kind);
    let catalog = state.catalog.clone();
    let scratch_limit = state.scratch_limit();
    let user = user_id.to_string();
    info!("Starting {} scan for {} at {:?}", kind, user_id, root);
    let result = tokio::task::spawn_blocking(move || {
        catalog.scan_path(&user, kind, &root, scratch_limit)
    })
    .await?;
    match result {
        Ok(report) => Ok(report),
        Err(err) => {
            warn!("{} scan for {} failed: {}", kind, user_id, err);
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MUSIC_FOLDER_PATH;
    use crate::test_support::test_state;
    use catalog::CatalogError;

    #[tokio::test]
    async fn scans_the_configured_folder() {
        let (_dir, state) = test_state();
        state.settings.set("alice", MUSIC_FOLDER_PATH, "Audio").unwrap();
        let root = state.user_root("alice").join("Audio").join("Band");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join("song.wav"),
            metadata::fixtures::wav_bytes(Some("Song"), Some("Band"), Some("Record"), 1),
        )
        .unwrap();

        let report = scan_user(&state, "alice", MediaKind::Music).await.unwrap();
        assert_eq!(report.inserted, 1);
        let (items, total) = state
            .catalog
            .list_media("alice", MediaKind::Music, None, 10, 0)
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].path, "Band/song.wav");
        assert!(entry_path(&state, &items[0]).is_file());

        let report = scan_user(&state, "alice", MediaKind::Music).await.unwrap();
        assert_eq!(report.unchanged, 1);
    }

    #[tokio::test]
    async fn missing_folder_is_reported() {
        let (_dir, state) = test_state();
        let err = scan_user(&state, "bob", MediaKind::Video).await.unwrap_err();
        assert!(matches!(err, JobError::Catalog(CatalogError::RootMissing(_))));
    }
}
