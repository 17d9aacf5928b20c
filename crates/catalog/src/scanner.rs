use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use common::{natural_id, relpath_from, MediaEntry, MediaKind};
use metadata::{extract_path, MetadataError, TagSet};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    decode_value, encode_value, join_key, now_secs, Catalog, CatalogError, MEDIA_BY_USER_TABLE,
    MEDIA_TABLE,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

struct Candidate {
    path: PathBuf,
    relpath: String,
    mtime: u64,
    size: u64,
}

impl Catalog {
    /// Brings the user's `kind` rows in line with the files under `root`.
    ///
    /// Files whose mtime and size match the stored row are not re-read. Tag
    /// extraction happens before the write transaction opens; a file that
    /// fails extraction is skipped. All writes for the scan share one
    /// transaction, so a store error leaves the previous catalog intact.
    pub fn scan_path(
        &self,
        user_id: &str,
        kind: MediaKind,
        root: &Path,
        scratch_limit: u64,
    ) -> Result<ScanReport, CatalogError> {
        if !root.is_dir() {
            warn!("Skipping {} scan for {}: {:?} is not a directory", kind, user_id, root);
            return Err(CatalogError::RootMissing(root.to_path_buf()));
        }

        let candidates = collect_media_files(root, kind);
        info!("Found {} {} files for {}", candidates.len(), kind, user_id);

        let mut report = ScanReport {
            scanned: candidates.len(),
            ..ScanReport::default()
        };

        let mut drafts = Vec::new();
        {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(MEDIA_TABLE)?;
            for candidate in candidates {
                let id = natural_id(&[user_id, &candidate.relpath]);
                let existing: Option<MediaEntry> = match table.get(id.as_str())? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                if let Some(existing) = &existing {
                    if existing.mtime == candidate.mtime && existing.file_size == candidate.size {
                        report.unchanged += 1;
                        continue;
                    }
                }

                let tags = match extract_path(&candidate.path, scratch_limit) {
                    Ok(tags) => Some(tags),
                    Err(MetadataError::Unsupported(hint)) => {
                        debug!("No tag parser for {:?} ({})", candidate.path, hint);
                        None
                    }
                    Err(err) => {
                        warn!(
                            "Skipping {:?} for {}: {}",
                            candidate.path, user_id, err
                        );
                        report.skipped += 1;
                        continue;
                    }
                };
                drafts.push(build_entry(id, user_id, kind, &candidate, tags));
            }
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(MEDIA_TABLE)?;
            let mut index = write_txn.open_table(MEDIA_BY_USER_TABLE)?;
            for mut entry in drafts {
                let existing: Option<MediaEntry> = match table.get(entry.id.as_str())? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                match existing {
                    Some(existing) => {
                        entry.favorited = existing.favorited;
                        report.updated += 1;
                    }
                    None => report.inserted += 1,
                }
                let bytes = encode_value(&entry)?;
                table.insert(entry.id.as_str(), bytes.as_slice())?;
                let index_key = join_key(&[user_id, kind.as_str(), &entry.path]);
                index.insert(index_key.as_str(), entry.id.as_bytes())?;
            }
        }
        write_txn.commit()?;

        info!(
            "{} scan for {} finished: {} new, {} updated, {} unchanged, {} skipped",
            kind, user_id, report.inserted, report.updated, report.unchanged, report.skipped
        );
        Ok(report)
    }
}

fn collect_media_files(root: &Path, kind: MediaKind) -> Vec<Candidate> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let matches = mime_guess::from_path(path)
            .first_raw()
            .map(|mime| mime.starts_with(kind.mime_prefix()))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let relpath = match relpath_from(root, path) {
            Some(rel) => rel,
            None => continue,
        };
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                warn!("Failed to stat {:?}: {}", path, err);
                continue;
            }
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|value| value.as_secs())
            .unwrap_or(0);
        files.push(Candidate {
            path: path.to_path_buf(),
            relpath,
            mtime,
            size: meta.len(),
        });
    }
    files
}

fn build_entry(
    id: String,
    user_id: &str,
    kind: MediaKind,
    candidate: &Candidate,
    tags: Option<TagSet>,
) -> MediaEntry {
    let tags = tags.unwrap_or_default();
    let title = tags.title.clone().unwrap_or_else(|| file_stem(&candidate.path));
    let (artist, album_artist) = match kind {
        MediaKind::Music => (tags.artist.clone().unwrap_or_default(), tags.album_artist.clone()),
        MediaKind::Video => (String::new(), String::new()),
    };
    MediaEntry {
        id,
        user_id: user_id.to_string(),
        kind,
        path: candidate.relpath.clone(),
        title,
        artist,
        album_artist,
        album: tags.album.unwrap_or_default(),
        track_number: tags.track_number,
        duration_secs: tags.duration_secs,
        album_art: tags.cover.map(|cover| cover.data),
        genre: tags.genre,
        year: tags.year,
        bitrate_kbps: tags.bitrate_kbps,
        codec: tags.codec,
        mtime: candidate.mtime,
        file_size: candidate.size,
        raw_tags: if tags.raw_json.is_empty() {
            None
        } else {
            Some(tags.raw_json)
        },
        favorited: false,
        scanned_at: now_secs(),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}
