mod playback;
mod podcasts;
mod radio;
mod scanner;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{MediaEntry, MediaKind};
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError,
};
use serde::{Deserialize, Serialize};

pub use playback::select_next_unfinished;
pub use podcasts::{episode_id, subscription_id, ActionImportReport, EpisodeStoreReport};
pub use radio::station_id;
pub use scanner::ScanReport;

const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const MEDIA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("media");
const MEDIA_BY_USER_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("media_by_user");
const SUBSCRIPTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("podcast_subs");
const SUBSCRIPTIONS_BY_USER_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("podcast_subs_by_user");
const SUBSCRIPTIONS_BY_EXTERNAL_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("podcast_subs_by_external");
const EPISODES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("podcast_eps");
const EPISODES_BY_SUBSCRIPTION_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("podcast_eps_by_sub");
const PLAYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("podcast_ep_plays");
const STATIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("radio_stations");
const STATIONS_BY_USER_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("radio_stations_by_user");

const META_PLAY_SEQ_KEY: &str = "play_seq";

/// Durable per-user catalog of media, podcasts and radio stations.
///
/// Every row id is derived from its natural key, and every find-then-upsert
/// runs inside a single redb write transaction. redb admits one writer at a
/// time, so concurrent reconciliation triggers cannot insert the same key twice.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        let db = open_or_create_db(path)?;
        let catalog = Self { db: Arc::new(db) };
        catalog.init_tables()?;
        Ok(catalog)
    }

    pub fn with_db(db: Arc<Database>) -> Result<Self, CatalogError> {
        let catalog = Self { db };
        catalog.init_tables()?;
        Ok(catalog)
    }

    pub fn open_db(path: &Path) -> Result<Arc<Database>, CatalogError> {
        let db = open_or_create_db(path)?;
        Ok(Arc::new(db))
    }

    fn init_tables(&self) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(MEDIA_TABLE)?;
            let _ = write_txn.open_table(MEDIA_BY_USER_TABLE)?;
            let _ = write_txn.open_table(SUBSCRIPTIONS_TABLE)?;
            let _ = write_txn.open_table(SUBSCRIPTIONS_BY_USER_TABLE)?;
            let _ = write_txn.open_table(SUBSCRIPTIONS_BY_EXTERNAL_TABLE)?;
            let _ = write_txn.open_table(EPISODES_TABLE)?;
            let _ = write_txn.open_table(EPISODES_BY_SUBSCRIPTION_TABLE)?;
            let _ = write_txn.open_table(PLAYS_TABLE)?;
            let _ = write_txn.open_table(STATIONS_TABLE)?;
            let _ = write_txn.open_table(STATIONS_BY_USER_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn db(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    /// Returns the entry only when it belongs to `user_id`.
    pub fn get_media(&self, user_id: &str, id: &str) -> Result<Option<MediaEntry>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MEDIA_TABLE)?;
        let entry: Option<MediaEntry> = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(entry.filter(|entry| entry.user_id == user_id))
    }

    pub fn list_media(
        &self,
        user_id: &str,
        kind: MediaKind,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MediaEntry>, usize), CatalogError> {
        let search = search
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_lowercase());

        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(MEDIA_BY_USER_TABLE)?;
        let table = read_txn.open_table(MEDIA_TABLE)?;

        let prefix = media_kind_prefix(user_id, kind);
        let end = prefix_end(&prefix);
        let mut total = 0usize;
        let mut items = Vec::new();

        for entry in index.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let id = decode_id(entry.1.value())?;
            let media: MediaEntry = match table.get(id.as_str())? {
                Some(value) => decode_value(value.value())?,
                None => continue,
            };
            if let Some(search) = &search {
                if !media_matches(&media, search) {
                    continue;
                }
            }

            total += 1;
            if total <= offset {
                continue;
            }
            if items.len() >= limit {
                continue;
            }
            items.push(media);
        }

        Ok((items, total))
    }

    pub fn set_media_favorite(
        &self,
        user_id: &str,
        id: &str,
        favorited: bool,
    ) -> Result<bool, CatalogError> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(MEDIA_TABLE)?;
            let mut entry: MediaEntry = match table.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(false),
            };
            if entry.user_id != user_id {
                return Ok(false);
            }
            entry.favorited = favorited;
            let bytes = encode_value(&entry)?;
            table.insert(id, bytes.as_slice())?;
            true
        };
        write_txn.commit()?;
        Ok(updated)
    }

    /// Music grouped by `album_artist|album`, ordered by that key.
    pub fn list_albums(&self, user_id: &str) -> Result<Vec<AlbumGroup>, CatalogError> {
        let (tracks, _) = self.list_media(user_id, MediaKind::Music, None, usize::MAX, 0)?;
        let mut groups: BTreeMap<String, AlbumGroup> = BTreeMap::new();
        for track in tracks {
            let album_artist = if track.album_artist.is_empty() {
                track.artist.clone()
            } else {
                track.album_artist.clone()
            };
            let key = format!("{}|{}", album_artist, track.album);
            let group = groups.entry(key.clone()).or_insert_with(|| AlbumGroup {
                key,
                album: track.album.clone(),
                album_artist,
                year: track.year,
                cover: None,
                track_ids: Vec::new(),
            });
            if group.cover.is_none() {
                group.cover = track.album_art.as_deref().map(metadata::cover_data_uri);
            }
            if group.year.is_none() {
                group.year = track.year;
            }
            group.track_ids.push(track.id);
        }
        Ok(groups.into_values().collect())
    }

    pub fn list_artists(&self, user_id: &str) -> Result<Vec<ArtistGroup>, CatalogError> {
        let albums = self.list_albums(user_id)?;
        let mut groups: BTreeMap<String, ArtistGroup> = BTreeMap::new();
        for album in albums {
            let group = groups
                .entry(album.album_artist.to_lowercase())
                .or_insert_with(|| ArtistGroup {
                    name: album.album_artist.clone(),
                    album_count: 0,
                    track_count: 0,
                });
            group.album_count += 1;
            group.track_count += album.track_ids.len();
        }
        Ok(groups.into_values().collect())
    }

    pub fn get_album(&self, user_id: &str, key: &str) -> Result<Option<AlbumGroup>, CatalogError> {
        Ok(self
            .list_albums(user_id)?
            .into_iter()
            .find(|album| album.key == key))
    }

    /// Artist summary plus its albums. Names match case-insensitively.
    pub fn get_artist(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Option<ArtistDetail>, CatalogError> {
        let wanted = name.to_lowercase();
        let albums: Vec<AlbumGroup> = self
            .list_albums(user_id)?
            .into_iter()
            .filter(|album| album.album_artist.to_lowercase() == wanted)
            .collect();
        let Some(first) = albums.first() else {
            return Ok(None);
        };
        Ok(Some(ArtistDetail {
            name: first.album_artist.clone(),
            track_count: albums.iter().map(|album| album.track_ids.len()).sum(),
            albums,
        }))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtistDetail {
    pub name: String,
    pub track_count: usize,
    pub albums: Vec<AlbumGroup>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlbumGroup {
    pub key: String,
    pub album: String,
    pub album_artist: String,
    pub year: Option<i32>,
    pub cover: Option<String>,
    pub track_ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtistGroup {
    pub name: String,
    pub album_count: usize,
    pub track_count: usize,
}

#[derive(Debug)]
pub enum CatalogError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    KeyParse(String),
    NotFound(String),
    RootMissing(PathBuf),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(err) => write!(f, "io error: {}", err),
            CatalogError::Redb(err) => write!(f, "db error: {}", err),
            CatalogError::Bincode(err) => write!(f, "bincode error: {}", err),
            CatalogError::KeyParse(value) => write!(f, "key parse error: {}", value),
            CatalogError::NotFound(what) => write!(f, "{} not found", what),
            CatalogError::RootMissing(path) => {
                write!(f, "media folder not found: {}", path.display())
            }
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io(err)
    }
}

impl From<redb::Error> for CatalogError {
    fn from(err: redb::Error) -> Self {
        CatalogError::Redb(err)
    }
}

impl From<DatabaseError> for CatalogError {
    fn from(err: DatabaseError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<TableError> for CatalogError {
    fn from(err: TableError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<TransactionError> for CatalogError {
    fn from(err: TransactionError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<StorageError> for CatalogError {
    fn from(err: StorageError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<CommitError> for CatalogError {
    fn from(err: CommitError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for CatalogError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        CatalogError::Bincode(err)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, CatalogError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, CatalogError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CatalogError> {
    Ok(bincode::deserialize(bytes)?)
}

fn decode_id(bytes: &[u8]) -> Result<String, CatalogError> {
    std::str::from_utf8(bytes)
        .map(|value| value.to_string())
        .map_err(|_| CatalogError::KeyParse(String::from_utf8_lossy(bytes).to_string()))
}

fn join_key(parts: &[&str]) -> String {
    let mut out = String::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            out.push(KEY_SEP);
        }
        out.push_str(part);
    }
    out
}

fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.to_string();
    end.push('\u{10ffff}');
    end
}

fn media_kind_prefix(user_id: &str, kind: MediaKind) -> String {
    prefix_key(&join_key(&[user_id, kind.as_str()]))
}

fn media_matches(media: &MediaEntry, search: &str) -> bool {
    [&media.title, &media.artist, &media.album, &media.path]
        .iter()
        .any(|field| field.to_lowercase().contains(search))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
fn test_catalog() -> (tempfile::TempDir, Catalog) {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
    (dir, catalog)
}
