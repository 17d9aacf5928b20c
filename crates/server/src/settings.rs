use std::sync::Arc;

use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition,
    TableError, TransactionError,
};
use serde::{Deserialize, Serialize};

const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("user_settings");
const KEY_SEP: char = '\x1f';

pub const MUSIC_FOLDER_PATH: &str = "music_folder_path";
pub const VIDEO_FOLDER_PATH: &str = "video_folder_path";
pub const DOWNLOAD_PODCAST_EPISODES: &str = "download_podcast_episodes";
pub const PODCAST_DOWNLOAD_PATH: &str = "podcast_download_path";

pub fn default_value(name: &str) -> Option<&'static str> {
    match name {
        MUSIC_FOLDER_PATH => Some("Music"),
        VIDEO_FOLDER_PATH => Some("Videos"),
        DOWNLOAD_PODCAST_EPISODES => Some("false"),
        PODCAST_DOWNLOAD_PATH => Some("Podcasts"),
        _ => None,
    }
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredSetting {
    value: String,
    updated: u64,
}

/// Per-user key/value settings, stored next to the catalog tables.
#[derive(Clone)]
pub struct SettingsStore {
    db: Arc<Database>,
}

impl SettingsStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn init_tables(&self) -> Result<(), SettingsError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Stored value, or the built-in default for known names.
    pub fn get(&self, user_id: &str, name: &str) -> Result<Option<String>, SettingsError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(SETTINGS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                return Ok(default_value(name).map(str::to_string))
            }
            Err(err) => return Err(err.into()),
        };
        let key = settings_key(user_id, name);
        let stored: Option<StoredSetting> = match table.get(key.as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(stored
            .map(|stored| stored.value)
            .or_else(|| default_value(name).map(str::to_string)))
    }

    pub fn get_or_default(&self, user_id: &str, name: &str) -> String {
        match self.get(user_id, name) {
            Ok(Some(value)) => value,
            Ok(None) => String::new(),
            Err(err) => {
                tracing::warn!("Failed to read setting {} for {}: {}", name, user_id, err);
                default_value(name).unwrap_or_default().to_string()
            }
        }
    }

    pub fn get_bool(&self, user_id: &str, name: &str) -> bool {
        parse_bool(&self.get_or_default(user_id, name))
    }

    pub fn set(&self, user_id: &str, name: &str, value: &str) -> Result<(), SettingsError> {
        let stored = StoredSetting {
            value: value.to_string(),
            updated: now_secs(),
        };
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let key = settings_key(user_id, name);
            let bytes = encode_value(&stored)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn settings_key(user_id: &str, name: &str) -> String {
    format!("{}{}{}", user_id, KEY_SEP, name)
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug)]
pub enum SettingsError {
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
}

impl From<redb::Error> for SettingsError {
    fn from(err: redb::Error) -> Self {
        SettingsError::Redb(err)
    }
}

impl From<DatabaseError> for SettingsError {
    fn from(err: DatabaseError) -> Self {
        SettingsError::Redb(err.into())
    }
}

impl From<TableError> for SettingsError {
    fn from(err: TableError) -> Self {
        SettingsError::Redb(err.into())
    }
}

impl From<TransactionError> for SettingsError {
    fn from(err: TransactionError) -> Self {
        SettingsError::Redb(err.into())
    }
}

impl From<StorageError> for SettingsError {
    fn from(err: StorageError) -> Self {
        SettingsError::Redb(err.into())
    }
}

impl From<CommitError> for SettingsError {
    fn from(err: CommitError) -> Self {
        SettingsError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for SettingsError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        SettingsError::Bincode(err)
    }
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Redb(err) => write!(f, "redb error: {}", err),
            SettingsError::Bincode(err) => write!(f, "bincode error: {}", err),
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Redb(err) => Some(err),
            SettingsError::Bincode(err) => Some(err),
        }
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, SettingsError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, SettingsError> {
    Ok(bincode::deserialize(bytes)?)
}
