use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const KEY_SEP: char = '\x1f';

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Music,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Music => "music",
            MediaKind::Video => "video",
        }
    }

    /// MIME top-level type a file must carry to be cataloged under this kind.
    pub fn mime_prefix(&self) -> &'static str {
        match self {
            MediaKind::Music => "audio/",
            MediaKind::Video => "video/",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "music" | "audio" => Ok(MediaKind::Music),
            "video" | "videos" => Ok(MediaKind::Video),
            other => Err(format!("unknown media kind: {}", other)),
        }
    }
}

/// One cataloged file, unique per (user, path).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MediaEntry {
    pub id: String,
    pub user_id: String,
    pub kind: MediaKind,
    pub path: String,
    pub title: String,
    pub artist: String,
    pub album_artist: String,
    pub album: String,
    pub track_number: Option<u32>,
    pub duration_secs: Option<u32>,
    pub album_art: Option<Vec<u8>>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub bitrate_kbps: Option<u32>,
    pub codec: Option<String>,
    pub mtime: u64,
    pub file_size: u64,
    pub raw_tags: Option<String>,
    pub favorited: bool,
    pub scanned_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PodcastSubscription {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub external_id: Option<String>,
    pub title: String,
    pub author: String,
    pub description: String,
    pub link: String,
    pub image: Option<String>,
    pub subscribed: bool,
    pub updated: u64,
    pub metadata_fetched: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PodcastEpisode {
    pub id: String,
    pub user_id: String,
    pub subscription_id: String,
    pub guid: String,
    pub title: String,
    pub pub_date: Option<i64>,
    pub duration_secs: Option<u64>,
    pub media_url: Option<String>,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayAction {
    Play,
    Pause,
    Resume,
    Complete,
}

impl PlayAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayAction::Play => "play",
            PlayAction::Pause => "pause",
            PlayAction::Resume => "resume",
            PlayAction::Complete => "complete",
        }
    }
}

impl fmt::Display for PlayAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlayAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "play" => Ok(PlayAction::Play),
            "pause" => Ok(PlayAction::Pause),
            "resume" => Ok(PlayAction::Resume),
            "complete" => Ok(PlayAction::Complete),
            other => Err(format!("invalid action: {}", other)),
        }
    }
}

/// Append-only playback event. The latest row per (user, guid) is the current position.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EpisodePlay {
    pub user_id: String,
    pub episode_id: String,
    pub guid: String,
    pub action: PlayAction,
    pub timestamp: u64,
    pub position: Option<u64>,
    pub total: Option<u64>,
    pub device: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RadioStation {
    pub id: String,
    pub user_id: String,
    pub remote_uuid: String,
    pub name: String,
    pub stream_url: String,
    pub homepage: String,
    pub favicon: Option<Vec<u8>>,
    pub country: String,
    pub state: String,
    pub language: String,
    pub bitrate: Option<u32>,
    pub codec: String,
    pub tags: String,
    pub favorited: bool,
    pub raw: String,
    pub last_updated: u64,
}

/// Channel-level fields read from a podcast feed.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedMetadata {
    pub title: String,
    pub author: String,
    pub description: String,
    pub link: String,
    pub image_url: Option<String>,
}

/// One feed item. Items without a GUID never make it this far.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedEpisode {
    pub guid: String,
    pub title: String,
    pub pub_date: Option<i64>,
    pub duration_secs: Option<u64>,
    pub media_url: Option<String>,
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExternalSubscription {
    pub external_id: String,
    pub url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExternalEpisodeAction {
    pub guid: String,
    pub action: PlayAction,
    pub timestamp: u64,
    pub position: Option<u64>,
    pub total: Option<u64>,
    pub device: Option<String>,
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Id derived from a natural key, so two rows with the same key always collide.
pub fn natural_id(parts: &[&str]) -> String {
    let mut key = String::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            key.push(KEY_SEP);
        }
        key.push_str(part);
    }
    stable_id(&key)
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

pub fn join_relpath(root: &Path, relpath: &str) -> PathBuf {
    let mut out = PathBuf::from(root);
    for part in relpath.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            continue;
        }
        out.push(part);
    }
    out
}

fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("Artist/Album/Track.mp3");
        let second = stable_id("Artist/Album/Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("Artist/Album/Track2.mp3"));
    }

    #[test]
    fn natural_id_separates_parts() {
        assert_eq!(natural_id(&["alice", "a/b.mp3"]), natural_id(&["alice", "a/b.mp3"]));
        assert_ne!(natural_id(&["ab", "c"]), natural_id(&["a", "bc"]));
    }

    #[test]
    fn join_relpath_ignores_parent_segments() {
        let root = Path::new("/srv/users/alice");
        let joined = join_relpath(root, "../bob/Music/a.mp3");
        assert_eq!(joined, Path::new("/srv/users/alice/bob/Music/a.mp3"));
    }

    #[test]
    fn play_action_rejects_unknown() {
        assert_eq!("Play".parse::<PlayAction>(), Ok(PlayAction::Play));
        assert_eq!("complete".parse::<PlayAction>(), Ok(PlayAction::Complete));
        assert!("stop".parse::<PlayAction>().is_err());
    }

    #[test]
    fn relpath_uses_forward_slashes() {
        let root = Path::new("/music");
        let path = Path::new("/music/Artist/Album/01.flac");
        assert_eq!(relpath_from(root, path).as_deref(), Some("Artist/Album/01.flac"));
    }
}
