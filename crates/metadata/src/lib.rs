use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lofty::config::{ParseOptions, ParsingMode};
use lofty::error::LoftyError;
use lofty::file::{FileType, TaggedFile};
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::{ItemValue, Tag, TagType};
use serde_json::{json, Map, Value};
use tracing::debug;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
mod raw;

pub const INVALID_STRING: &str = "**invalid string**";
pub const BINARY_DATA: &str = "**binary data**";

/// Canonical tag fields, resolved once per file.
#[derive(Debug, Default, Clone)]
pub struct TagSet {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album_artist: String,
    pub album_artist_sources: AlbumArtistSources,
    pub album: Option<String>,
    pub track_number: Option<u32>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    pub duration_secs: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    pub codec: Option<String>,
    pub cover: Option<CoverArt>,
    pub raw_json: String,
}

/// Album artist as found in each tag dialect. `resolve` applies the precedence
/// band, generic, QuickTime, ASF.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AlbumArtistSources {
    pub id3v2_band: Option<String>,
    pub generic: Option<String>,
    pub quicktime: Option<String>,
    pub asf: Option<String>,
}

impl AlbumArtistSources {
    pub fn resolve(&self) -> String {
        [&self.id3v2_band, &self.generic, &self.quicktime, &self.asf]
            .into_iter()
            .flatten()
            .find(|value| !value.is_empty())
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct CoverArt {
    pub data: Vec<u8>,
    pub mime: String,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
    Unsupported(String),
    TooLarge(u64),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
            MetadataError::Unsupported(hint) => write!(f, "unsupported container ({})", hint),
            MetadataError::TooLarge(limit) => {
                write!(f, "stream exceeds scratch limit of {} bytes", limit)
            }
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Reads tags from a file on disk, using its extension as the MIME hint.
pub fn extract_path(path: &Path, scratch_limit: u64) -> Result<TagSet, MetadataError> {
    let mut file = File::open(path)?;
    let hint = mime_guess::from_path(path).first_raw();
    extract(&mut file, hint, scratch_limit)
}

/// Spools `reader` into an anonymous scratch file (removed on drop) and parses it.
/// The MIME hint selects a parser when content probing cannot.
pub fn extract<R: Read>(
    reader: &mut R,
    hint_mime: Option<&str>,
    scratch_limit: u64,
) -> Result<TagSet, MetadataError> {
    let mut scratch = tempfile::tempfile()?;
    let copied = io::copy(&mut reader.take(scratch_limit.saturating_add(1)), &mut scratch)?;
    if copied > scratch_limit {
        return Err(MetadataError::TooLarge(scratch_limit));
    }
    scratch.seek(SeekFrom::Start(0))?;

    let options = ParseOptions::new().parsing_mode(ParsingMode::Relaxed);
    let probe = Probe::new(BufReader::new(scratch.try_clone()?))
        .options(options)
        .guess_file_type()?;
    let file_type = match probe.file_type().or_else(|| hint_mime.and_then(file_type_from_mime)) {
        Some(file_type) => file_type,
        None => {
            return Err(MetadataError::Unsupported(
                hint_mime.unwrap_or("unknown").to_string(),
            ))
        }
    };

    let mut info = match probe.set_file_type(file_type).read() {
        Ok(tagged_file) => build_tag_set(&tagged_file),
        Err(err) => {
            debug!("Tag read failed ({}); retrying without tags", err);
            scratch.seek(SeekFrom::Start(0))?;
            let properties_only = ParseOptions::new()
                .parsing_mode(ParsingMode::Relaxed)
                .read_tags(false);
            match Probe::with_file_type(BufReader::new(scratch.try_clone()?), file_type)
                .options(properties_only)
                .read()
            {
                Ok(tagged_file) => build_tag_set(&tagged_file),
                Err(_) => TagSet {
                    codec: Some(codec_label(file_type)),
                    ..TagSet::default()
                },
            }
        }
    };

    let raw = match file_type {
        FileType::Wav => raw::read_riff_info(&mut scratch),
        FileType::Mpeg | FileType::Aiff => raw::read_id3v2_text(&mut scratch),
        _ => Ok(raw::RawText::default()),
    };
    match raw {
        Ok(raw) => fill_missing(&mut info, raw),
        Err(err) => debug!("Raw tag scan failed: {}", err),
    }
    Ok(info)
}

/// Fills fields lofty left empty from directly read tag text.
fn fill_missing(info: &mut TagSet, raw: raw::RawText) {
    if info.title.is_none() {
        info.title = raw.title;
    }
    if info.album.is_none() {
        info.album = raw.album;
    }
    if info.genre.is_none() {
        info.genre = raw.genre;
    }
    if info.track_number.is_none() {
        info.track_number = raw.track.as_deref().and_then(parse_u32);
    }
    if info.year.is_none() {
        info.year = raw.year.as_deref().and_then(parse_year);
    }
    if info.album_artist.is_empty() {
        if let Some(band) = raw.album_artist {
            info.album_artist_sources.id3v2_band = Some(band);
            info.album_artist = info.album_artist_sources.resolve();
        }
    }
    if info.artist.is_none() {
        info.artist = raw.artist.or_else(|| {
            Some(info.album_artist.clone()).filter(|value| !value.is_empty())
        });
    }
}

fn file_type_from_mime(mime: &str) -> Option<FileType> {
    let extensions = mime_guess::get_mime_extensions_str(mime)?;
    extensions.iter().find_map(|ext| FileType::from_ext(ext))
}

fn build_tag_set(tagged_file: &TaggedFile) -> TagSet {
    let properties = tagged_file.properties();
    let mut info = TagSet::default();

    let duration_secs = properties.duration().as_secs();
    if duration_secs > 0 {
        info.duration_secs = Some(duration_secs.min(u64::from(u32::MAX)) as u32);
    }
    info.bitrate_kbps = properties.audio_bitrate().or(properties.overall_bitrate());
    info.codec = Some(codec_label(tagged_file.file_type()));

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = text_item(tag, &ItemKey::TrackTitle);
        info.album = text_item(tag, &ItemKey::AlbumTitle);
        info.artist = text_item(tag, &ItemKey::TrackArtist);
        info.track_number = tag.get_string(&ItemKey::TrackNumber).and_then(parse_u32);
        info.year = tag
            .get_string(&ItemKey::Year)
            .or_else(|| tag.get_string(&ItemKey::RecordingDate))
            .and_then(parse_year);
        info.genre = text_item(tag, &ItemKey::Genre);
    }

    for tag in tagged_file.tags() {
        collect_album_artist(tag, &mut info.album_artist_sources);
        if info.cover.is_none() {
            if let Some(picture) = pick_picture(tag.pictures()) {
                let data = picture.data().to_vec();
                let mime = cover_mime(&data).to_string();
                info.cover = Some(CoverArt { data, mime });
            }
        }
    }
    info.album_artist = info.album_artist_sources.resolve();
    if info.artist.is_none() && !info.album_artist.is_empty() {
        info.artist = Some(info.album_artist.clone());
    }

    info.raw_json = raw_tag_json(tagged_file).to_string();
    info
}

fn collect_album_artist(tag: &Tag, sources: &mut AlbumArtistSources) {
    let generic = tag.get_string(&ItemKey::AlbumArtist).map(sanitize_str);
    match tag.tag_type() {
        TagType::Id3v2 => {
            if sources.id3v2_band.is_none() {
                sources.id3v2_band = generic;
            }
            if sources.generic.is_none() {
                sources.generic = unknown_item(tag, &["ALBUM ARTIST", "ALBUMARTIST"]);
            }
        }
        TagType::Mp4Ilst => {
            if sources.quicktime.is_none() {
                sources.quicktime = generic;
            }
        }
        _ => {
            if sources.generic.is_none() {
                sources.generic = generic;
            }
        }
    }
    if sources.asf.is_none() {
        sources.asf = unknown_item(tag, &["WM/AlbumArtist"]);
    }
}

fn unknown_item(tag: &Tag, names: &[&str]) -> Option<String> {
    tag.items().find_map(|item| match (item.key(), item.value()) {
        (ItemKey::Unknown(key), ItemValue::Text(value))
            if names.iter().any(|name| key.eq_ignore_ascii_case(name)) =>
        {
            Some(sanitize_str(value))
        }
        _ => None,
    })
}

fn text_item(tag: &Tag, key: &ItemKey) -> Option<String> {
    tag.get_string(key)
        .map(sanitize_str)
        .filter(|value| !value.is_empty())
}

fn codec_label(file_type: FileType) -> String {
    match file_type {
        FileType::Mpeg => "mp3".to_string(),
        FileType::Mp4 => "mp4".to_string(),
        other => format!("{:?}", other).to_ascii_lowercase(),
    }
}

/// Decodes tag text. Bytes that are not UTF-8 are read as Latin-1; anything still
/// carrying control characters becomes [`INVALID_STRING`].
pub fn sanitize_text(bytes: &[u8]) -> String {
    let decoded = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    };
    finish_text(decoded)
}

fn sanitize_str(value: &str) -> String {
    finish_text(value.to_string())
}

pub(crate) fn finish_text(value: String) -> String {
    let trimmed = value.trim_end_matches('\0').trim();
    let broken = trimmed.chars().any(|ch| {
        ch == '\u{FFFD}' || (ch.is_control() && !matches!(ch, '\t' | '\n' | '\r'))
    });
    if broken {
        INVALID_STRING.to_string()
    } else {
        trimmed.to_string()
    }
}

fn raw_tag_json(tagged_file: &TaggedFile) -> Value {
    let properties = tagged_file.properties();
    let mut tags = Vec::new();
    let mut pictures = Vec::new();
    for tag in tagged_file.tags() {
        let mut items = Map::new();
        for item in tag.items() {
            let key = match item.key() {
                ItemKey::Unknown(name) => name.clone(),
                other => format!("{:?}", other),
            };
            let value = match item.value() {
                ItemValue::Text(text) | ItemValue::Locator(text) => sanitize_str(text),
                ItemValue::Binary(_) => BINARY_DATA.to_string(),
            };
            items.insert(key, Value::String(value));
        }
        tags.push(json!({
            "type": format!("{:?}", tag.tag_type()),
            "items": items,
        }));
        for picture in tag.pictures() {
            pictures.push(json!({
                "type": format!("{:?}", picture.pic_type()),
                "mime": cover_mime(picture.data()),
                "size": picture.data().len(),
                "data": BINARY_DATA,
            }));
        }
    }
    json!({
        "format": format!("{:?}", tagged_file.file_type()),
        "properties": {
            "duration_ms": properties.duration().as_millis() as u64,
            "bitrate": properties.audio_bitrate(),
            "sample_rate": properties.sample_rate(),
            "channels": properties.channels(),
        },
        "tags": tags,
        "pictures": pictures,
    })
}

fn parse_u32(text: &str) -> Option<u32> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn pick_picture(pictures: &[Picture]) -> Option<&Picture> {
    for picture in pictures {
        if picture.pic_type() == PictureType::CoverFront {
            return Some(picture);
        }
    }
    pictures.first()
}

pub fn cover_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        "image/png"
    } else if bytes.starts_with(b"GIF") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

pub fn cover_data_uri(bytes: &[u8]) -> String {
    format!("data:{};base64,{}", cover_mime(bytes), BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{wav_bytes, wav_bytes_with_info};
    use std::io::Cursor;

    #[test]
    fn extracts_riff_info_tags() {
        let bytes = wav_bytes(Some("Intro"), Some("Band"), Some("First Album"), 2);
        let tags = extract(&mut Cursor::new(bytes), Some("audio/wav"), 1 << 20).unwrap();
        assert_eq!(tags.title.as_deref(), Some("Intro"));
        assert_eq!(tags.artist.as_deref(), Some("Band"));
        assert_eq!(tags.album.as_deref(), Some("First Album"));
        assert_eq!(tags.duration_secs, Some(2));
        assert_eq!(tags.codec.as_deref(), Some("wav"));
        let raw: Value = serde_json::from_str(&tags.raw_json).unwrap();
        assert_eq!(raw["format"], "Wav");
    }

    #[test]
    fn recovers_latin1_info_values() {
        let bytes = wav_bytes_with_info(
            &[
                (b"INAM", &b"Caf\xE9"[..]),
                (b"IART", &b"Band"[..]),
                (b"IPRD", &b"First Album"[..]),
            ],
            1,
        );
        let tags = extract(&mut Cursor::new(bytes), Some("audio/wav"), 1 << 20).unwrap();
        assert_eq!(tags.title.as_deref(), Some("Café"));
        assert_eq!(tags.artist.as_deref(), Some("Band"));
        assert_eq!(tags.album.as_deref(), Some("First Album"));
        assert_eq!(tags.duration_secs, Some(1));
        assert_eq!(tags.codec.as_deref(), Some("wav"));
    }

    #[test]
    fn rejects_streams_over_limit() {
        let bytes = wav_bytes(None, None, None, 1);
        let err = extract(&mut Cursor::new(bytes), None, 64).unwrap_err();
        assert!(matches!(err, MetadataError::TooLarge(64)));
    }

    #[test]
    fn unknown_container_is_unsupported() {
        let bytes = vec![0x42u8; 512];
        let err = extract(&mut Cursor::new(bytes), Some("video/x-matroska"), 1 << 20).unwrap_err();
        assert!(matches!(err, MetadataError::Unsupported(_)));
    }

    #[test]
    fn album_artist_precedence() {
        let mut sources = AlbumArtistSources {
            id3v2_band: None,
            generic: Some("Generic".to_string()),
            quicktime: Some("QT".to_string()),
            asf: Some("ASF".to_string()),
        };
        assert_eq!(sources.resolve(), "Generic");
        sources.id3v2_band = Some("Band".to_string());
        assert_eq!(sources.resolve(), "Band");
        assert_eq!(AlbumArtistSources::default().resolve(), "");
        let asf_only = AlbumArtistSources {
            asf: Some("ASF".to_string()),
            ..Default::default()
        };
        assert_eq!(asf_only.resolve(), "ASF");
    }

    #[test]
    fn sanitizes_latin1_and_garbage() {
        assert_eq!(sanitize_text("Beyoncé".as_bytes()), "Beyoncé");
        assert_eq!(sanitize_text(&[0x43, 0x61, 0x66, 0xE9]), "Café");
        assert_eq!(sanitize_text(&[0x41, 0x01, 0x42]), INVALID_STRING);
        assert_eq!(sanitize_text(b"Title\0\0"), "Title");
    }

    #[test]
    fn cover_helpers_sniff_format() {
        assert_eq!(cover_mime(&[0x89, 0x50, 0x4E, 0x47, 0x0D]), "image/png");
        assert_eq!(cover_mime(b"GIF89a"), "image/gif");
        assert_eq!(cover_mime(&[0xFF, 0xD8, 0xFF]), "image/jpeg");
        assert_eq!(cover_data_uri(b"GIF89a"), "data:image/gif;base64,R0lGODlh");
    }

    #[test]
    fn parses_numbers_loosely() {
        assert_eq!(parse_u32("3/12"), Some(3));
        assert_eq!(parse_year("2019-04-01"), Some(2019));
        assert_eq!(parse_year("unknown"), None);
    }
}
