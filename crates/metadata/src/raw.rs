//! Direct reads of RIFF INFO and ID3v2 text fields. Used to recover values
//! lofty refuses, such as INFO strings that are not UTF-8.

use std::io::{self, Read, Seek, SeekFrom};

use crate::{finish_text, sanitize_text};

const MAX_INFO_BYTES: u32 = 1024 * 1024;
const MAX_ID3_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct RawText {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub track: Option<String>,
    pub year: Option<String>,
}

impl RawText {
    fn set(&mut self, field: Field, value: String) {
        if value.is_empty() {
            return;
        }
        let slot = match field {
            Field::Title => &mut self.title,
            Field::Artist => &mut self.artist,
            Field::Album => &mut self.album,
            Field::AlbumArtist => &mut self.album_artist,
            Field::Genre => &mut self.genre,
            Field::Track => &mut self.track,
            Field::Year => &mut self.year,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }
}

#[derive(Clone, Copy)]
enum Field {
    Title,
    Artist,
    Album,
    AlbumArtist,
    Genre,
    Track,
    Year,
}

fn info_field(id: &[u8]) -> Option<Field> {
    match id {
        b"INAM" => Some(Field::Title),
        b"IART" => Some(Field::Artist),
        b"IPRD" => Some(Field::Album),
        b"IGNR" => Some(Field::Genre),
        b"ITRK" | b"IPRT" => Some(Field::Track),
        b"ICRD" => Some(Field::Year),
        _ => None,
    }
}

fn id3_field(id: &[u8]) -> Option<Field> {
    match id {
        b"TIT2" => Some(Field::Title),
        b"TPE1" => Some(Field::Artist),
        b"TALB" => Some(Field::Album),
        b"TPE2" => Some(Field::AlbumArtist),
        b"TCON" => Some(Field::Genre),
        b"TRCK" => Some(Field::Track),
        b"TDRC" | b"TYER" => Some(Field::Year),
        _ => None,
    }
}

/// Text items of every `LIST`/`INFO` chunk in a RIFF/WAVE stream.
pub(crate) fn read_riff_info<R: Read + Seek>(reader: &mut R) -> io::Result<RawText> {
    let mut out = RawText::default();
    reader.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; 12];
    if reader.read_exact(&mut header).is_err()
        || &header[0..4] != b"RIFF"
        || &header[8..12] != b"WAVE"
    {
        return Ok(out);
    }

    loop {
        let mut chunk = [0u8; 8];
        if reader.read_exact(&mut chunk).is_err() {
            break;
        }
        let size = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        let padded = i64::from(size) + i64::from(size & 1);
        if &chunk[0..4] != b"LIST" || size < 4 || size > MAX_INFO_BYTES {
            reader.seek(SeekFrom::Current(padded))?;
            continue;
        }
        let mut body = vec![0u8; size as usize];
        reader.read_exact(&mut body)?;
        if size & 1 == 1 {
            reader.seek(SeekFrom::Current(1))?;
        }
        if &body[0..4] == b"INFO" {
            parse_info_items(&body[4..], &mut out);
        }
    }
    Ok(out)
}

fn parse_info_items(mut items: &[u8], out: &mut RawText) {
    while items.len() >= 8 {
        let id = &items[0..4];
        let size = u32::from_le_bytes([items[4], items[5], items[6], items[7]]) as usize;
        let end = 8 + size;
        if end > items.len() {
            break;
        }
        if let Some(field) = info_field(id) {
            out.set(field, sanitize_text(first_value(&items[8..end])));
        }
        items = &items[(end + (size & 1)).min(items.len())..];
    }
}

/// Text frames of a leading ID3v2.3/2.4 tag. Unsynchronised tags and frames
/// that are compressed or encrypted are ignored.
pub(crate) fn read_id3v2_text<R: Read + Seek>(reader: &mut R) -> io::Result<RawText> {
    let mut out = RawText::default();
    reader.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; 10];
    if reader.read_exact(&mut header).is_err() || &header[0..3] != b"ID3" {
        return Ok(out);
    }
    let major = header[3];
    let flags = header[5];
    if !(major == 3 || major == 4) || flags & 0x80 != 0 {
        return Ok(out);
    }
    let size = syncsafe(&header[6..10]);
    if size > MAX_ID3_BYTES {
        return Ok(out);
    }
    let mut body = vec![0u8; size as usize];
    reader.read_exact(&mut body)?;

    let mut pos = 0usize;
    if flags & 0x40 != 0 && body.len() >= 4 {
        pos = if major == 4 {
            syncsafe(&body[0..4]) as usize
        } else {
            4 + u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize
        };
    }

    while pos + 10 <= body.len() {
        let frame = &body[pos..pos + 10];
        if frame[0] == 0 {
            break;
        }
        let frame_size = if major == 4 {
            syncsafe(&frame[4..8])
        } else {
            u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]])
        };
        let frame_size = frame_size as usize;
        let start = pos + 10;
        let end = start + frame_size;
        if end > body.len() {
            break;
        }
        if let Some(field) = id3_field(&frame[0..4]) {
            if frame[9] == 0 && frame_size > 1 {
                out.set(field, decode_id3_text(&body[start..end]));
            }
        }
        pos = end;
    }
    Ok(out)
}

fn decode_id3_text(data: &[u8]) -> String {
    let (encoding, text) = (data[0], &data[1..]);
    match encoding {
        1 | 2 => {
            let (big_endian, text) = match text {
                [0xFE, 0xFF, rest @ ..] => (true, rest),
                [0xFF, 0xFE, rest @ ..] => (false, rest),
                _ => (encoding == 2, text),
            };
            let units: Vec<u16> = text
                .chunks_exact(2)
                .map(|pair| {
                    if big_endian {
                        u16::from_be_bytes([pair[0], pair[1]])
                    } else {
                        u16::from_le_bytes([pair[0], pair[1]])
                    }
                })
                .take_while(|unit| *unit != 0)
                .collect();
            finish_text(String::from_utf16_lossy(&units))
        }
        _ => sanitize_text(first_value(text)),
    }
}

fn first_value(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|b| *b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

fn syncsafe(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, b| (acc << 7) | u32::from(b & 0x7F))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::wav_bytes_with_info;
    use std::io::Cursor;

    fn id3_frame(id: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut frame = id.to_vec();
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn reads_latin1_info_values() {
        let bytes = wav_bytes_with_info(&[(b"INAM", &b"Caf\xE9"[..]), (b"IART", &b"Band"[..])], 1);
        let raw = read_riff_info(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(raw.title.as_deref(), Some("Café"));
        assert_eq!(raw.artist.as_deref(), Some("Band"));
        assert_eq!(raw.album, None);
    }

    #[test]
    fn reads_id3v23_text_frames() {
        let mut frames = id3_frame(b"TIT2", b"\x00Caf\xE9");
        frames.extend(id3_frame(b"TPE2", b"\x01\xFF\xFEB\x00a\x00n\x00d\x00"));
        frames.extend(id3_frame(b"TALB", b"\x03Album\x00"));
        let mut tag = b"ID3\x03\x00\x00".to_vec();
        let size = frames.len() as u32;
        tag.extend_from_slice(&[
            ((size >> 21) & 0x7F) as u8,
            ((size >> 14) & 0x7F) as u8,
            ((size >> 7) & 0x7F) as u8,
            (size & 0x7F) as u8,
        ]);
        tag.extend(frames);
        tag.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);

        let raw = read_id3v2_text(&mut Cursor::new(tag)).unwrap();
        assert_eq!(raw.title.as_deref(), Some("Café"));
        assert_eq!(raw.album_artist.as_deref(), Some("Band"));
        assert_eq!(raw.album.as_deref(), Some("Album"));
    }

    #[test]
    fn ignores_other_containers() {
        let raw = read_riff_info(&mut Cursor::new(b"fLaC\0\0\0\0\0\0\0\0".to_vec())).unwrap();
        assert_eq!(raw, RawText::default());
        let raw = read_id3v2_text(&mut Cursor::new(b"short".to_vec())).unwrap();
        assert_eq!(raw, RawText::default());
    }
}
