//! Small in-memory media files for tests.

/// 8 kHz mono 8-bit PCM WAV with an optional RIFF INFO block.
pub fn wav_bytes(
    title: Option<&str>,
    artist: Option<&str>,
    album: Option<&str>,
    seconds: u32,
) -> Vec<u8> {
    let mut items: Vec<(&[u8; 4], &[u8])> = Vec::new();
    for (id, value) in [(b"INAM", title), (b"IART", artist), (b"IPRD", album)] {
        if let Some(value) = value {
            items.push((id, value.as_bytes()));
        }
    }
    wav_bytes_with_info(&items, seconds)
}

/// Same layout as [`wav_bytes`], with INFO values written as given. Lets tests
/// store bytes that are not UTF-8.
pub fn wav_bytes_with_info(items: &[(&[u8; 4], &[u8])], seconds: u32) -> Vec<u8> {
    const SAMPLE_RATE: u32 = 8000;

    let mut info = Vec::new();
    for (id, value) in items {
        let mut data = value.to_vec();
        data.push(0);
        info.extend_from_slice(*id);
        info.extend_from_slice(&(data.len() as u32).to_le_bytes());
        info.extend_from_slice(&data);
        if data.len() % 2 == 1 {
            info.push(0);
        }
    }

    let mut body = Vec::new();
    body.extend_from_slice(b"WAVE");
    body.extend_from_slice(b"fmt ");
    body.extend_from_slice(&16u32.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    body.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&8u16.to_le_bytes());
    if !info.is_empty() {
        body.extend_from_slice(b"LIST");
        body.extend_from_slice(&((info.len() + 4) as u32).to_le_bytes());
        body.extend_from_slice(b"INFO");
        body.extend_from_slice(&info);
    }
    let samples = (SAMPLE_RATE * seconds) as usize;
    body.extend_from_slice(b"data");
    body.extend_from_slice(&(samples as u32).to_le_bytes());
    body.extend(std::iter::repeat(0x80u8).take(samples));

    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}
