//! C2: manifest parser.
//!
//! Parsing itself is delegated to `m3u8-rs`; this module is responsible for the
//! policy layer the spec calls out: rejecting master/live playlists, resolving
//! relative segment URIs against the playlist's base URL, and deriving implicit
//! AES-128 IVs from the media sequence number when the playlist omits one.

use m3u8_rs::{Key, KeyMethod, MediaSegment, Playlist};
use url::Url;

use crate::error::{EngineError, Result};

/// A segment's decryption directive, resolved to an absolute key URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRef {
    pub uri: String,
}

/// One playlist entry. Immutable once parsed (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub index: u32,
    pub url: String,
    pub duration: OrderedDuration,
    pub key: Option<KeyRef>,
    pub iv: [u8; 16],
}

/// `f32` duration wrapped so descriptors can derive `Eq` for test assertions;
/// the spec only ever compares durations for equality in fixtures, never orders them.
#[derive(Debug, Clone, Copy)]
pub struct OrderedDuration(pub f32);

impl PartialEq for OrderedDuration {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}
impl Eq for OrderedDuration {}

/// Parse `playlist_text` (fetched from `manifest_url`) into an ordered list of
/// segment descriptors.
///
/// Fails with [`EngineError::MasterPlaylistNotSupported`] if the text is a
/// master playlist, and [`EngineError::LivePlaylistNotSupported`] if it lacks
/// `#EXT-X-ENDLIST`.
pub fn parse(playlist_text: &str, manifest_url: &str) -> Result<Vec<SegmentDescriptor>> {
    let base = Url::parse(manifest_url)
        .map_err(|e| EngineError::MalformedPlaylist(format!("invalid manifest URL: {e}")))?;

    let playlist = match m3u8_rs::parse_playlist_res(playlist_text.as_bytes()) {
        Ok(Playlist::MediaPlaylist(pl)) => pl,
        Ok(Playlist::MasterPlaylist(_)) => return Err(EngineError::MasterPlaylistNotSupported),
        Err(e) => return Err(EngineError::MalformedPlaylist(e.to_string())),
    };

    if !playlist.end_list {
        return Err(EngineError::LivePlaylistNotSupported);
    }

    let mut descriptors = Vec::with_capacity(playlist.segments.len());
    for (pos, segment) in playlist.segments.iter().enumerate() {
        let index = u32::try_from(pos)
            .map_err(|_| EngineError::MalformedPlaylist("playlist has too many segments".into()))?;
        let media_sequence = playlist.media_sequence + pos as u64;
        descriptors.push(resolve_segment(segment, &base, index, media_sequence)?);
    }

    Ok(descriptors)
}

fn resolve_segment(
    segment: &MediaSegment,
    base: &Url,
    index: u32,
    media_sequence: u64,
) -> Result<SegmentDescriptor> {
    if segment.duration.is_nan() {
        return Err(EngineError::MalformedPlaylist(format!(
            "segment {index} has an unparseable #EXTINF duration"
        )));
    }

    let url = base
        .join(&segment.uri)
        .map_err(|e| {
            EngineError::MalformedPlaylist(format!(
                "segment {index} has an unresolvable URI '{}': {e}",
                segment.uri
            ))
        })?
        .to_string();

    let (key, iv) = match &segment.key {
        None => (None, [0u8; 16]),
        Some(key) => resolve_key(key, base, index, media_sequence)?,
    };

    Ok(SegmentDescriptor {
        index,
        url,
        duration: OrderedDuration(segment.duration),
        key,
        iv,
    })
}

fn resolve_key(
    key: &Key,
    base: &Url,
    index: u32,
    media_sequence: u64,
) -> Result<(Option<KeyRef>, [u8; 16])> {
    match key.method {
        KeyMethod::None => Ok((None, [0u8; 16])),
        KeyMethod::AES128 => {
            let uri = key.uri.as_deref().ok_or_else(|| {
                EngineError::MalformedPlaylist(format!(
                    "segment {index}: EXT-X-KEY with METHOD=AES-128 is missing URI"
                ))
            })?;
            let absolute_uri = base
                .join(uri)
                .map_err(|e| {
                    EngineError::MalformedPlaylist(format!(
                        "segment {index}: unresolvable key URI '{uri}': {e}"
                    ))
                })?
                .to_string();

            let iv = match &key.iv {
                Some(iv_hex) => parse_explicit_iv(iv_hex, index)?,
                None => media_sequence_iv(media_sequence),
            };

            Ok((Some(KeyRef { uri: absolute_uri }), iv))
        }
        other => Err(EngineError::MalformedPlaylist(format!(
            "segment {index}: unsupported key method {other:?}"
        ))),
    }
}

/// §4.2: "the implicit IV is the 16-byte big-endian media sequence number".
fn media_sequence_iv(media_sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
    iv
}

fn parse_explicit_iv(iv_hex: &str, index: u32) -> Result<[u8; 16]> {
    let trimmed = iv_hex.trim_start_matches("0x").trim_start_matches("0X");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(trimmed, &mut iv).map_err(|e| {
        EngineError::MalformedPlaylist(format!("segment {index}: invalid IV '{iv_hex}': {e}"))
    })?;
    Ok(iv)
}
