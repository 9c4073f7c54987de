//! Server voice payloads at the byte level: chunk reassembly and container
//! sniffing. Playback belongs to the host.
//!
//! A chunked payload is laid out as
//! `[id_len: u32 BE][audio id][chunk index: u32 BE][chunk total: u32 BE][data...]`.
//! Anything that does not look like that is a complete clip on its own.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Longest audio id accepted in a chunk header.
pub const MAX_AUDIO_ID_LEN: usize = 100;

const ID_LEN_FIELD: usize = 4;
const CHUNK_INFO_LEN: usize = 8;
const MIN_CHUNKED_LEN: usize = 12;
const ID3_HEADER_LEN: usize = 10;
const MP3_SYNC_SCAN: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("payload too short for a chunk header ({0} bytes)")]
    Truncated(usize),
    #[error("invalid audio id length {0}")]
    BadIdLength(u32),
    #[error("audio id is not valid UTF-8")]
    BadId,
    #[error("chunk {index} out of range for {total} chunk(s)")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("audio {id}: chunk total changed from {expected} to {got}")]
    TotalMismatch { id: String, expected: u32, got: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    /// Headerless PCM, or anything unrecognised.
    Raw,
}

impl AudioFormat {
    pub fn detect(data: &[u8]) -> Self {
        if is_wav(data) {
            Self::Wav
        } else if is_mp3(data) {
            Self::Mp3
        } else {
            Self::Raw
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Raw => "pcm",
        }
    }
}

/// A complete clip, either received whole or reassembled from chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub audio_id: Option<String>,
    pub format: AudioFormat,
    pub data: Vec<u8>,
}

impl AudioClip {
    fn new(audio_id: Option<String>, data: Vec<u8>) -> Self {
        Self {
            audio_id,
            format: AudioFormat::detect(&data),
            data,
        }
    }
}

// ─── Header parsing ──────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub struct AudioChunk<'a> {
    pub audio_id: &'a str,
    pub index: u32,
    pub total: u32,
    pub data: &'a [u8],
}

fn read_u32_be(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_be_bytes)
}

fn is_audio_id_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Whether `data` carries a plausible chunk header: an id of 1 to 100
/// characters drawn from letters, digits and `-_.`, followed by the chunk
/// counters and at least one data byte.
pub fn is_chunked(data: &[u8]) -> bool {
    if data.len() < MIN_CHUNKED_LEN {
        return false;
    }
    let Some(id_len) = read_u32_be(data, 0).map(|n| n as usize) else {
        return false;
    };
    if id_len == 0 || id_len > MAX_AUDIO_ID_LEN || ID_LEN_FIELD + id_len + CHUNK_INFO_LEN >= data.len() {
        return false;
    }
    std::str::from_utf8(&data[ID_LEN_FIELD..ID_LEN_FIELD + id_len])
        .map(|id| id.chars().all(is_audio_id_char))
        .unwrap_or(false)
}

pub fn parse_chunk(data: &[u8]) -> Result<AudioChunk<'_>, AudioError> {
    if data.len() < MIN_CHUNKED_LEN {
        return Err(AudioError::Truncated(data.len()));
    }
    let id_len = read_u32_be(data, 0).ok_or(AudioError::Truncated(data.len()))?;
    let id_end = ID_LEN_FIELD + id_len as usize;
    if id_len == 0 || id_len as usize > MAX_AUDIO_ID_LEN || id_end > data.len() {
        return Err(AudioError::BadIdLength(id_len));
    }
    let audio_id = std::str::from_utf8(&data[ID_LEN_FIELD..id_end]).map_err(|_| AudioError::BadId)?;

    let index = read_u32_be(data, id_end).ok_or(AudioError::Truncated(data.len()))?;
    let total = read_u32_be(data, id_end + 4).ok_or(AudioError::Truncated(data.len()))?;
    if index >= total {
        return Err(AudioError::IndexOutOfRange { index, total });
    }

    Ok(AudioChunk {
        audio_id,
        index,
        total,
        data: &data[id_end + CHUNK_INFO_LEN..],
    })
}

// ─── Reassembly ──────────────────────────────────────────────────────

struct PendingAudio {
    total: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl PendingAudio {
    fn missing(&self) -> Vec<u32> {
        (0..self.total).filter(|i| !self.chunks.contains_key(i)).collect()
    }
}

/// Collects chunks per audio id until every index `0..total` is present.
#[derive(Default)]
pub struct ChunkAssembler {
    pending: HashMap<String, PendingAudio>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one raw voice payload. Single-packet clips come straight back;
    /// chunks are held until their clip is complete.
    pub fn receive(&mut self, payload: &[u8]) -> Result<Option<AudioClip>, AudioError> {
        if !is_chunked(payload) {
            debug!("single-packet audio, {} bytes", payload.len());
            return Ok(Some(AudioClip::new(None, payload.to_vec())));
        }
        let chunk = parse_chunk(payload)?;
        Ok(self
            .push(chunk)?
            .map(|(id, data)| AudioClip::new(Some(id), data)))
    }

    /// Store a chunk. Returns the audio id and the joined bytes once the
    /// last missing index arrives; the id is forgotten at that point. A
    /// repeated index replaces the earlier data.
    pub fn push(&mut self, chunk: AudioChunk<'_>) -> Result<Option<(String, Vec<u8>)>, AudioError> {
        let entry = self
            .pending
            .entry(chunk.audio_id.to_owned())
            .or_insert_with(|| PendingAudio {
                total: chunk.total,
                chunks: BTreeMap::new(),
            });
        if entry.total != chunk.total {
            return Err(AudioError::TotalMismatch {
                id: chunk.audio_id.to_owned(),
                expected: entry.total,
                got: chunk.total,
            });
        }

        entry.chunks.insert(chunk.index, chunk.data.to_vec());
        debug!(
            "audio {}: chunk {} stored, {}/{}",
            chunk.audio_id,
            chunk.index,
            entry.chunks.len(),
            entry.total
        );
        if entry.chunks.len() < entry.total as usize {
            return Ok(None);
        }

        let Some(done) = self.pending.remove(chunk.audio_id) else {
            return Ok(None);
        };
        let data: Vec<u8> = done.chunks.into_values().flatten().collect();
        info!("Audio {} assembled: {} bytes", chunk.audio_id, data.len());
        Ok(Some((chunk.audio_id.to_owned(), data)))
    }

    /// Indices still outstanding for `audio_id`, if it is pending.
    pub fn missing(&self, audio_id: &str) -> Option<Vec<u32>> {
        self.pending.get(audio_id).map(PendingAudio::missing)
    }

    pub fn pending_ids(&self) -> impl Iterator<Item = &str> {
        self.pending.keys().map(String::as_str)
    }

    /// Drop whatever has been collected for `audio_id`.
    pub fn evict(&mut self, audio_id: &str) -> bool {
        match self.pending.remove(audio_id) {
            Some(pending) => {
                warn!(
                    "Audio {} evicted with {} of {} chunk(s)",
                    audio_id,
                    pending.chunks.len(),
                    pending.total
                );
                true
            }
            None => false,
        }
    }
}

// ─── Container sniffing ──────────────────────────────────────────────

pub fn is_wav(data: &[u8]) -> bool {
    data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE"
}

fn is_mp3_sync(pair: &[u8]) -> bool {
    pair[0] == 0xFF && pair[1] & 0xE0 == 0xE0
}

/// An ID3v2 tag, or an MPEG frame sync within the first KiB.
pub fn is_mp3(data: &[u8]) -> bool {
    if data.len() < 3 {
        return false;
    }
    if data.starts_with(b"ID3") {
        return true;
    }
    data.windows(2)
        .take((data.len() - 2).min(MP3_SYNC_SCAN))
        .any(is_mp3_sync)
}

/// Bytes after a leading ID3v2 tag. Data without a tag, or whose tag
/// claims the whole buffer, comes back unchanged.
pub fn skip_id3(data: &[u8]) -> &[u8] {
    if data.len() < ID3_HEADER_LEN || !data.starts_with(b"ID3") {
        return data;
    }
    // Syncsafe: 7 bits per byte.
    let size = data[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | (*b & 0x7F) as usize);
    let tag_len = size + ID3_HEADER_LEN;
    if tag_len < data.len() {
        debug!("skipping {} byte ID3v2.{} tag", tag_len, data[3]);
        &data[tag_len..]
    } else {
        data
    }
}
