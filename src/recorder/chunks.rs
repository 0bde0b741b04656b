//! Recorded chunks and the final artifact

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A container/codec combination, written as a MIME type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodingFormat {
    mime_type: String,
}

impl EncodingFormat {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
        }
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Container part, e.g. `webm` for `video/webm;codecs=vp9,opus`
    pub fn container(&self) -> &str {
        let essence = self.mime_type.split(';').next().unwrap_or("").trim();
        essence.strip_prefix("video/").unwrap_or(essence)
    }

    /// Codec list, empty when the MIME type names none
    pub fn codecs(&self) -> Vec<&str> {
        self.mime_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().strip_prefix("codecs="))
            .flat_map(|list| list.trim_matches('"').split(','))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// Formats tried in order when none are configured
    pub fn default_preferences() -> Vec<Self> {
        [
            "video/webm;codecs=vp9,opus",
            "video/webm;codecs=vp8,opus",
            "video/webm",
            "video/mp4;codecs=avc1,mp4a",
            "video/mp4",
        ]
        .into_iter()
        .map(Self::new)
        .collect()
    }
}

impl fmt::Display for EncodingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mime_type)
    }
}

/// Append-only sequence of encoded segments from one recording
#[derive(Debug, Clone, Default)]
pub struct RecordedChunks {
    chunks: Vec<Bytes>,
    total_bytes: usize,
}

impl RecordedChunks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Empty chunks are ignored.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }

    /// Concatenate every chunk, in arrival order, into the final artifact
    pub fn into_artifact(self, format: EncodingFormat) -> ReviewArtifact {
        let chunk_count = self.chunks.len();
        let mut data = BytesMut::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }

        ReviewArtifact {
            id: Uuid::new_v4(),
            data: data.freeze(),
            format,
            created_at: Utc::now(),
            chunk_count,
        }
    }
}

/// The finished recording. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewArtifact {
    id: Uuid,
    data: Bytes,
    format: EncodingFormat,
    created_at: DateTime<Utc>,
    chunk_count: usize,
}

impl ReviewArtifact {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cheap to clone, shares the buffer
    pub fn data(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn format(&self) -> &EncodingFormat {
        &self.format
    }

    pub fn mime_type(&self) -> &str {
        self.format.mime_type()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }
}
