//! Source adapter contracts + per-platform normalizers.
//!
//! Every adapter is pure: it turns a raw platform payload into an
//! [`ImportRequest`] and never touches storage.

mod chat;
mod forum;
mod highlight;
mod microblog;
mod video;

use loam_core::{ImportRequest, Platform};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use chat::{ChatMessage, ChatTranscriptAdapter, ChatTranscriptPayload};
pub use forum::{ForumComment, ForumPost, ForumThreadAdapter, ForumThreadPayload};
pub use highlight::{HighlightAdapter, HighlightPayload};
pub use microblog::{MicroblogItem, MicroblogThreadAdapter, MicroblogThreadPayload};
pub use video::{
    segment_transcript, split_sentences, TimedText, TranscriptSegment, VideoAdapter, VideoPayload,
    SECONDS_PER_SENTENCE, SENTENCES_PER_SEGMENT,
};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{platform} payload is missing required field `{field}`")]
    MissingField { platform: Platform, field: String },
    #[error("{platform} payload field `{field}` is malformed: {reason}")]
    Malformed {
        platform: Platform,
        field: String,
        reason: String,
    },
    #[error("{platform} payload could not be decoded: {source}")]
    Payload {
        platform: Platform,
        #[source]
        source: serde_json::Error,
    },
}

impl AdapterError {
    /// Name of the offending field, when the failure is tied to one.
    pub fn field(&self) -> Option<&str> {
        match self {
            AdapterError::MissingField { field, .. } | AdapterError::Malformed { field, .. } => {
                Some(field)
            }
            AdapterError::Payload { .. } => None,
        }
    }
}

pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn normalize(&self, raw: &JsonValue) -> Result<ImportRequest, AdapterError>;
}

pub fn adapter_for(platform: Platform) -> &'static dyn SourceAdapter {
    match platform {
        Platform::Video => &VideoAdapter,
        Platform::Highlight => &HighlightAdapter,
        Platform::ForumThread => &ForumThreadAdapter,
        Platform::MicroblogThread => &MicroblogThreadAdapter,
        Platform::ChatTranscript => &ChatTranscriptAdapter,
    }
}

pub fn normalize(platform: Platform, raw: &JsonValue) -> Result<ImportRequest, AdapterError> {
    adapter_for(platform).normalize(raw)
}

fn decode<T: DeserializeOwned>(platform: Platform, raw: &JsonValue) -> Result<T, AdapterError> {
    T::deserialize(raw).map_err(|source| AdapterError::Payload { platform, source })
}

fn missing(platform: Platform, field: impl Into<String>) -> AdapterError {
    AdapterError::MissingField {
        platform,
        field: field.into(),
    }
}

/// Trimmed, non-empty value of a required text field.
fn required<'a>(
    platform: Platform,
    field: impl Into<String>,
    value: Option<&'a str>,
) -> Result<&'a str, AdapterError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing(platform, field))
}

fn text_or_none(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push('…');
    out
}
