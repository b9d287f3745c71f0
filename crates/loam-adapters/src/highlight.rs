use chrono::{DateTime, Utc};
use loam_core::{build_path, sanitize_label, ImportRequest, Platform, RootSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::{decode, required, text_or_none, truncate_chars, AdapterError, SourceAdapter};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightPayload {
    pub id: Option<String>,
    pub text: Option<String>,
    pub book_title: Option<String>,
    pub author: Option<String>,
    pub note: Option<String>,
    pub location: Option<String>,
    pub color: Option<String>,
    pub highlighted_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
}

/// Highlights import as a single root node with no children.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighlightAdapter;

impl HighlightAdapter {
    pub fn normalize_payload(
        &self,
        payload: &HighlightPayload,
    ) -> Result<ImportRequest, AdapterError> {
        let platform = Platform::Highlight;
        let id = required(platform, "id", payload.id.as_deref())?;
        let text = required(platform, "text", payload.text.as_deref())?;
        let book_title = required(platform, "bookTitle", payload.book_title.as_deref())?;
        let author =
            text_or_none(payload.author.as_deref()).unwrap_or_else(|| "Unknown Author".into());
        let note = text_or_none(payload.note.as_deref());

        let source_uri = text_or_none(payload.url.as_deref())
            .unwrap_or_else(|| format!("highlight://{}/{id}", sanitize_label(book_title)));

        let content = match &note {
            Some(note) => format!("{text}\n\nNote: {note}"),
            None => text.to_string(),
        };

        Ok(ImportRequest {
            source_uri,
            timestamp: payload.highlighted_at,
            source_metadata: json!({
                "platform": platform.as_str(),
                "bookTitle": book_title,
                "author": author,
                "highlightId": id,
            }),
            root: RootSpec {
                path: build_path(&[
                    "Reading",
                    "Highlights",
                    author.as_str(),
                    book_title,
                    &format!("Highlight_{id}"),
                ]),
                title: truncate_chars(text, 80),
                content,
                metadata: json!({
                    "type": "highlight",
                    "bookTitle": book_title,
                    "author": author,
                    "location": payload.location,
                    "color": payload.color,
                    "note": note,
                }),
            },
            children: Vec::new(),
        })
    }
}

impl SourceAdapter for HighlightAdapter {
    fn platform(&self) -> Platform {
        Platform::Highlight
    }

    fn normalize(&self, raw: &JsonValue) -> Result<ImportRequest, AdapterError> {
        let payload: HighlightPayload = decode(Platform::Highlight, raw)?;
        self.normalize_payload(&payload)
    }
}
