use chrono::{DateTime, Utc};
use loam_core::{build_path, ChildSpec, ImportRequest, ParentRef, Platform, RootSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::{decode, missing, required, text_or_none, truncate_chars, AdapterError, SourceAdapter};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTranscriptPayload {
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    /// Assistant product the conversation was held with, e.g. "ChatGPT".
    pub service: Option<String>,
    pub model: Option<String>,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Option<String>,
    pub content: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatTranscriptAdapter;

impl ChatTranscriptAdapter {
    pub fn normalize_payload(
        &self,
        payload: &ChatTranscriptPayload,
    ) -> Result<ImportRequest, AdapterError> {
        let platform = Platform::ChatTranscript;
        let conversation_id =
            required(platform, "conversationId", payload.conversation_id.as_deref())?;
        if payload.messages.is_empty() {
            return Err(missing(platform, "messages"));
        }
        let service = text_or_none(payload.service.as_deref()).unwrap_or_else(|| "Chat".into());

        let mut messages = Vec::with_capacity(payload.messages.len());
        for (i, message) in payload.messages.iter().enumerate() {
            let role = required(platform, format!("messages[{i}].role"), message.role.as_deref())?;
            let content = required(
                platform,
                format!("messages[{i}].content"),
                message.content.as_deref(),
            )?;
            messages.push((role.to_ascii_lowercase(), content, message.timestamp));
        }
        // Chronological order; payload order breaks ties and covers untimed messages.
        if messages.iter().all(|(_, _, ts)| ts.is_some()) {
            messages.sort_by_key(|(_, _, ts)| *ts);
        }

        let title = text_or_none(payload.title.as_deref())
            .or_else(|| {
                messages
                    .iter()
                    .find(|(role, _, _)| role == "user")
                    .map(|(_, content, _)| truncate_chars(content, 80))
            })
            .unwrap_or_else(|| "Untitled conversation".into());

        let children = messages
            .iter()
            .enumerate()
            .map(|(index, (role, content, ts))| ChildSpec {
                parent: ParentRef::Root,
                label: format!("Message_{index}"),
                title: format!("{role} #{}", index + 1),
                content: content.to_string(),
                metadata: json!({
                    "type": "message",
                    "role": role,
                    "messageIndex": index,
                    "timestamp": ts,
                }),
                depth: 1,
            })
            .collect::<Vec<_>>();

        let source_uri = text_or_none(payload.url.as_deref()).unwrap_or_else(|| {
            format!("chat://{}/{conversation_id}", service.to_ascii_lowercase())
        });

        Ok(ImportRequest {
            source_uri,
            timestamp: payload.created_at.or_else(|| messages.first().and_then(|m| m.2)),
            source_metadata: json!({
                "platform": platform.as_str(),
                "service": service,
                "model": payload.model,
                "conversationId": conversation_id,
                "messageCount": children.len(),
            }),
            root: RootSpec {
                path: build_path(&[
                    "Chats",
                    service.as_str(),
                    &format!("Conversation_{conversation_id}"),
                ]),
                title,
                content: String::new(),
                metadata: json!({
                    "type": "conversation",
                    "model": payload.model,
                    "messageCount": children.len(),
                }),
            },
            children,
        })
    }
}

impl SourceAdapter for ChatTranscriptAdapter {
    fn platform(&self) -> Platform {
        Platform::ChatTranscript
    }

    fn normalize(&self, raw: &JsonValue) -> Result<ImportRequest, AdapterError> {
        let payload: ChatTranscriptPayload = decode(Platform::ChatTranscript, raw)?;
        self.normalize_payload(&payload)
    }
}
