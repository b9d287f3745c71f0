use chrono::{DateTime, Utc};
use loam_core::{build_path, ChildSpec, ImportRequest, ParentRef, Platform, RootSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::{decode, missing, required, text_or_none, AdapterError, SourceAdapter};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroblogThreadPayload {
    pub site: Option<String>,
    pub thread_id: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub items: Vec<MicroblogItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroblogItem {
    pub id: Option<String>,
    pub text: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub like_count: Option<u64>,
    pub repost_count: Option<u64>,
    pub reply_count: Option<u64>,
    pub url: Option<String>,
    #[serde(default)]
    pub media: Vec<String>,
}

/// A synthetic thread node with one child per item, in posting order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MicroblogThreadAdapter;

impl MicroblogThreadAdapter {
    pub fn normalize_payload(
        &self,
        payload: &MicroblogThreadPayload,
    ) -> Result<ImportRequest, AdapterError> {
        let platform = Platform::MicroblogThread;
        let author = required(platform, "author", payload.author.as_deref())?
            .trim_start_matches('@');
        if payload.items.is_empty() {
            return Err(missing(platform, "items"));
        }
        let thread_id = match text_or_none(payload.thread_id.as_deref()) {
            Some(id) => id,
            None => required(platform, "threadId", payload.items[0].id.as_deref())?.to_string(),
        };
        let site = text_or_none(payload.site.as_deref()).unwrap_or_else(|| "Twitter".into());
        let total = payload.items.len();

        let mut texts = Vec::with_capacity(total);
        let mut children = Vec::with_capacity(total);
        for (position, item) in payload.items.iter().enumerate() {
            let text = required(platform, format!("items[{position}].text"), item.text.as_deref())?;
            texts.push(text);
            children.push(ChildSpec {
                parent: ParentRef::Root,
                label: format!("Post_{position}"),
                title: format!("{}/{total}", position + 1),
                content: text.to_string(),
                metadata: json!({
                    "type": "tweet",
                    "postId": item.id,
                    "position": position,
                    "likeCount": item.like_count,
                    "repostCount": item.repost_count,
                    "replyCount": item.reply_count,
                    "createdAt": item.created_at,
                    "url": item.url,
                    "media": item.media,
                }),
                depth: 1,
            });
        }

        let source_uri = text_or_none(payload.url.as_deref())
            .unwrap_or_else(|| format!("https://x.com/{author}/status/{thread_id}"));

        Ok(ImportRequest {
            source_uri,
            timestamp: payload.items[0].created_at,
            source_metadata: json!({
                "platform": platform.as_str(),
                "site": site,
                "author": author,
                "threadId": thread_id,
                "itemCount": total,
                "likeCount": payload.items.iter().filter_map(|i| i.like_count).sum::<u64>(),
            }),
            root: RootSpec {
                path: build_path(&[
                    "Social",
                    site.as_str(),
                    author,
                    &format!("Thread_{thread_id}"),
                ]),
                title: format!("Thread by @{author}"),
                content: texts.join("\n\n"),
                metadata: json!({
                    "type": "thread",
                    "author": author,
                    "itemCount": total,
                }),
            },
            children,
        })
    }
}

impl SourceAdapter for MicroblogThreadAdapter {
    fn platform(&self) -> Platform {
        Platform::MicroblogThread
    }

    fn normalize(&self, raw: &JsonValue) -> Result<ImportRequest, AdapterError> {
        let payload: MicroblogThreadPayload = decode(Platform::MicroblogThread, raw)?;
        self.normalize_payload(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, text: &str, likes: u64) -> MicroblogItem {
        MicroblogItem {
            id: Some(id.into()),
            text: Some(text.into()),
            like_count: Some(likes),
            ..Default::default()
        }
    }

    #[test]
    fn items_keep_posting_order() {
        let payload = MicroblogThreadPayload {
            thread_id: Some("1700".into()),
            author: Some("@ferris".into()),
            items: vec![item("1700", "first", 5), item("1701", "second", 2)],
            ..Default::default()
        };
        let req = MicroblogThreadAdapter.normalize_payload(&payload).unwrap();
        assert_eq!(req.root.path, "Social.Twitter.ferris.Thread_1700");
        assert_eq!(req.source_uri, "https://x.com/ferris/status/1700");
        assert_eq!(req.root.content, "first\n\nsecond");
        assert_eq!(req.children.len(), 2);
        assert_eq!(req.children[0].content, "first");
        assert_eq!(req.children[1].metadata["position"], 1);
        assert_eq!(req.children[1].metadata["type"], "tweet");
        assert_eq!(req.source_metadata["likeCount"], 7);
    }

    #[test]
    fn thread_id_falls_back_to_first_item() {
        let payload = MicroblogThreadPayload {
            author: Some("ferris".into()),
            items: vec![item("42", "solo", 0)],
            ..Default::default()
        };
        let req = MicroblogThreadAdapter.normalize_payload(&payload).unwrap();
        assert_eq!(req.source_metadata["threadId"], "42");
    }

    #[test]
    fn empty_thread_is_rejected() {
        let payload = MicroblogThreadPayload {
            thread_id: Some("1".into()),
            author: Some("ferris".into()),
            ..Default::default()
        };
        let err = MicroblogThreadAdapter.normalize_payload(&payload).unwrap_err();
        assert_eq!(err.field(), Some("items"));
    }
}
