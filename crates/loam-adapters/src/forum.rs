use std::collections::HashMap;

use chrono::{DateTime, Utc};
use loam_core::{build_path, ChildSpec, ImportRequest, ParentRef, Platform, RootSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::{decode, missing, required, text_or_none, truncate_chars, AdapterError, SourceAdapter};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForumThreadPayload {
    pub site: Option<String>,
    pub post: Option<ForumPost>,
    #[serde(default)]
    pub comments: Vec<ForumComment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForumPost {
    pub id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub author: Option<String>,
    pub community: Option<String>,
    pub url: Option<String>,
    pub score: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForumComment {
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub author: Option<String>,
    pub body: Option<String>,
    pub score: Option<i64>,
    /// Nesting level as reported by the forum; top-level comments are 0.
    #[serde(default)]
    pub depth: u32,
    pub created_at: Option<DateTime<Utc>>,
}

/// Posts become the root; comments nest under their parent comment when it
/// is part of the same payload and under the post otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForumThreadAdapter;

impl ForumThreadAdapter {
    pub fn normalize_payload(
        &self,
        payload: &ForumThreadPayload,
    ) -> Result<ImportRequest, AdapterError> {
        let platform = Platform::ForumThread;
        let post = payload.post.as_ref().ok_or_else(|| missing(platform, "post"))?;
        let post_id = required(platform, "post.id", post.id.as_deref())?;
        let title = required(platform, "post.title", post.title.as_deref())?;
        let site = text_or_none(payload.site.as_deref()).unwrap_or_else(|| "Reddit".into());
        let community =
            text_or_none(post.community.as_deref()).unwrap_or_else(|| "unknown".into());
        let author = text_or_none(post.author.as_deref()).unwrap_or_else(|| "[deleted]".into());

        let root_path = build_path(&[
            "Social",
            site.as_str(),
            community.as_str(),
            &format!("Post_{post_id}"),
        ]);
        let source_uri = text_or_none(post.url.as_deref())
            .unwrap_or_else(|| format!("forum://{}/{post_id}", site.to_ascii_lowercase()));

        let mut index_by_comment: HashMap<&str, usize> = HashMap::new();
        let mut children: Vec<ChildSpec> = Vec::with_capacity(payload.comments.len());
        for (i, comment) in payload.comments.iter().enumerate() {
            let comment_id = required(platform, format!("comments[{i}].id"), comment.id.as_deref())?;
            let body = required(platform, format!("comments[{i}].body"), comment.body.as_deref())?;
            let parent_comment_id = text_or_none(comment.parent_id.as_deref());

            let parent = parent_comment_id
                .as_deref()
                .and_then(|pid| index_by_comment.get(pid).copied())
                .map_or(ParentRef::Root, ParentRef::Child);
            let parent_depth = match parent {
                ParentRef::Root => 0,
                ParentRef::Child(idx) => children[idx].depth,
            };
            let comment_author =
                text_or_none(comment.author.as_deref()).unwrap_or_else(|| "[deleted]".into());

            children.push(ChildSpec {
                parent,
                label: format!("Comment_{comment_id}"),
                title: format!("{comment_author}: {}", truncate_chars(body, 60)),
                content: body.to_string(),
                metadata: json!({
                    "type": "comment",
                    "commentId": comment_id,
                    "parentCommentId": parent_comment_id,
                    "author": comment_author,
                    "score": comment.score,
                    "commentDepth": comment.depth,
                    "createdAt": comment.created_at,
                }),
                depth: parent_depth + 1,
            });
            index_by_comment.entry(comment_id).or_insert(i);
        }

        Ok(ImportRequest {
            source_uri,
            timestamp: post.created_at,
            source_metadata: json!({
                "platform": platform.as_str(),
                "site": site,
                "community": community,
                "author": author,
                "score": post.score,
                "commentCount": children.len(),
            }),
            root: RootSpec {
                path: root_path,
                title: title.to_string(),
                content: post.body.clone().unwrap_or_default(),
                metadata: json!({
                    "type": "post",
                    "postId": post_id,
                    "author": author,
                    "community": community,
                    "score": post.score,
                }),
            },
            children,
        })
    }
}

impl SourceAdapter for ForumThreadAdapter {
    fn platform(&self) -> Platform {
        Platform::ForumThread
    }

    fn normalize(&self, raw: &JsonValue) -> Result<ImportRequest, AdapterError> {
        let payload: ForumThreadPayload = decode(Platform::ForumThread, raw)?;
        self.normalize_payload(&payload)
    }
}
