//! Core content-tree model, import contract, and path building for loam.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Platforms with a dedicated adapter and scout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Video,
    Highlight,
    ForumThread,
    MicroblogThread,
    ChatTranscript,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Video,
        Platform::Highlight,
        Platform::ForumThread,
        Platform::MicroblogThread,
        Platform::ChatTranscript,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Video => "video",
            Platform::Highlight => "highlight",
            Platform::ForumThread => "forum_thread",
            Platform::MicroblogThread => "microblog_thread",
            Platform::ChatTranscript => "chat_transcript",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPlatform(pub String);

impl fmt::Display for UnknownPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown platform `{}`", self.0)
    }
}

impl std::error::Error for UnknownPlatform {}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Sanitize each segment independently and join them with `.`.
pub fn build_path<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|s| sanitize_label(s.as_ref()))
        .collect::<Vec<_>>()
        .join(".")
}

/// Append one sanitized label to an existing path.
pub fn extend_path(parent_path: &str, label: &str) -> String {
    format!("{parent_path}.{}", sanitize_label(label))
}

/// Where a child node hangs in the tree being imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum ParentRef {
    Root,
    /// Index into `ImportRequest::children`; must point at an earlier entry.
    Child(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootSpec {
    pub path: String,
    pub title: String,
    pub content: String,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub parent: ParentRef,
    /// Unsanitized path label; the store appends it to the parent's path.
    pub label: String,
    pub title: String,
    pub content: String,
    pub metadata: JsonValue,
    pub depth: u32,
}

/// Canonical tree-shaped handoff from adapters into the tree store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub source_uri: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub source_metadata: JsonValue,
    pub root: RootSpec,
    pub children: Vec<ChildSpec>,
}

impl ImportRequest {
    /// Depth of the node `parent` points at, if it exists.
    pub fn parent_depth(&self, parent: ParentRef) -> Option<u32> {
        match parent {
            ParentRef::Root => Some(0),
            ParentRef::Child(i) => self.children.get(i).map(|c| c.depth),
        }
    }

    pub fn node_count(&self) -> usize {
        self.children.len() + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: i64,
    pub source_uri: String,
    pub metadata: JsonValue,
    pub timestamp: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: i64,
    pub source_id: i64,
    pub parent_id: Option<i64>,
    pub path: String,
    pub depth: u32,
    pub sort_order: u32,
    pub title: String,
    pub content: String,
    pub metadata: JsonValue,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Value of the `type` discriminator in node metadata.
    pub fn node_type(&self) -> Option<&str> {
        self.metadata.get("type").and_then(JsonValue::as_str)
    }
}

/// Display order for one source's nodes: every node is followed by its whole
/// subtree, siblings by `sort_order`. Nodes whose parent is not in `nodes`
/// come last, in input order.
pub fn depth_first(nodes: &[NodeRecord]) -> Vec<&NodeRecord> {
    let mut children: HashMap<Option<i64>, Vec<&NodeRecord>> = HashMap::new();
    for node in nodes {
        children.entry(node.parent_id).or_default().push(node);
    }
    for siblings in children.values_mut() {
        siblings.sort_by_key(|n| (n.sort_order, n.id));
    }

    let mut ordered = Vec::with_capacity(nodes.len());
    let mut stack: Vec<&NodeRecord> = children.get(&None).into_iter().flatten().rev().copied().collect();
    while let Some(node) = stack.pop() {
        ordered.push(node);
        if let Some(kids) = children.get(&Some(node.id)) {
            stack.extend(kids.iter().rev().copied());
        }
    }

    if ordered.len() < nodes.len() {
        let seen: HashSet<i64> = ordered.iter().map(|n| n.id).collect();
        ordered.extend(nodes.iter().filter(|n| !seen.contains(&n.id)));
    }
    ordered
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub is_active: bool,
}

/// A tag as linked to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTagRecord {
    pub node_id: i64,
    pub tag: TagRecord,
    pub confidence: Option<u8>,
    pub is_auto_generated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_everything_outside_word_chars() {
        assert_eq!(sanitize_label("r/test subreddit!"), "r_test_subreddit_");
        assert_eq!(sanitize_label("Thread_42"), "Thread_42");
        assert_eq!(sanitize_label("naïve café"), "na_ve_caf_");
        assert_eq!(sanitize_label(""), "");
    }

    #[test]
    fn sanitized_output_only_contains_word_chars() {
        for input in ["a.b.c", "tab\there", "emoji 🚀 ok", "--__--", "Ünïcödé/ß"] {
            let out = sanitize_label(input);
            assert!(
                out.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
                "{input:?} -> {out:?}"
            );
        }
    }

    #[test]
    fn build_path_sanitizes_segments_independently() {
        let path = build_path(&["Social", "Twitter", "jack.dorsey", "Thread_99"]);
        assert_eq!(path, "Social.Twitter.jack_dorsey.Thread_99");
        assert_eq!(extend_path(&path, "Tweet 1"), "Social.Twitter.jack_dorsey.Thread_99.Tweet_1");
    }

    #[test]
    fn platform_parses_snake_and_kebab_case() {
        assert_eq!("forum_thread".parse::<Platform>(), Ok(Platform::ForumThread));
        assert_eq!("Chat-Transcript".parse::<Platform>(), Ok(Platform::ChatTranscript));
        assert!("podcast".parse::<Platform>().is_err());
        for p in Platform::ALL {
            assert_eq!(p.as_str().parse::<Platform>(), Ok(p));
        }
    }

    #[test]
    fn parent_depth_follows_declared_children() {
        let child = |parent, depth| ChildSpec {
            parent,
            label: "c".into(),
            title: String::new(),
            content: String::new(),
            metadata: JsonValue::Null,
            depth,
        };
        let req = ImportRequest {
            source_uri: "x".into(),
            timestamp: None,
            source_metadata: JsonValue::Null,
            root: RootSpec {
                path: "R".into(),
                title: "t".into(),
                content: String::new(),
                metadata: JsonValue::Null,
            },
            children: vec![child(ParentRef::Root, 1), child(ParentRef::Child(0), 2)],
        };
        assert_eq!(req.parent_depth(ParentRef::Root), Some(0));
        assert_eq!(req.parent_depth(ParentRef::Child(1)), Some(2));
        assert_eq!(req.parent_depth(ParentRef::Child(7)), None);
        assert_eq!(req.node_count(), 3);
    }

    fn node(id: i64, parent_id: Option<i64>, depth: u32, sort_order: u32, title: &str) -> NodeRecord {
        NodeRecord {
            id,
            source_id: 1,
            parent_id,
            path: String::new(),
            depth,
            sort_order,
            title: title.into(),
            content: String::new(),
            metadata: JsonValue::Null,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn depth_first_puts_replies_under_their_comment() {
        // Stored breadth-first, the way a reply tree comes back from the store.
        let nodes = vec![
            node(1, None, 0, 0, "post"),
            node(2, Some(1), 1, 0, "Comment_0"),
            node(3, Some(1), 1, 1, "Comment_1"),
            node(4, Some(3), 2, 1, "Reply_1b"),
            node(5, Some(2), 2, 0, "Reply_0a"),
            node(6, Some(3), 2, 0, "Reply_1a"),
            node(7, Some(6), 3, 0, "Reply_1a_i"),
        ];

        let titles: Vec<&str> = depth_first(&nodes).iter().map(|n| n.title.as_str()).collect();
        assert_eq!(
            titles,
            ["post", "Comment_0", "Reply_0a", "Comment_1", "Reply_1a", "Reply_1a_i", "Reply_1b"]
        );
    }

    #[test]
    fn depth_first_keeps_nodes_with_a_missing_parent() {
        let nodes = vec![node(9, Some(40), 2, 0, "stray"), node(1, None, 0, 0, "root")];
        let ids: Vec<i64> = depth_first(&nodes).iter().map(|n| n.id).collect();
        assert_eq!(ids, [1, 9]);
    }
}
