//! Turn a loaded page into raw platform payloads the adapters understand.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use loam_adapters::{
    ChatMessage, ChatTranscriptPayload, ForumComment, ForumPost, ForumThreadPayload,
    HighlightPayload, MicroblogItem, MicroblogThreadPayload, TimedText, VideoPayload,
};
use loam_core::Platform;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::page::{ElementData, Page};
use crate::scout::{ScoutError, ScoutJob};

pub fn default_selectors(platform: Platform) -> &'static [(&'static str, &'static str)] {
    match platform {
        Platform::Video => &[
            ("title", "h1.ytd-watch-metadata"),
            ("channel", "ytd-channel-name a"),
            ("description", "#description-text"),
            ("published", "meta[itemprop=\"datePublished\"]"),
            // Optional `data-start` / `data-end` attributes carry timing in seconds.
            ("transcript", "ytd-transcript-segment-renderer"),
        ],
        Platform::Highlight => &[
            ("book_title", "h3.kp-notebook-metadata"),
            ("author", "p.kp-notebook-metadata.a-color-secondary"),
            ("highlight", ".kp-notebook-highlight"),
        ],
        Platform::ForumThread => &[
            ("post", "shreddit-post"),
            ("post_body", "shreddit-post [slot=\"text-body\"]"),
            ("comment", "shreddit-comment"),
        ],
        Platform::MicroblogThread => &[("item_text", "[data-testid=\"tweetText\"]")],
        Platform::ChatTranscript => &[
            ("title", "h1"),
            ("message", "[data-message-author-role]"),
            ("role_attr", "data-message-author-role"),
        ],
    }
}

/// Platform default selectors with registry overrides layered on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selectors {
    map: BTreeMap<String, String>,
}

impl Selectors {
    pub fn for_platform(platform: Platform, overrides: &BTreeMap<String, String>) -> Self {
        let mut map: BTreeMap<String, String> = default_selectors(platform)
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { map }
    }

    pub fn get(&self, key: &str) -> &str {
        self.map.get(key).map(String::as_str).unwrap_or_default()
    }
}

/// Read the current page of `job` into one or more raw payloads.
///
/// Waits up to `timeout` for the platform's primary element before reading.
pub async fn extract_payloads(
    platform: Platform,
    page: &dyn Page,
    job: &ScoutJob,
    selectors: &Selectors,
    timeout: Duration,
) -> Result<Vec<JsonValue>, ScoutError> {
    match platform {
        Platform::Video => extract_video(page, job, selectors, timeout).await,
        Platform::Highlight => extract_highlights(page, job, selectors, timeout).await,
        Platform::ForumThread => extract_forum_thread(page, job, selectors, timeout).await,
        Platform::MicroblogThread => extract_microblog_thread(page, job, selectors, timeout).await,
        Platform::ChatTranscript => extract_chat(page, job, selectors, timeout).await,
    }
}

async fn extract_video(
    page: &dyn Page,
    job: &ScoutJob,
    sel: &Selectors,
    timeout: Duration,
) -> Result<Vec<JsonValue>, ScoutError> {
    page.wait_for_selector(sel.get("title"), timeout).await?;
    let published_at = page
        .query_all(sel.get("published"))
        .await?
        .first()
        .and_then(|el| el.attr("content"))
        .and_then(parse_timestamp);

    let lines = page.query_all(sel.get("transcript")).await?;
    let timed: Option<Vec<TimedText>> = lines
        .iter()
        .map(|el| {
            Some(TimedText {
                text: el.text.clone(),
                start: el.attr("data-start")?.parse().ok()?,
                end: el.attr("data-end")?.parse().ok()?,
            })
        })
        .collect();
    let (segments, transcript) = match timed {
        Some(segments) if !segments.is_empty() => (segments, None),
        _ => (Vec::new(), non_empty(join_texts(&lines, " "))),
    };

    let payload = VideoPayload {
        video_id: video_id_from_url(&job.url).or_else(|| Some(job.id.clone())),
        url: Some(job.url.clone()),
        title: page.text(sel.get("title")).await?,
        channel: page.text(sel.get("channel")).await?,
        description: page.text(sel.get("description")).await?,
        published_at,
        duration_seconds: None,
        view_count: None,
        transcript,
        segments,
    };
    Ok(vec![to_json(Platform::Video, &payload)?])
}

async fn extract_highlights(
    page: &dyn Page,
    job: &ScoutJob,
    sel: &Selectors,
    timeout: Duration,
) -> Result<Vec<JsonValue>, ScoutError> {
    page.wait_for_selector(sel.get("highlight"), timeout).await?;
    let book_title = page.text(sel.get("book_title")).await?;
    let author = page
        .text(sel.get("author"))
        .await?
        .map(|a| a.trim_start_matches("By:").trim().to_string());

    page.query_all(sel.get("highlight"))
        .await?
        .into_iter()
        .enumerate()
        .filter(|(_, el)| !el.text.is_empty())
        .map(|(i, el)| {
            let payload = HighlightPayload {
                id: Some(
                    el.attr("id")
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{}_{i}", job.id)),
                ),
                location: el.attr("data-location").map(str::to_string),
                color: el.attr("data-color").map(str::to_string),
                text: Some(el.text),
                book_title: book_title.clone(),
                author: author.clone(),
                note: None,
                highlighted_at: None,
                url: None,
            };
            to_json(Platform::Highlight, &payload)
        })
        .collect()
}

async fn extract_forum_thread(
    page: &dyn Page,
    job: &ScoutJob,
    sel: &Selectors,
    timeout: Duration,
) -> Result<Vec<JsonValue>, ScoutError> {
    page.wait_for_selector(sel.get("post"), timeout).await?;
    let post = page
        .query_all(sel.get("post"))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ScoutError::Extract {
            platform: Platform::ForumThread,
            reason: "post element disappeared".into(),
        })?;
    let post_id = post.attr("id").map(strip_thing_prefix);

    let comments = page
        .query_all(sel.get("comment"))
        .await?
        .into_iter()
        .map(|el| ForumComment {
            id: el.attr("thingid").map(strip_thing_prefix),
            parent_id: el
                .attr("parentid")
                .map(strip_thing_prefix)
                .filter(|parent| Some(parent) != post_id.as_ref()),
            author: el.attr("author").map(str::to_string),
            score: el.attr("score").and_then(|s| s.parse().ok()),
            depth: el.attr("depth").and_then(|d| d.parse().ok()).unwrap_or(0),
            created_at: el.attr("created").and_then(parse_timestamp),
            body: non_empty(el.text),
        })
        .collect();

    let payload = ForumThreadPayload {
        site: Some("Reddit".into()),
        post: Some(ForumPost {
            id: post_id,
            title: post.attr("post-title").map(str::to_string),
            body: page.text(sel.get("post_body")).await?,
            author: post.attr("author").map(str::to_string),
            community: post.attr("subreddit-prefixed-name").map(str::to_string),
            url: Some(job.url.clone()),
            score: post.attr("score").and_then(|s| s.parse().ok()),
            created_at: post.attr("created-timestamp").and_then(parse_timestamp),
        }),
        comments,
    };
    Ok(vec![to_json(Platform::ForumThread, &payload)?])
}

async fn extract_microblog_thread(
    page: &dyn Page,
    job: &ScoutJob,
    sel: &Selectors,
    timeout: Duration,
) -> Result<Vec<JsonValue>, ScoutError> {
    page.wait_for_selector(sel.get("item_text"), timeout).await?;
    let (author, thread_id) = match status_from_url(&job.url) {
        Some((author, id)) => (Some(author), Some(id)),
        None => (None, Some(job.id.clone())),
    };
    let items = page
        .query_all(sel.get("item_text"))
        .await?
        .into_iter()
        .filter(|el| !el.text.is_empty())
        .map(|el| MicroblogItem {
            text: Some(el.text),
            ..MicroblogItem::default()
        })
        .collect();

    let payload = MicroblogThreadPayload {
        site: Some("Twitter".into()),
        thread_id,
        author,
        url: Some(job.url.clone()),
        items,
    };
    Ok(vec![to_json(Platform::MicroblogThread, &payload)?])
}

async fn extract_chat(
    page: &dyn Page,
    job: &ScoutJob,
    sel: &Selectors,
    timeout: Duration,
) -> Result<Vec<JsonValue>, ScoutError> {
    page.wait_for_selector(sel.get("message"), timeout).await?;
    let role_attr = sel.get("role_attr");
    let messages = page
        .query_all(sel.get("message"))
        .await?
        .into_iter()
        .map(|el| ChatMessage {
            role: el.attr(role_attr).map(str::to_string),
            content: non_empty(el.text),
            timestamp: None,
        })
        .collect();

    let payload = ChatTranscriptPayload {
        conversation_id: last_path_segment(&job.url).or_else(|| Some(job.id.clone())),
        title: page.text(sel.get("title")).await?,
        service: service_for_url(&job.url).map(str::to_string),
        model: None,
        url: Some(job.url.clone()),
        created_at: None,
        messages,
    };
    Ok(vec![to_json(Platform::ChatTranscript, &payload)?])
}

fn to_json<T: Serialize>(platform: Platform, payload: &T) -> Result<JsonValue, ScoutError> {
    serde_json::to_value(payload).map_err(|e| ScoutError::Extract {
        platform,
        reason: e.to_string(),
    })
}

fn join_texts(elements: &[ElementData], sep: &str) -> String {
    elements
        .iter()
        .map(|el| el.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// RFC 3339 timestamps or bare `YYYY-MM-DD` dates (taken as midnight UTC).
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Reddit thing ids carry a kind prefix: `t3_` posts, `t1_` comments.
fn strip_thing_prefix(id: &str) -> String {
    match id.split_once('_') {
        Some((kind, rest)) if kind.len() == 2 && kind.starts_with('t') => rest.to_string(),
        _ => id.to_string(),
    }
}

pub fn video_id_from_url(url: &str) -> Option<String> {
    const MARKERS: [&str; 4] = ["watch?v=", "youtu.be/", "/embed/", "/v/"];
    MARKERS.into_iter().find_map(|marker| {
        let start = url.find(marker)? + marker.len();
        let id: String = url[start..]
            .chars()
            .take_while(|c| !matches!(c, '&' | '?' | '#' | '/'))
            .collect();
        (!id.is_empty()).then_some(id)
    })
}

/// `https://x.com/<author>/status/<id>` → `(author, id)`.
fn status_from_url(url: &str) -> Option<(String, String)> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let mut segments = parsed.path_segments()?;
    let author = segments.next().filter(|s| !s.is_empty())?;
    if segments.next()? != "status" {
        return None;
    }
    let id = segments.next().filter(|s| !s.is_empty())?;
    Some((author.to_string(), id.to_string()))
}

fn last_path_segment(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

fn service_for_url(url: &str) -> Option<&'static str> {
    let parsed = reqwest::Url::parse(url).ok()?;
    match parsed.host_str()? {
        "chatgpt.com" | "chat.openai.com" => Some("ChatGPT"),
        "claude.ai" => Some("Claude"),
        "gemini.google.com" => Some("Gemini"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{Browser, BrowserContext, BrowserLauncher, ContextOptions};
    use crate::static_html::HttpBrowser;
    use loam_adapters::normalize;

    async fn load(markup: &str) -> Box<dyn Page> {
        let browser = HttpBrowser::default().launch().await.unwrap();
        let context = browser.new_context(&ContextOptions::default()).await.unwrap();
        let page = context.new_page().await.unwrap();
        page.navigate(&format!("data:text/html,{markup}")).await.unwrap();
        page
    }

    fn job(url: &str) -> ScoutJob {
        ScoutJob {
            id: "job-1".into(),
            url: url.into(),
        }
    }

    async fn extract(platform: Platform, markup: &str, url: &str) -> Vec<JsonValue> {
        let page = load(markup).await;
        let selectors = Selectors::for_platform(platform, &BTreeMap::new());
        extract_payloads(platform, page.as_ref(), &job(url), &selectors, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn video_page_with_timed_transcript() {
        let payloads = extract(
            Platform::Video,
            r#"<h1 class="ytd-watch-metadata">Rust in Production</h1>
               <ytd-channel-name><a href="/@rustconf">RustConf</a></ytd-channel-name>
               <meta itemprop="datePublished" content="2024-09-10">
               <ytd-transcript-segment-renderer data-start="0" data-end="4.5">Welcome.</ytd-transcript-segment-renderer>
               <ytd-transcript-segment-renderer data-start="4.5" data-end="9">Let's begin.</ytd-transcript-segment-renderer>"#,
            "https://www.youtube.com/watch?v=abc123&t=4",
        )
        .await;
        assert_eq!(payloads.len(), 1);
        let video = &payloads[0];
        assert_eq!(video["videoId"], "abc123");
        assert_eq!(video["channel"], "RustConf");
        assert_eq!(video["segments"][1]["start"], 4.5);
        assert_eq!(video["publishedAt"], "2024-09-10T00:00:00Z");

        let request = normalize(Platform::Video, video).unwrap();
        assert_eq!(request.children.len(), 2);
    }

    #[tokio::test]
    async fn notebook_page_yields_one_payload_per_highlight() {
        let payloads = extract(
            Platform::Highlight,
            r#"<h3 class="kp-notebook-metadata">Zero to Production</h3>
               <p class="kp-notebook-metadata a-color-secondary">By: Luca Palmieri</p>
               <div class="kp-notebook-highlight" id="QID1">Tests are the specification.</div>
               <div class="kp-notebook-highlight">Errors are part of the API.</div>"#,
            "https://read.amazon.com/notebook?asin=B0",
        )
        .await;
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["id"], "QID1");
        assert_eq!(payloads[1]["id"], "job-1_1");
        assert_eq!(payloads[1]["author"], "Luca Palmieri");
        for payload in &payloads {
            normalize(Platform::Highlight, payload).unwrap();
        }
    }

    #[tokio::test]
    async fn forum_page_keeps_comment_parentage() {
        let payloads = extract(
            Platform::ForumThread,
            r#"<shreddit-post id="t3_1h2k3l" post-title="Lifetimes?" author="op"
                   subreddit-prefixed-name="r/rust" score="12">
                 <div slot="text-body">How did it click?</div>
               </shreddit-post>
               <shreddit-comment thingid="t1_a" parentid="t3_1h2k3l" depth="0" author="x">Drawing.</shreddit-comment>
               <shreddit-comment thingid="t1_b" parentid="t1_a" depth="1" author="y">Same.</shreddit-comment>"#,
            "https://www.reddit.com/r/rust/comments/1h2k3l/",
        )
        .await;
        let thread = &payloads[0];
        assert_eq!(thread["post"]["id"], "1h2k3l");
        assert_eq!(thread["post"]["body"], "How did it click?");
        assert!(thread["comments"][0]["parentId"].is_null());
        assert_eq!(thread["comments"][1]["parentId"], "a");

        let request = normalize(Platform::ForumThread, thread).unwrap();
        let depths: Vec<u32> = request.children.iter().map(|c| c.depth).collect();
        assert_eq!(depths, vec![1, 2]);
    }

    #[tokio::test]
    async fn microblog_and_chat_pages() {
        let thread = extract(
            Platform::MicroblogThread,
            r#"<div data-testid="tweetText">one</div><div data-testid="tweetText">two</div>"#,
            "https://x.com/ferris/status/1700",
        )
        .await;
        assert_eq!(thread[0]["author"], "ferris");
        assert_eq!(thread[0]["threadId"], "1700");
        assert_eq!(normalize(Platform::MicroblogThread, &thread[0]).unwrap().node_count(), 3);

        let chat = extract(
            Platform::ChatTranscript,
            r#"<h1>Borrowck help</h1>
               <div data-message-author-role="user">Why does this not compile?</div>
               <div data-message-author-role="assistant">The reference outlives its owner.</div>"#,
            "https://chatgpt.com/share/6f1c",
        )
        .await;
        assert_eq!(chat[0]["conversationId"], "6f1c");
        assert_eq!(chat[0]["service"], "ChatGPT");
        assert_eq!(chat[0]["messages"][1]["role"], "assistant");
    }

    #[tokio::test]
    async fn missing_primary_element_is_a_page_error() {
        let page = load("<p>nothing here</p>").await;
        let selectors = Selectors::for_platform(Platform::Video, &BTreeMap::new());
        let err = extract_payloads(
            Platform::Video,
            page.as_ref(),
            &job("https://youtu.be/xyz"),
            &selectors,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("h1.ytd-watch-metadata"), "{err}");
    }

    #[test]
    fn overrides_replace_defaults() {
        let overrides = BTreeMap::from([("message".to_string(), "div.msg".to_string())]);
        let selectors = Selectors::for_platform(Platform::ChatTranscript, &overrides);
        assert_eq!(selectors.get("message"), "div.msg");
        assert_eq!(selectors.get("role_attr"), "data-message-author-role");
        assert_eq!(selectors.get("nope"), "");
    }

    #[test]
    fn url_helpers() {
        assert_eq!(video_id_from_url("https://youtu.be/dQw4w9WgXcQ?t=1").as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(video_id_from_url("https://www.youtube.com/embed/abc/").as_deref(), Some("abc"));
        assert_eq!(video_id_from_url("https://example.com"), None);
        assert_eq!(strip_thing_prefix("t1_abc"), "abc");
        assert_eq!(strip_thing_prefix("plain_id"), "plain_id");
        assert_eq!(status_from_url("https://x.com/ferris"), None);
    }
}
