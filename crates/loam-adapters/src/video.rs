use chrono::{DateTime, Utc};
use loam_core::{build_path, ChildSpec, ImportRequest, ParentRef, Platform, RootSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::{decode, missing, required, text_or_none, AdapterError, SourceAdapter};

pub const SENTENCES_PER_SEGMENT: usize = 3;
/// Synthetic duration assigned to each sentence when the transcript has no timing.
pub const SECONDS_PER_SENTENCE: f64 = 10.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoPayload {
    pub video_id: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
    pub view_count: Option<u64>,
    pub transcript: Option<String>,
    /// Captions with real timing; preferred over `transcript` when present.
    #[serde(default)]
    pub segments: Vec<TimedText>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedText {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
}

/// Split on `.`, `!` or `?` followed by whitespace (or end of text).
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        current.push(ch);
        let terminal = matches!(ch, '.' | '!' | '?');
        let boundary = chars.peek().map_or(true, |next| next.is_whitespace());
        if terminal && boundary {
            let sentence = current.split_whitespace().collect::<Vec<_>>().join(" ");
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            current.clear();
        }
    }
    let rest = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

/// Group sentences into fixed-size segments with synthetic timing.
pub fn segment_transcript(text: &str) -> Vec<TranscriptSegment> {
    let sentences = split_sentences(text);
    sentences
        .chunks(SENTENCES_PER_SEGMENT)
        .enumerate()
        .map(|(i, group)| {
            let first = (i * SENTENCES_PER_SEGMENT) as f64;
            TranscriptSegment {
                text: group.join(" "),
                start_time: first * SECONDS_PER_SENTENCE,
                end_time: (first + group.len() as f64) * SECONDS_PER_SENTENCE,
            }
        })
        .collect()
}

fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VideoAdapter;

impl VideoAdapter {
    pub fn normalize_payload(&self, payload: &VideoPayload) -> Result<ImportRequest, AdapterError> {
        let platform = Platform::Video;
        let video_id = required(platform, "videoId", payload.video_id.as_deref())?;
        let title = required(platform, "title", payload.title.as_deref())?;
        let channel = text_or_none(payload.channel.as_deref()).unwrap_or_else(|| "Unknown".into());

        let (segments, timing) = if !payload.segments.is_empty() {
            let mut segments = payload
                .segments
                .iter()
                .filter(|s| !s.text.trim().is_empty())
                .map(|s| TranscriptSegment {
                    text: s.text.trim().to_string(),
                    start_time: s.start,
                    end_time: s.end,
                })
                .collect::<Vec<_>>();
            segments.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
            (segments, "captions")
        } else {
            let transcript = required(platform, "transcript", payload.transcript.as_deref())?;
            (segment_transcript(transcript), "synthetic")
        };
        if segments.is_empty() {
            return Err(missing(platform, "transcript"));
        }

        let source_uri = text_or_none(payload.url.as_deref())
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={video_id}"));
        let root_path = build_path(&["Video", channel.as_str(), &format!("Video_{video_id}")]);

        let children = segments
            .iter()
            .enumerate()
            .map(|(i, seg)| ChildSpec {
                parent: ParentRef::Root,
                label: format!("Segment_{i}"),
                title: format!(
                    "{} - {}",
                    format_clock(seg.start_time),
                    format_clock(seg.end_time)
                ),
                content: seg.text.clone(),
                metadata: json!({
                    "type": "transcript_segment",
                    "segmentIndex": i,
                    "startTime": seg.start_time,
                    "endTime": seg.end_time,
                }),
                depth: 1,
            })
            .collect::<Vec<_>>();

        Ok(ImportRequest {
            source_uri: source_uri.clone(),
            timestamp: payload.published_at,
            source_metadata: json!({
                "platform": platform.as_str(),
                "videoId": video_id,
                "channel": channel,
                "url": source_uri,
                "viewCount": payload.view_count,
                "durationSeconds": payload.duration_seconds,
            }),
            root: RootSpec {
                path: root_path,
                title: title.to_string(),
                content: payload.description.clone().unwrap_or_default(),
                metadata: json!({
                    "type": "video",
                    "videoId": video_id,
                    "channel": channel,
                    "segmentCount": children.len(),
                    "timing": timing,
                }),
            },
            children,
        })
    }
}

impl SourceAdapter for VideoAdapter {
    fn platform(&self) -> Platform {
        Platform::Video
    }

    fn normalize(&self, raw: &JsonValue) -> Result<ImportRequest, AdapterError> {
        let payload: VideoPayload = decode(Platform::Video, raw)?;
        self.normalize_payload(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentences_split_on_terminal_punctuation_only() {
        let s = split_sentences("Version 1.5 shipped. Did it work?  Yes!  trailing words");
        assert_eq!(
            s,
            vec!["Version 1.5 shipped.", "Did it work?", "Yes!", "trailing words"]
        );
    }

    #[test]
    fn transcript_groups_three_sentences_with_synthetic_timing() {
        let text = "One. Two. Three. Four. Five. Six. Seven.";
        let segments = segment_transcript(text);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].text, "One. Two. Three.");
        assert_eq!((segments[0].start_time, segments[0].end_time), (0.0, 30.0));
        assert_eq!((segments[1].start_time, segments[1].end_time), (30.0, 60.0));
        assert_eq!(segments[2].text, "Seven.");
        assert_eq!((segments[2].start_time, segments[2].end_time), (60.0, 70.0));
    }

    #[test]
    fn video_children_follow_temporal_order() {
        let payload = VideoPayload {
            video_id: Some("abc123".into()),
            title: Some("Rust in 100 seconds".into()),
            channel: Some("Fire ship".into()),
            transcript: Some("A. B. C. D.".into()),
            ..Default::default()
        };
        let req = VideoAdapter.normalize_payload(&payload).unwrap();
        assert_eq!(req.source_uri, "https://www.youtube.com/watch?v=abc123");
        assert_eq!(req.root.path, "Video.Fire_ship.Video_abc123");
        assert_eq!(req.children.len(), 2);
        assert_eq!(req.children[0].metadata["startTime"], 0.0);
        assert_eq!(req.children[1].metadata["startTime"], 30.0);
        assert_eq!(req.children[1].metadata["endTime"], 40.0);
        assert_eq!(req.children[1].title, "0:30 - 0:40");
        assert!(req.children.iter().all(|c| c.depth == 1 && c.parent == ParentRef::Root));
    }

    #[test]
    fn captions_keep_their_real_timing() {
        let payload = VideoPayload {
            video_id: Some("v".into()),
            title: Some("t".into()),
            segments: vec![
                TimedText { text: "hello".into(), start: 1.5, end: 4.0 },
                TimedText { text: "  ".into(), start: 4.0, end: 5.0 },
                TimedText { text: "world".into(), start: 5.0, end: 7.25 },
            ],
            ..Default::default()
        };
        let req = VideoAdapter.normalize_payload(&payload).unwrap();
        assert_eq!(req.children.len(), 2);
        assert_eq!(req.children[1].metadata["startTime"], 5.0);
        assert_eq!(req.root.metadata["timing"], "captions");
    }

    #[test]
    fn out_of_order_captions_are_emitted_by_start_time() {
        let payload = VideoPayload {
            video_id: Some("v".into()),
            title: Some("t".into()),
            segments: vec![
                TimedText { text: "third".into(), start: 20.0, end: 30.0 },
                TimedText { text: "first".into(), start: 0.0, end: 10.0 },
                TimedText { text: "second".into(), start: 10.0, end: 20.0 },
            ],
            ..Default::default()
        };
        let req = VideoAdapter.normalize_payload(&payload).unwrap();
        let texts: Vec<&str> = req.children.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(req.children[0].label, "Segment_0");
        assert_eq!(req.children[2].metadata["startTime"], 20.0);
    }

    #[test]
    fn missing_title_or_transcript_names_the_field() {
        let no_title = VideoPayload {
            video_id: Some("v".into()),
            transcript: Some("Hi.".into()),
            ..Default::default()
        };
        let err = VideoAdapter.normalize_payload(&no_title).unwrap_err();
        assert_eq!(err.field(), Some("title"));

        let no_transcript = VideoPayload {
            video_id: Some("v".into()),
            title: Some("t".into()),
            ..Default::default()
        };
        let err = VideoAdapter.normalize_payload(&no_transcript).unwrap_err();
        assert_eq!(err.field(), Some("transcript"));
    }
}
