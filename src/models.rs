use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const BROADCAST_CHANNEL_TYPE: &str = "net.app.core.broadcast";
pub const BROADCAST_METADATA_ANNOTATION: &str = "net.app.core.broadcast.metadata";
pub const OEMBED_ANNOTATION: &str = "net.app.core.oembed";

/// Schedule periods, in minutes, offered when editing a feed.
pub const SCHEDULE_PERIODS: [u32; 5] = [1, 5, 15, 30, 60];

/// Boolean feed flags that must be omitted from a request when false. The
/// server treats any submitted value as true.
pub const OPTIONAL_FLAGS: [&str; 4] = [
    "linked_list_mode",
    "include_thumb",
    "include_summary",
    "include_video",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum FeedType {
    #[default]
    Rss,
    Instagram,
    Broadcast,
}

impl FeedType {
    pub fn code(self) -> u8 {
        match self {
            FeedType::Rss => 1,
            FeedType::Instagram => 2,
            FeedType::Broadcast => 3,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            FeedType::Rss => "RSS Feed",
            FeedType::Instagram => "Instagram Feed",
            FeedType::Broadcast => "Broadcast Channel",
        }
    }
}

impl TryFrom<u8> for FeedType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FeedType::Rss),
            2 => Ok(FeedType::Instagram),
            3 => Ok(FeedType::Broadcast),
            other => Err(format!("unknown feed type {other}")),
        }
    }
}

impl From<FeedType> for u8 {
    fn from(value: FeedType) -> Self {
        value.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum FormatMode {
    #[default]
    LinkedTitle,
    TitleThenLink,
}

impl FormatMode {
    pub fn code(self) -> u8 {
        match self {
            FormatMode::LinkedTitle => 1,
            FormatMode::TitleThenLink => 2,
        }
    }
}

impl TryFrom<u8> for FormatMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FormatMode::LinkedTitle),
            2 => Ok(FormatMode::TitleThenLink),
            other => Err(format!("unknown format mode {other}")),
        }
    }
}

impl From<FormatMode> for u8 {
    fn from(value: FormatMode) -> Self {
        value.code()
    }
}

/// Identifies a persisted feed. Feeds of different types keep separate id
/// spaces on the server, so both parts are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub feed_type: FeedType,
    pub feed_id: i64,
}

impl FeedKey {
    pub fn new(feed_type: FeedType, feed_id: i64) -> Self {
        Self { feed_type, feed_id }
    }

    pub fn path(&self) -> String {
        format!("feeds/{}/{}", self.feed_type.code(), self.feed_id)
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feed_type.code(), self.feed_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    #[serde(default)]
    pub feed_id: Option<i64>,
    #[serde(default)]
    pub feed_type: FeedType,
    #[serde(default)]
    pub feed_url: String,
    #[serde(default = "default_schedule_period")]
    pub schedule_period: u32,
    #[serde(default = "default_max_stories")]
    pub max_stories_per_period: u32,
    #[serde(default)]
    pub format_mode: FormatMode,
    #[serde(default)]
    pub include_thumb: bool,
    #[serde(default)]
    pub include_video: bool,
    #[serde(default)]
    pub include_summary: bool,
    #[serde(default)]
    pub linked_list_mode: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub channel_id: Option<i64>,
    #[serde(default)]
    pub publish_to_stream: bool,
    #[serde(default)]
    pub bitly_login: Option<String>,
    #[serde(default)]
    pub bitly_api_key: Option<String>,
}

fn default_schedule_period() -> u32 {
    1
}

fn default_max_stories() -> u32 {
    1
}

impl Default for Feed {
    fn default() -> Self {
        Self {
            feed_id: None,
            feed_type: FeedType::Rss,
            feed_url: String::new(),
            schedule_period: default_schedule_period(),
            max_stories_per_period: default_max_stories(),
            format_mode: FormatMode::LinkedTitle,
            include_thumb: true,
            include_video: true,
            include_summary: false,
            linked_list_mode: false,
            title: None,
            link: None,
            description: None,
            username: None,
            channel_id: None,
            publish_to_stream: false,
            bitly_login: None,
            bitly_api_key: None,
        }
    }
}

impl Feed {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            feed_url: url.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> Option<FeedKey> {
        self.feed_id.map(|id| FeedKey::new(self.feed_type, id))
    }

    pub fn is_persisted(&self) -> bool {
        self.feed_id.is_some()
    }

    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|title| !title.trim().is_empty())
            .or(self.username.as_deref())
            .unwrap_or(&self.feed_url)
    }

    /// Fields that change what a preview renders.
    pub fn preview_fingerprint(&self) -> PreviewFingerprint {
        PreviewFingerprint {
            feed_url: self.feed_url.clone(),
            format_mode: self.format_mode,
            flags: [
                self.include_thumb,
                self.include_video,
                self.include_summary,
                self.linked_list_mode,
            ],
        }
    }

    /// Form pairs sent to the server. Optional flags are only present when
    /// set; server-owned attributes are never sent.
    pub fn form_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("feed_type".to_string(), self.feed_type.code().to_string()),
            ("feed_url".to_string(), self.feed_url.clone()),
            (
                "schedule_period".to_string(),
                self.schedule_period.to_string(),
            ),
            (
                "max_stories_per_period".to_string(),
                self.max_stories_per_period.to_string(),
            ),
            ("format_mode".to_string(), self.format_mode.code().to_string()),
        ];
        if let Some(id) = self.feed_id {
            pairs.push(("feed_id".to_string(), id.to_string()));
        }
        let flags = [
            ("linked_list_mode", self.linked_list_mode),
            ("include_thumb", self.include_thumb),
            ("include_summary", self.include_summary),
            ("include_video", self.include_video),
        ];
        for (name, value) in flags {
            if value {
                pairs.push((name.to_string(), "true".to_string()));
            }
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewFingerprint {
    feed_url: String,
    format_mode: FormatMode,
    flags: [bool; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub added: Option<String>,
    #[serde(default, deserialize_with = "truthy_reason")]
    pub overflow_reason: Option<String>,
    #[serde(flatten)]
    pub raw: BTreeMap<String, Value>,
}

impl Entry {
    pub fn is_overflow(&self) -> bool {
        self.overflow_reason.is_some()
    }

    pub fn status_label(&self) -> &str {
        if let Some(reason) = self.overflow_reason.as_deref() {
            return reason;
        }
        if self.published {
            "Published"
        } else {
            "Unpublished"
        }
    }

    pub fn action_label(&self) -> &'static str {
        if self.overflow_reason.is_some() {
            "Try Publishing Now"
        } else if self.published {
            "Republish Now"
        } else {
            "Publish Now"
        }
    }
}

fn truthy_reason<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) if n.as_f64().is_some_and(|v| v != 0.0) => Some(n.to_string()),
        Some(Value::Bool(true)) => Some("Overflow".to_string()),
        _ => None,
    })
}

/// A rendered preview post, kept as returned by the server.
pub type PreviewPost = Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Acl {
    #[serde(default)]
    pub any_user: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub immutable: bool,
}

impl Acl {
    pub fn readers_default() -> Self {
        Self {
            any_user: true,
            public: true,
            user_ids: Vec::new(),
            immutable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub readers: Acl,
    #[serde(default)]
    pub writers: Acl,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub you_subscribed: bool,
    #[serde(default)]
    pub you_can_edit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelMetadata {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_url: Option<String>,
}

impl Channel {
    pub fn is_broadcast(&self) -> bool {
        self.kind == BROADCAST_CHANNEL_TYPE
    }

    pub fn metadata(&self) -> ChannelMetadata {
        let found = self.annotations.iter().find_map(|annotation| {
            if annotation.kind != BROADCAST_METADATA_ANNOTATION {
                return None;
            }
            let title = annotation.value.get("title")?.as_str()?;
            let description = annotation.value.get("description")?.as_str()?;
            if title.is_empty() || description.is_empty() {
                return None;
            }
            Some(ChannelMetadata {
                title: title.to_string(),
                description: description.to_string(),
                fallback_url: annotation
                    .value
                    .get("fallback_url")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        });
        found.unwrap_or_else(|| ChannelMetadata {
            title: format!("Channel {}", self.id),
            description: String::new(),
            fallback_url: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewChannel {
    pub title: String,
    pub description: String,
    pub readers: Acl,
    pub writers: Acl,
}

impl NewChannel {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            readers: Acl::readers_default(),
            writers: Acl::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Oembed {
    pub value: Value,
    pub thumbnail: Option<(u32, u32)>,
}

const OEMBED_THUMB_BOX: u32 = 100;

impl Message {
    /// The oembed annotation, with its thumbnail scaled into a 100px box.
    pub fn oembed(&self) -> Option<Oembed> {
        let embed = self
            .annotations
            .iter()
            .find(|annotation| annotation.kind == OEMBED_ANNOTATION && !annotation.value.is_null())?;
        let value = &embed.value;
        let thumbnail = value
            .get("thumbnail_url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .and_then(|_| {
                let width = u32::try_from(value.get("thumbnail_width")?.as_u64()?).ok()?;
                let height = u32::try_from(value.get("thumbnail_height")?.as_u64()?).ok()?;
                Some(fit_to_box(
                    width,
                    height,
                    OEMBED_THUMB_BOX,
                    OEMBED_THUMB_BOX,
                    false,
                ))
            });
        Some(Oembed {
            value: value.clone(),
            thumbnail,
        })
    }
}

/// Scale `(w, h)` proportionally to fit inside `(max_w, max_h)`. Boxes that
/// already fit are returned unchanged unless `expand` is set.
pub fn fit_to_box(w: u32, h: u32, max_w: u32, max_h: u32, expand: bool) -> (u32, u32) {
    if w < max_w && h < max_h && !expand {
        return (w, h);
    }
    if w == 0 || h == 0 || max_w == 0 || max_h == 0 {
        return (0, 0);
    }
    let ratio = f64::max(w as f64 / max_w as f64, h as f64 / max_h as f64);
    ((w as f64 / ratio) as u32, (h as f64 / ratio) as u32)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub raw: BTreeMap<String, Value>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form_keys(feed: &Feed) -> Vec<String> {
        feed.form_pairs().into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn default_draft_matches_editor_defaults() {
        let feed = Feed::default();
        assert_eq!(feed.feed_type, FeedType::Rss);
        assert_eq!(feed.schedule_period, 1);
        assert_eq!(feed.max_stories_per_period, 1);
        assert_eq!(feed.format_mode, FormatMode::LinkedTitle);
        assert!(feed.include_thumb && feed.include_video);
        assert!(!feed.include_summary && !feed.linked_list_mode);
        assert!(feed.key().is_none());
    }

    #[test]
    fn form_strips_false_flags_and_keeps_true_ones() {
        let mut feed = Feed::with_url("http://example.com/rss");
        feed.include_thumb = false;
        feed.include_video = true;
        feed.include_summary = false;
        feed.linked_list_mode = true;
        let keys = form_keys(&feed);
        assert!(!keys.contains(&"include_thumb".to_string()));
        assert!(!keys.contains(&"include_summary".to_string()));
        assert!(keys.contains(&"include_video".to_string()));
        assert!(keys.contains(&"linked_list_mode".to_string()));
        assert!(feed
            .form_pairs()
            .contains(&("linked_list_mode".into(), "true".into())));
    }

    #[test]
    fn form_strips_every_optional_flag_when_all_false() {
        let feed = Feed {
            include_thumb: false,
            include_video: false,
            ..Feed::with_url("http://example.com/rss")
        };
        let keys = form_keys(&feed);
        for flag in OPTIONAL_FLAGS {
            assert!(!keys.contains(&flag.to_string()), "{flag} should be stripped");
        }
        assert!(keys.contains(&"feed_url".to_string()));
        assert!(keys.contains(&"schedule_period".to_string()));
        assert!(!keys.contains(&"publish_to_stream".to_string()));
    }

    #[test]
    fn feed_decodes_server_shape() {
        let feed: Feed = serde_json::from_value(json!({
            "feed_id": 12,
            "feed_type": 1,
            "feed_url": "http://example.com/rss",
            "include_summary": false,
            "format_mode": 2,
            "include_thumb": true,
            "include_video": false,
            "linked_list_mode": false,
            "schedule_period": 15,
            "max_stories_per_period": 2,
            "bitly_login": null,
            "bitly_api_key": null,
            "title": "Example",
            "link": "http://example.com",
            "description": "",
            "publish_to_stream": false
        }))
        .unwrap();
        assert_eq!(feed.key(), Some(FeedKey::new(FeedType::Rss, 12)));
        assert_eq!(feed.format_mode, FormatMode::TitleThenLink);
        assert_eq!(feed.display_title(), "Example");
        assert_eq!(FeedKey::new(FeedType::Rss, 12).path(), "feeds/1/12");
    }

    #[test]
    fn unknown_feed_type_is_rejected() {
        let result: Result<Feed, _> = serde_json::from_value(json!({"feed_type": 9}));
        assert!(result.is_err());
    }

    #[test]
    fn entry_overflow_reason_is_normalized() {
        let entry: Entry = serde_json::from_value(json!({
            "id": "a", "published": false, "overflow_reason": "Feed backed up"
        }))
        .unwrap();
        assert_eq!(entry.status_label(), "Feed backed up");
        assert_eq!(entry.action_label(), "Try Publishing Now");

        let entry: Entry =
            serde_json::from_value(json!({"id": "b", "published": true, "overflow_reason": ""}))
                .unwrap();
        assert!(!entry.is_overflow());
        assert_eq!(entry.status_label(), "Published");
        assert_eq!(entry.action_label(), "Republish Now");

        let entry: Entry =
            serde_json::from_value(json!({"id": "c", "overflow_reason": 0, "html": {"post": "x"}}))
                .unwrap();
        assert!(!entry.is_overflow());
        assert_eq!(entry.action_label(), "Publish Now");
        assert!(entry.raw.contains_key("html"));
    }

    #[test]
    fn channel_metadata_falls_back_to_id() {
        let channel: Channel = serde_json::from_value(json!({
            "id": "42",
            "type": BROADCAST_CHANNEL_TYPE,
            "annotations": [{"type": BROADCAST_METADATA_ANNOTATION, "value": {"title": "News"}}]
        }))
        .unwrap();
        let meta = channel.metadata();
        assert_eq!(meta.title, "Channel 42");
        assert_eq!(meta.description, "");
    }

    #[test]
    fn channel_metadata_reads_annotation() {
        let channel: Channel = serde_json::from_value(json!({
            "id": "7",
            "type": BROADCAST_CHANNEL_TYPE,
            "you_subscribed": true,
            "annotations": [
                {"type": "other", "value": {}},
                {"type": BROADCAST_METADATA_ANNOTATION, "value": {
                    "title": "Alerts", "description": "Breaking", "fallback_url": "http://x/channels/7/"
                }}
            ]
        }))
        .unwrap();
        assert!(channel.is_broadcast());
        let meta = channel.metadata();
        assert_eq!(meta.title, "Alerts");
        assert_eq!(meta.fallback_url.as_deref(), Some("http://x/channels/7/"));
    }

    #[test]
    fn fit_to_box_scales_down_only() {
        assert_eq!(fit_to_box(50, 40, 100, 100, false), (50, 40));
        assert_eq!(fit_to_box(400, 200, 100, 100, false), (100, 50));
        assert_eq!(fit_to_box(50, 25, 100, 100, true), (100, 50));
    }

    #[test]
    fn message_oembed_scales_thumbnail() {
        let message: Message = serde_json::from_value(json!({
            "id": "m1",
            "text": "hello",
            "annotations": [{"type": OEMBED_ANNOTATION, "value": {
                "thumbnail_url": "http://img", "thumbnail_width": 300, "thumbnail_height": 150
            }}]
        }))
        .unwrap();
        let embed = message.oembed().unwrap();
        assert_eq!(embed.thumbnail, Some((100, 50)));
    }

    #[test]
    fn oversized_thumbnail_dimensions_are_ignored() {
        let message: Message = serde_json::from_value(json!({
            "id": "m2",
            "text": "big",
            "annotations": [{"type": OEMBED_ANNOTATION, "value": {
                "thumbnail_url": "http://img",
                "thumbnail_width": 4_294_967_396_u64,
                "thumbnail_height": 150
            }}]
        }))
        .unwrap();
        let embed = message.oembed().unwrap();
        assert_eq!(embed.thumbnail, None);
    }
}
