use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{self, Body, Error, Result};
use crate::models::{
    Annotation, Channel, Entry, Feed, FeedKey, Message, NewChannel, PreviewPost, User,
    BROADCAST_CHANNEL_TYPE,
};

pub trait FeedService: Send + Sync {
    fn list_feeds(&self) -> Result<Vec<Feed>>;
    fn create_feed(&self, draft: &Feed) -> Result<Feed>;
    fn update_feed(&self, key: FeedKey, draft: &Feed) -> Result<Feed>;
    fn delete_feed(&self, key: FeedKey) -> Result<()>;
    fn validate_feed(&self, draft: &Feed) -> Result<Feed>;
    fn preview(&self, draft: &Feed) -> Result<Vec<PreviewPost>>;
}

pub trait EntryService: Send + Sync {
    fn latest_entries(&self, key: FeedKey) -> Result<Vec<Entry>>;
    fn unpublished_entries(&self, key: FeedKey) -> Result<Vec<Entry>>;
    fn publish_entry(&self, key: FeedKey, entry_id: &str) -> Result<()>;
}

pub trait ChannelService: Send + Sync {
    fn broadcast_channels(&self) -> Result<Vec<Channel>>;
    fn channel(&self, id: &str) -> Result<Channel>;
    fn create_channel(&self, channel: &NewChannel) -> Result<Channel>;
    fn set_annotations(&self, id: &str, annotations: Vec<Annotation>) -> Result<Channel>;
    fn subscribe(&self, id: &str) -> Result<Channel>;
    fn unsubscribe(&self, id: &str) -> Result<Channel>;
    fn messages(&self, id: &str) -> Result<Vec<Message>>;
    fn create_message(&self, id: &str, text: &str) -> Result<Message>;
}

pub trait UserService: Send + Sync {
    fn me(&self) -> Result<User>;
    fn token_scopes(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct EntryListing {
    #[serde(default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    scopes: Vec<String>,
}

fn annotations_param() -> Vec<(String, String)> {
    vec![("include_annotations".to_string(), "1".to_string())]
}

pub struct HttpFeedService {
    client: Arc<api::Client>,
}

impl HttpFeedService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

fn require_feed_id(feed: Feed, action: &str) -> Result<Feed> {
    if feed.feed_id.is_none() {
        return Err(Error::rejected(format!(
            "server did not return a feed id for {action}"
        )));
    }
    Ok(feed)
}

impl FeedService for HttpFeedService {
    fn list_feeds(&self) -> Result<Vec<Feed>> {
        self.client.get("feeds", &[])
    }

    fn create_feed(&self, draft: &Feed) -> Result<Feed> {
        let feed: Feed = self
            .client
            .post("feeds", Some(Body::Form(draft.form_pairs())))?;
        require_feed_id(feed, "create")
    }

    fn update_feed(&self, key: FeedKey, draft: &Feed) -> Result<Feed> {
        let feed: Feed = self
            .client
            .post(&key.path(), Some(Body::Form(draft.form_pairs())))?;
        require_feed_id(feed, "update")
    }

    fn delete_feed(&self, key: FeedKey) -> Result<()> {
        self.client.execute(Method::DELETE, &key.path(), &[], None)
    }

    fn validate_feed(&self, draft: &Feed) -> Result<Feed> {
        self.client
            .post("feeds/validate", Some(Body::Form(draft.form_pairs())))
    }

    fn preview(&self, draft: &Feed) -> Result<Vec<PreviewPost>> {
        let path = match draft.key() {
            Some(key) => format!("{}/preview", key.path()),
            None => "feed/preview".to_string(),
        };
        self.client.get(&path, &draft.form_pairs())
    }
}

impl EntryService for HttpFeedService {
    fn latest_entries(&self, key: FeedKey) -> Result<Vec<Entry>> {
        let listing: EntryListing = self.client.get(&format!("{}/latest", key.path()), &[])?;
        Ok(listing.entries)
    }

    fn unpublished_entries(&self, key: FeedKey) -> Result<Vec<Entry>> {
        let listing: EntryListing = self
            .client
            .get(&format!("{}/unpublished", key.path()), &[])?;
        Ok(listing.entries)
    }

    fn publish_entry(&self, key: FeedKey, entry_id: &str) -> Result<()> {
        if entry_id.trim().is_empty() {
            return Err(Error::rejected("entry id is required"));
        }
        let path = format!("{}/entries/{}/publish", key.path(), entry_id);
        self.client.execute(Method::POST, &path, &[], None)
    }
}

pub struct HttpChannelService {
    client: Arc<api::Client>,
}

impl HttpChannelService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl ChannelService for HttpChannelService {
    fn broadcast_channels(&self) -> Result<Vec<Channel>> {
        let mut params = annotations_param();
        params.push((
            "channel_types".to_string(),
            BROADCAST_CHANNEL_TYPE.to_string(),
        ));
        self.client.get("channels", &params)
    }

    fn channel(&self, id: &str) -> Result<Channel> {
        self.client
            .get(&format!("channels/{id}"), &annotations_param())
    }

    fn create_channel(&self, channel: &NewChannel) -> Result<Channel> {
        let body = json!({
            "type": BROADCAST_CHANNEL_TYPE,
            "readers": channel.readers,
            "writers": channel.writers,
        });
        self.client.post("channels", Some(Body::Json(body)))
    }

    fn set_annotations(&self, id: &str, annotations: Vec<Annotation>) -> Result<Channel> {
        let body = json!({ "annotations": annotations });
        self.client
            .put(&format!("channels/{id}"), Some(Body::Json(body)))
    }

    fn subscribe(&self, id: &str) -> Result<Channel> {
        self.client
            .envelope(
                Method::POST,
                &format!("channels/{id}/subscribe"),
                &annotations_param(),
                None,
            )?
            .into_data()
    }

    fn unsubscribe(&self, id: &str) -> Result<Channel> {
        self.client
            .envelope(
                Method::DELETE,
                &format!("channels/{id}/subscribe"),
                &annotations_param(),
                None,
            )?
            .into_data()
    }

    fn messages(&self, id: &str) -> Result<Vec<Message>> {
        self.client
            .get(&format!("channels/{id}/messages"), &annotations_param())
    }

    fn create_message(&self, id: &str, text: &str) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(Error::rejected("message text is required"));
        }
        let body = json!({ "text": text });
        self.client
            .post(&format!("channels/{id}/messages"), Some(Body::Json(body)))
    }
}

pub struct HttpUserService {
    client: Arc<api::Client>,
    upstream: Arc<api::Client>,
}

impl HttpUserService {
    pub fn new(client: Arc<api::Client>, upstream: Arc<api::Client>) -> Self {
        Self { client, upstream }
    }
}

impl UserService for HttpUserService {
    fn me(&self) -> Result<User> {
        self.client.get("me", &[])
    }

    fn token_scopes(&self) -> Result<Vec<String>> {
        let info: TokenInfo = self.upstream.get("token", &[])?;
        Ok(info.scopes)
    }
}

/// Scripted outcome for [`MemoryService::preview`].
#[derive(Debug, Clone)]
pub enum PreviewScript {
    /// Echo the draft's url back as a single post.
    Echo,
    Posts(Vec<PreviewPost>),
    Rejected(String),
    Unreachable,
}

#[derive(Debug)]
struct MemoryState {
    feeds: Vec<Feed>,
    next_feed_id: i64,
    entries: HashMap<FeedKey, Vec<Entry>>,
    published: Vec<(FeedKey, String)>,
    channels: Vec<Channel>,
    messages: HashMap<String, Vec<Message>>,
    next_channel_id: u64,
    user: Option<User>,
    scopes: Vec<String>,
    preview: PreviewScript,
    preview_calls: Vec<Feed>,
    list_calls: usize,
    reject_urls: Vec<String>,
}

/// In-process backend implementing every service trait, scripted by tests.
#[derive(Debug, Clone)]
pub struct MemoryService {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryService {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                feeds: Vec::new(),
                next_feed_id: 1,
                entries: HashMap::new(),
                published: Vec::new(),
                channels: Vec::new(),
                messages: HashMap::new(),
                next_channel_id: 1,
                user: None,
                scopes: vec!["basic".into(), "messages".into(), "write_post".into()],
                preview: PreviewScript::Echo,
                preview_calls: Vec::new(),
                list_calls: 0,
                reject_urls: Vec::new(),
            })),
        }
    }
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feeds(feeds: Vec<Feed>) -> Self {
        let service = Self::default();
        for feed in feeds {
            service.insert_feed(feed);
        }
        service
    }

    pub fn insert_feed(&self, mut feed: Feed) -> FeedKey {
        let mut state = self.state.lock();
        let id = match feed.feed_id {
            Some(id) => id,
            None => {
                let id = state.next_feed_id;
                feed.feed_id = Some(id);
                id
            }
        };
        state.next_feed_id = state.next_feed_id.max(id + 1);
        let key = FeedKey::new(feed.feed_type, id);
        state.feeds.push(feed);
        key
    }

    pub fn set_entries(&self, key: FeedKey, entries: Vec<Entry>) {
        self.state.lock().entries.insert(key, entries);
    }

    pub fn insert_channel(&self, channel: Channel) {
        self.state.lock().channels.push(channel);
    }

    pub fn insert_message(&self, channel_id: &str, message: Message) {
        self.state
            .lock()
            .messages
            .entry(channel_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn set_user(&self, user: User) {
        self.state.lock().user = Some(user);
    }

    pub fn set_scopes(&self, scopes: Vec<String>) {
        self.state.lock().scopes = scopes;
    }

    pub fn set_preview(&self, script: PreviewScript) {
        self.state.lock().preview = script;
    }

    /// Feed urls the validate/create endpoints refuse.
    pub fn reject_url(&self, url: impl Into<String>) {
        self.state.lock().reject_urls.push(url.into());
    }

    pub fn preview_calls(&self) -> Vec<Feed> {
        self.state.lock().preview_calls.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn published(&self) -> Vec<(FeedKey, String)> {
        self.state.lock().published.clone()
    }

    pub fn feeds(&self) -> Vec<Feed> {
        self.state.lock().feeds.clone()
    }

    fn check_url(state: &MemoryState, draft: &Feed) -> Result<()> {
        if draft.feed_url.trim().is_empty() || state.reject_urls.contains(&draft.feed_url) {
            return Err(Error::rejected("The url you entred is not a valid feed."));
        }
        Ok(())
    }

    fn channel_mut<'a>(state: &'a mut MemoryState, id: &str) -> Result<&'a mut Channel> {
        state
            .channels
            .iter_mut()
            .find(|channel| channel.id == id)
            .ok_or_else(|| Error::Http {
                status: 404,
                body: format!("channel {id} not found"),
            })
    }
}

fn not_found(key: FeedKey) -> Error {
    Error::rejected(format!("Can't find feed {key}"))
}

impl FeedService for MemoryService {
    fn list_feeds(&self) -> Result<Vec<Feed>> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        Ok(state.feeds.clone())
    }

    fn create_feed(&self, draft: &Feed) -> Result<Feed> {
        {
            let state = self.state.lock();
            Self::check_url(&state, draft)?;
        }
        let mut feed = draft.clone();
        feed.feed_id = None;
        let key = self.insert_feed(feed.clone());
        feed.feed_id = Some(key.feed_id);
        Ok(feed)
    }

    fn update_feed(&self, key: FeedKey, draft: &Feed) -> Result<Feed> {
        let mut state = self.state.lock();
        Self::check_url(&state, draft)?;
        let slot = state
            .feeds
            .iter_mut()
            .find(|feed| feed.key() == Some(key))
            .ok_or_else(|| not_found(key))?;
        let mut updated = draft.clone();
        updated.feed_id = Some(key.feed_id);
        updated.feed_type = key.feed_type;
        *slot = updated.clone();
        Ok(updated)
    }

    fn delete_feed(&self, key: FeedKey) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.feeds.len();
        state.feeds.retain(|feed| feed.key() != Some(key));
        if state.feeds.len() == before {
            return Err(not_found(key));
        }
        state.entries.remove(&key);
        Ok(())
    }

    fn validate_feed(&self, draft: &Feed) -> Result<Feed> {
        let state = self.state.lock();
        Self::check_url(&state, draft)?;
        let mut feed = draft.clone();
        if feed.title.is_none() {
            feed.title = Some(draft.feed_url.clone());
        }
        Ok(feed)
    }

    fn preview(&self, draft: &Feed) -> Result<Vec<PreviewPost>> {
        let mut state = self.state.lock();
        state.preview_calls.push(draft.clone());
        match &state.preview {
            PreviewScript::Echo => Ok(vec![json!({ "feed_url": draft.feed_url })]),
            PreviewScript::Posts(posts) => Ok(posts.clone()),
            PreviewScript::Rejected(message) => Err(Error::rejected(message.clone())),
            PreviewScript::Unreachable => Err(Error::Http {
                status: 502,
                body: "bad gateway".into(),
            }),
        }
    }
}

impl EntryService for MemoryService {
    fn latest_entries(&self, key: FeedKey) -> Result<Vec<Entry>> {
        let state = self.state.lock();
        Ok(state
            .entries
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.published || entry.is_overflow())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn unpublished_entries(&self, key: FeedKey) -> Result<Vec<Entry>> {
        let state = self.state.lock();
        Ok(state
            .entries
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| !entry.published)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn publish_entry(&self, key: FeedKey, entry_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&key)
            .and_then(|entries| entries.iter_mut().find(|entry| entry.id == entry_id))
            .ok_or_else(|| Error::rejected("Can't find that entry"))?;
        entry.published = true;
        entry.overflow_reason = None;
        state.published.push((key, entry_id.to_string()));
        Ok(())
    }
}

impl ChannelService for MemoryService {
    fn broadcast_channels(&self) -> Result<Vec<Channel>> {
        let state = self.state.lock();
        Ok(state
            .channels
            .iter()
            .filter(|channel| channel.is_broadcast())
            .cloned()
            .collect())
    }

    fn channel(&self, id: &str) -> Result<Channel> {
        let mut state = self.state.lock();
        Self::channel_mut(&mut state, id).map(|channel| channel.clone())
    }

    fn create_channel(&self, channel: &NewChannel) -> Result<Channel> {
        let mut state = self.state.lock();
        let id = state.next_channel_id;
        state.next_channel_id += 1;
        let created = Channel {
            id: id.to_string(),
            kind: BROADCAST_CHANNEL_TYPE.to_string(),
            readers: channel.readers.clone(),
            writers: channel.writers.clone(),
            annotations: Vec::new(),
            you_subscribed: false,
            you_can_edit: true,
        };
        state.channels.push(created.clone());
        Ok(created)
    }

    fn set_annotations(&self, id: &str, annotations: Vec<Annotation>) -> Result<Channel> {
        let mut state = self.state.lock();
        let channel = Self::channel_mut(&mut state, id)?;
        channel.annotations = annotations;
        Ok(channel.clone())
    }

    fn subscribe(&self, id: &str) -> Result<Channel> {
        let mut state = self.state.lock();
        let channel = Self::channel_mut(&mut state, id)?;
        channel.you_subscribed = true;
        Ok(channel.clone())
    }

    fn unsubscribe(&self, id: &str) -> Result<Channel> {
        let mut state = self.state.lock();
        let channel = Self::channel_mut(&mut state, id)?;
        channel.you_subscribed = false;
        Ok(channel.clone())
    }

    fn messages(&self, id: &str) -> Result<Vec<Message>> {
        let state = self.state.lock();
        Ok(state.messages.get(id).cloned().unwrap_or_default())
    }

    fn create_message(&self, id: &str, text: &str) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(Error::rejected("message text is required"));
        }
        let mut state = self.state.lock();
        Self::channel_mut(&mut state, id)?;
        let messages = state.messages.entry(id.to_string()).or_default();
        let message = Message {
            id: format!("{}-{}", id, messages.len() + 1),
            text: text.to_string(),
            annotations: Vec::new(),
        };
        messages.insert(0, message.clone());
        Ok(message)
    }
}

impl UserService for MemoryService {
    fn me(&self) -> Result<User> {
        self.state
            .lock()
            .user
            .clone()
            .ok_or(Error::Unauthorized { status: 401 })
    }

    fn token_scopes(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().scopes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeedType;

    #[test]
    fn memory_create_assigns_increasing_ids() {
        let service = MemoryService::new();
        let a = service.create_feed(&Feed::with_url("http://a/rss")).unwrap();
        let b = service.create_feed(&Feed::with_url("http://b/rss")).unwrap();
        assert_eq!(a.feed_id, Some(1));
        assert_eq!(b.feed_id, Some(2));
        assert_eq!(service.list_feeds().unwrap().len(), 2);
    }

    #[test]
    fn memory_delete_unknown_feed_is_rejected() {
        let service = MemoryService::new();
        let err = service
            .delete_feed(FeedKey::new(FeedType::Rss, 99))
            .unwrap_err();
        assert_eq!(err.kind(), api::ErrorKind::Validation);
    }

    #[test]
    fn memory_validate_rejects_configured_urls() {
        let service = MemoryService::new();
        service.reject_url("http://broken/");
        assert!(service.validate_feed(&Feed::with_url("http://broken/")).is_err());
        let feed = service.validate_feed(&Feed::with_url("http://fine/")).unwrap();
        assert_eq!(feed.title.as_deref(), Some("http://fine/"));
    }
}
