use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::api::{self, ClientConfig, TokenProvider};
use crate::channels;
use crate::config::Config;
use crate::data::{
    ChannelService, EntryService, FeedService, HttpChannelService, HttpFeedService,
    HttpUserService, MemoryService, UserService,
};
use crate::debounce::{Debouncer, LatestRequest};
use crate::entries::{self, EntrySets};
use crate::feeds;
use crate::models::{Channel, Feed, FeedKey, Message, NewChannel, PreviewPost, User};
use crate::preview::PreviewState;
use crate::session;

/// The backends the controller talks to.
#[derive(Clone)]
pub struct Services {
    pub feeds: Arc<dyn FeedService>,
    pub entries: Arc<dyn EntryService>,
    pub channels: Arc<dyn ChannelService>,
    pub users: Arc<dyn UserService>,
}

impl Services {
    pub fn memory(service: MemoryService) -> Self {
        let service = Arc::new(service);
        Self {
            feeds: service.clone(),
            entries: service.clone(),
            channels: service.clone(),
            users: service,
        }
    }

    /// HTTP services for the feed API and the upstream channel API, both
    /// authenticated through `tokens`.
    pub fn connect(config: &Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = api::Client::new(
            tokens.clone(),
            ClientConfig {
                base_url: config.api.base_url.clone(),
                user_agent: config.api.user_agent.clone(),
                timeout: config.api.timeout,
                http_client: None,
            },
        )
        .context("app: build feed api client")?;
        let upstream = api::Client::new(
            tokens,
            ClientConfig {
                base_url: config.api.upstream_url.clone(),
                user_agent: config.api.user_agent.clone(),
                timeout: config.api.timeout,
                http_client: None,
            },
        )
        .context("app: build upstream api client")?;

        let client = Arc::new(client);
        let upstream = Arc::new(upstream);
        let feed_service = Arc::new(HttpFeedService::new(client.clone()));
        Ok(Self {
            feeds: feed_service.clone(),
            entries: feed_service,
            channels: Arc::new(HttpChannelService::new(upstream.clone())),
            users: Arc::new(HttpUserService::new(client, upstream)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

pub struct AppState {
    pub feeds: feeds::Registry,
    pub preview: PreviewState,
    pub entries: Option<EntrySets>,
    pub channels: channels::Registry,
    /// The single place user-facing outcomes are reported.
    pub notice: Option<Notice>,
    pub needs_login: bool,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub debounce: Duration,
    pub site_root: String,
}

impl Options {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: config.preview.debounce,
            site_root: config.api.site_root.clone(),
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

enum AsyncResponse {
    FeedList {
        request_id: u64,
        result: api::Result<Vec<Feed>>,
    },
    Preview {
        request_id: u64,
        result: api::Result<Vec<PreviewPost>>,
    },
    Entries {
        request_id: u64,
        key: FeedKey,
        result: api::Result<EntrySets>,
    },
    Channels {
        request_id: u64,
        result: api::Result<Vec<Channel>>,
    },
}

/// Owns the application state. Fetches run on worker threads and their
/// results are applied by [`App::poll`] or [`App::settle`] on the owning
/// thread; user-initiated mutations run inline.
pub struct App {
    state: AppState,
    services: Services,
    session: Option<Arc<session::Manager>>,
    site_root: String,
    debouncer: Debouncer,
    list_request: LatestRequest,
    preview_request: LatestRequest,
    entries_request: LatestRequest,
    channels_request: LatestRequest,
    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
}

impl App {
    pub fn new(services: Services, options: Options) -> Self {
        let (response_tx, response_rx) = unbounded();
        let state = AppState {
            feeds: feeds::Registry::new(services.feeds.clone()),
            preview: PreviewState::default(),
            entries: None,
            channels: channels::Registry::new(services.channels.clone()),
            notice: None,
            needs_login: false,
        };
        Self {
            state,
            services,
            session: None,
            site_root: options.site_root,
            debouncer: Debouncer::new(options.debounce),
            list_request: LatestRequest::new(),
            preview_request: LatestRequest::new(),
            entries_request: LatestRequest::new(),
            channels_request: LatestRequest::new(),
            response_tx,
            response_rx,
        }
    }

    pub fn with_session(mut self, session: Arc<session::Manager>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn current(&self) -> &Feed {
        self.state.feeds.current()
    }

    pub fn take_notice(&mut self) -> Option<Notice> {
        self.state.notice.take()
    }

    /// True while a tracked request is outstanding or a preview is scheduled.
    pub fn is_busy(&self) -> bool {
        self.list_request.is_pending()
            || self.preview_request.is_pending()
            || self.entries_request.is_pending()
            || self.channels_request.is_pending()
            || self.debouncer.is_armed()
    }

    pub fn start(&mut self) {
        self.refresh_feeds();
    }

    pub fn refresh_feeds(&mut self) {
        let request_id = self.list_request.issue();
        let service = self.services.feeds.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.list_feeds();
            let _ = tx.send(AsyncResponse::FeedList { request_id, result });
        });
    }

    /// Select a saved feed. When it is not loaded yet the selection waits for
    /// the next list, which is requested if none is in flight.
    pub fn select_feed(&mut self, key: FeedKey) -> bool {
        let before = self.current().key();
        let selected = self.state.feeds.select_existing(key);
        if selected {
            if before != Some(key) {
                self.current_changed();
            }
        } else if !self.list_request.is_pending() {
            self.refresh_feeds();
        }
        selected
    }

    pub fn new_feed(&mut self) {
        self.state.feeds.select_new();
        self.current_changed();
    }

    /// Apply an edit to the current draft and reschedule the preview if the
    /// edit affects it.
    pub fn edit_draft<F>(&mut self, now: Instant, edit: F) -> bool
    where
        F: FnOnce(&mut Feed),
    {
        let changed = self.state.feeds.edit_current(edit);
        if changed {
            self.debouncer.schedule(now);
        }
        changed
    }

    /// Fire the preview once the debounce delay has passed. Returns true when
    /// a preview request was issued.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.debouncer.fire_if_due(now) {
            return false;
        }
        if self.current().feed_url.trim().is_empty() {
            self.preview_request.abandon();
            self.state.preview.reset();
            return false;
        }
        self.request_preview();
        true
    }

    fn request_preview(&mut self) {
        let request_id = self.preview_request.issue();
        self.state.preview.begin();
        let draft = self.current().clone();
        let service = self.services.feeds.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.preview(&draft);
            let _ = tx.send(AsyncResponse::Preview { request_id, result });
        });
    }

    pub fn refresh_entries(&mut self) {
        if let Some(key) = self.current().key() {
            self.request_entries(key);
        }
    }

    fn request_entries(&mut self, key: FeedKey) {
        let request_id = self.entries_request.issue();
        let service = self.services.entries.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = entries::fetch(service.as_ref(), key);
            let _ = tx.send(AsyncResponse::Entries {
                request_id,
                key,
                result,
            });
        });
    }

    pub fn refresh_channels(&mut self) {
        let request_id = self.channels_request.issue();
        let service = self.services.channels.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.broadcast_channels();
            let _ = tx.send(AsyncResponse::Channels { request_id, result });
        });
    }

    /// Apply every response that has arrived. Never blocks.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_async_response(message);
            changed = true;
        }
        changed
    }

    /// Drive the controller until nothing is outstanding or `timeout`
    /// elapses. A scheduled preview fires when its delay passes. Returns
    /// false on timeout.
    pub fn settle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            let now = Instant::now();
            self.tick(now);
            if !self.is_busy() {
                return true;
            }
            if now >= deadline {
                log::warn!("app: gave up waiting for outstanding requests");
                return false;
            }
            let wake = match self.debouncer.deadline() {
                Some(fire_at) if fire_at < deadline => fire_at,
                _ => deadline,
            };
            match self
                .response_rx
                .recv_timeout(wake.saturating_duration_since(now))
            {
                Ok(message) => self.handle_async_response(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn handle_async_response(&mut self, message: AsyncResponse) {
        match message {
            AsyncResponse::FeedList { request_id, result } => {
                if !self.list_request.complete(request_id) {
                    log::warn!("app: dropping stale feed list response {request_id}");
                    return;
                }
                let before = self.current().key();
                match self.state.feeds.apply_list(result) {
                    Ok(()) => {
                        if self.current().key() != before {
                            self.current_changed();
                        }
                    }
                    Err(err) => self.report("Loading feeds", &err),
                }
            }
            AsyncResponse::Preview { request_id, result } => {
                if !self.preview_request.complete(request_id) {
                    log::warn!("app: dropping stale preview response {request_id}");
                    return;
                }
                // Preview outcomes live in the preview state; only a lost
                // session is reported beyond it.
                if let Err(err) = &result {
                    if err.is_unauthorized() {
                        self.report("Preview", err);
                    }
                }
                self.state.preview.apply(result);
            }
            AsyncResponse::Entries {
                request_id,
                key,
                result,
            } => {
                if !self.entries_request.complete(request_id) || self.current().key() != Some(key)
                {
                    log::warn!("app: dropping stale entries response for {key}");
                    return;
                }
                match result {
                    Ok(sets) => self.state.entries = Some(sets),
                    Err(err) => self.report("Loading entries", &err),
                }
            }
            AsyncResponse::Channels { request_id, result } => {
                if !self.channels_request.complete(request_id) {
                    log::warn!("app: dropping stale channel list response {request_id}");
                    return;
                }
                if let Err(err) = self.state.channels.apply(result) {
                    self.report("Loading channels", &err);
                }
            }
        }
    }

    fn current_changed(&mut self) {
        self.debouncer.cancel();
        self.preview_request.abandon();
        self.entries_request.abandon();
        self.state.preview.reset();
        self.state.entries = None;
        log::debug!("app: current feed is now {:?}", self.current().key());
        if !self.current().feed_url.trim().is_empty() {
            self.request_preview();
        }
        self.refresh_entries();
    }

    pub fn validate_current(&mut self) -> api::Result<Feed> {
        let draft = self.current().clone();
        let result = self.state.feeds.validate(&draft);
        self.track("Validating feed", result)
    }

    /// Create or update the current draft. A list refresh already in flight
    /// is superseded by the one the save performs.
    pub fn save_current(&mut self) -> api::Result<FeedKey> {
        self.list_request.abandon();
        let before = self.current().key();
        let result = self.state.feeds.save_current();
        let key = self.track("Saving feed", result)?;
        self.notify(format!("Saved {}", self.current().display_title()));
        if before == Some(key) {
            self.request_entries(key);
        } else {
            self.current_changed();
        }
        Ok(key)
    }

    pub fn delete_feed(&mut self, key: FeedKey) -> api::Result<()> {
        self.list_request.abandon();
        let before = self.current().key();
        let result = self.state.feeds.remove(key);
        self.track("Deleting feed", result)?;
        self.notify(format!("Deleted feed {key}"));
        if self.current().key() != before {
            self.current_changed();
        }
        Ok(())
    }

    pub fn delete_current(&mut self) -> api::Result<()> {
        let key = self.current_key("Deleting feed")?;
        self.delete_feed(key)
    }

    pub fn publish_entry(&mut self, entry_id: &str) -> api::Result<()> {
        let key = self.current_key("Publishing entry")?;
        self.entries_request.abandon();
        let result = entries::publish(self.services.entries.as_ref(), key, entry_id);
        let sets = self.track("Publishing entry", result)?;
        self.state.entries = Some(sets);
        self.notify(format!("Published entry {entry_id}"));
        Ok(())
    }

    pub fn channel(&mut self, id: &str) -> api::Result<Channel> {
        let result = self.state.channels.get(id);
        self.track("Loading channel", result)
    }

    pub fn messages(&mut self, id: &str) -> api::Result<Vec<Message>> {
        let result = self.state.channels.messages(id);
        self.track("Loading messages", result)
    }

    pub fn send_message(&mut self, id: &str, text: &str) -> api::Result<Message> {
        let result = self.state.channels.send_message(id, text);
        let message = self.track("Sending message", result)?;
        self.notify(format!("Sent message {}", message.id));
        Ok(message)
    }

    pub fn subscribe(&mut self, id: &str) -> api::Result<Channel> {
        self.channels_request.abandon();
        let result = self.state.channels.subscribe(id);
        let channel = self.track("Subscribing", result)?;
        self.notify(format!("Subscribed to {}", channel.metadata().title));
        Ok(channel)
    }

    pub fn unsubscribe(&mut self, id: &str) -> api::Result<Channel> {
        self.channels_request.abandon();
        let result = self.state.channels.unsubscribe(id);
        let channel = self.track("Unsubscribing", result)?;
        self.notify(format!("Unsubscribed from {}", channel.metadata().title));
        Ok(channel)
    }

    pub fn create_channel(&mut self, new_channel: &NewChannel) -> api::Result<Channel> {
        self.channels_request.abandon();
        let result = self
            .state
            .channels
            .create_broadcast(new_channel, &self.site_root);
        let channel = self.track("Creating channel", result)?;
        self.notify(format!("Created channel {}", channel.id));
        Ok(channel)
    }

    pub fn login(&mut self, redirect_url: &str) -> Result<User> {
        let Some(session) = self.session.clone() else {
            bail!("app: no session configured");
        };
        let user = session.login(redirect_url, self.services.users.as_ref())?;
        self.state.needs_login = false;
        self.notify(format!("Logged in as {}", user.display_name()));
        Ok(user)
    }

    /// Where the user was when the server last turned them away.
    pub fn take_next_path(&mut self) -> Option<String> {
        self.session.as_ref().and_then(|session| session.take_next_path())
    }

    pub fn logout(&mut self) -> Result<()> {
        let Some(session) = self.session.clone() else {
            bail!("app: no session configured");
        };
        session.logout()?;
        self.notify("Logged out");
        Ok(())
    }

    pub fn verify_scopes(&mut self) -> Result<()> {
        let Some(session) = self.session.clone() else {
            bail!("app: no session configured");
        };
        if let Err(err) = session.verify_scopes(self.services.users.as_ref()) {
            self.state.notice = Some(Notice::error(format!("{err:#}")));
            return Err(err);
        }
        Ok(())
    }

    /// The logged-in user, re-resolved from the server.
    pub fn whoami(&mut self) -> Result<User> {
        let Some(session) = self.session.clone() else {
            bail!("app: no session configured");
        };
        session.refresh_user(self.services.users.as_ref())
    }

    fn current_key(&mut self, action: &str) -> api::Result<FeedKey> {
        let result = self
            .current()
            .key()
            .ok_or_else(|| api::Error::rejected("feed has not been saved yet"));
        self.track(action, result)
    }

    fn track<T>(&mut self, action: &str, result: api::Result<T>) -> api::Result<T> {
        if let Err(err) = &result {
            self.report(action, err);
        }
        result
    }

    fn notify(&mut self, message: impl Into<String>) {
        self.state.notice = Some(Notice::info(message));
    }

    fn report(&mut self, action: &str, err: &api::Error) {
        log::warn!("app: {action} failed: {err}");
        if err.is_unauthorized() {
            self.state.needs_login = true;
            let path = self.current_path();
            if let Some(session) = &self.session {
                if let Err(err) = session.remember_path(&path) {
                    log::warn!("app: could not remember {path}: {err:#}");
                }
            }
        }
        self.state.notice = Some(Notice::error(format!("{action} failed: {err}")));
    }

    fn current_path(&self) -> String {
        match self.current().key() {
            Some(key) => format!("/{}/", key.path()),
            None => "/feeds/new/".to_string(),
        }
    }
}
