use std::sync::Arc;

use crate::api::{self, Error};
use crate::data::FeedService;
use crate::models::{Feed, FeedKey};

/// Feed list and current-feed selection for one session.
///
/// Selection by key may be requested before the list has arrived; it is
/// remembered and resolved by the next list refresh.
pub struct Registry {
    service: Arc<dyn FeedService>,
    feeds: Vec<Feed>,
    current: Feed,
    pending_selection: Option<FeedKey>,
    suppress_auto_select: bool,
    loaded: bool,
}

impl Registry {
    pub fn new(service: Arc<dyn FeedService>) -> Self {
        Self {
            service,
            feeds: Vec::new(),
            current: Feed::default(),
            pending_selection: None,
            suppress_auto_select: false,
            loaded: false,
        }
    }

    pub fn feeds(&self) -> &[Feed] {
        &self.feeds
    }

    pub fn current(&self) -> &Feed {
        &self.current
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn pending_selection(&self) -> Option<FeedKey> {
        self.pending_selection
    }

    pub fn find(&self, key: FeedKey) -> Option<&Feed> {
        self.feeds.iter().find(|feed| feed.key() == Some(key))
    }

    /// Mutate the current draft. Returns true when the change affects what a
    /// preview would render.
    pub fn edit_current<F>(&mut self, edit: F) -> bool
    where
        F: FnOnce(&mut Feed),
    {
        let before = self.current.preview_fingerprint();
        edit(&mut self.current);
        before != self.current.preview_fingerprint()
    }

    pub fn list(&mut self) -> api::Result<()> {
        let result = self.service.list_feeds();
        self.apply_list(result)
    }

    /// Apply the outcome of a feed list fetch.
    pub fn apply_list(&mut self, result: api::Result<Vec<Feed>>) -> api::Result<()> {
        let feeds = result?;
        log::debug!("feeds: list refreshed with {} feeds", feeds.len());
        self.feeds = feeds;
        self.loaded = true;

        if self.feeds.is_empty() {
            if let Some(key) = self.pending_selection.take() {
                log::warn!("feeds: selected feed {key} is not in an empty list");
            }
            if self.current.is_persisted() {
                self.current = Feed::default();
            }
            return Ok(());
        }

        if self.suppress_auto_select {
            self.suppress_auto_select = false;
            return Ok(());
        }

        if let Some(key) = self.pending_selection.take() {
            match self.find(key).cloned() {
                Some(feed) => self.current = feed,
                None => log::warn!("feeds: selected feed {key} is not in the list"),
            }
            return Ok(());
        }

        let fresh = self
            .current
            .key()
            .and_then(|key| self.find(key))
            .cloned();
        self.current = match fresh {
            Some(feed) => feed,
            None => self.feeds[0].clone(),
        };
        Ok(())
    }

    /// Select a persisted feed. Returns false when the feed is not known yet
    /// and the selection has been deferred to the next list refresh.
    pub fn select_existing(&mut self, key: FeedKey) -> bool {
        self.suppress_auto_select = false;
        match self.find(key).cloned() {
            Some(feed) => {
                self.current = feed;
                self.pending_selection = None;
                true
            }
            None => {
                log::debug!("feeds: deferring selection of {key}");
                self.pending_selection = Some(key);
                false
            }
        }
    }

    /// Start a fresh draft. The next list refresh will not replace it.
    pub fn select_new(&mut self) {
        self.current = Feed::default();
        self.pending_selection = None;
        self.suppress_auto_select = true;
    }

    pub fn validate(&self, draft: &Feed) -> api::Result<Feed> {
        self.service.validate_feed(draft)
    }

    pub fn create(&mut self, draft: &mut Feed) -> api::Result<FeedKey> {
        let created = self.service.create_feed(draft)?;
        let feed_id = created
            .feed_id
            .ok_or_else(|| Error::rejected("server did not return a feed id"))?;
        draft.feed_id = Some(feed_id);
        let key = FeedKey::new(created.feed_type, feed_id);
        log::info!("feeds: created feed {key}");

        self.suppress_auto_select = false;
        self.pending_selection = Some(key);
        if let Err(err) = self.list() {
            log::warn!("feeds: refresh after create failed: {err}");
            self.pending_selection = None;
            self.feeds.push(created.clone());
            self.current = created;
        }
        Ok(key)
    }

    pub fn update(&mut self, draft: &Feed) -> api::Result<FeedKey> {
        let key = draft
            .key()
            .ok_or_else(|| Error::rejected("feed has not been saved yet"))?;
        let updated = self.service.update_feed(key, draft)?;
        log::info!("feeds: updated feed {key}");

        self.suppress_auto_select = false;
        self.pending_selection = Some(key);
        if let Err(err) = self.list() {
            log::warn!("feeds: refresh after update failed: {err}");
            self.pending_selection = None;
            if let Some(slot) = self.feeds.iter_mut().find(|feed| feed.key() == Some(key)) {
                *slot = updated.clone();
            }
            self.current = updated;
        }
        Ok(key)
    }

    /// Create or update depending on whether the draft has an id.
    pub fn save(&mut self, draft: &mut Feed) -> api::Result<FeedKey> {
        if draft.is_persisted() {
            self.update(draft)
        } else {
            self.create(draft)
        }
    }

    pub fn save_current(&mut self) -> api::Result<FeedKey> {
        let mut draft = self.current.clone();
        let key = self.save(&mut draft)?;
        if self.current.key() != Some(key) {
            self.current.feed_id = draft.feed_id;
        }
        Ok(key)
    }

    /// Delete a feed and drop it from the local list. Unknown keys are a no-op.
    pub fn remove(&mut self, key: FeedKey) -> api::Result<()> {
        if self.find(key).is_none() {
            log::debug!("feeds: remove of unknown feed {key} ignored");
            return Ok(());
        }
        self.service.delete_feed(key)?;
        log::info!("feeds: removed feed {key}");
        self.feeds.retain(|feed| feed.key() != Some(key));
        if self.pending_selection == Some(key) {
            self.pending_selection = None;
        }
        if self.current.key() == Some(key) {
            self.current = self.feeds.first().cloned().unwrap_or_default();
        }
        Ok(())
    }
}
