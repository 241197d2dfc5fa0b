use std::sync::Arc;

use serde_json::json;

use crate::api::{self, Error};
use crate::data::ChannelService;
use crate::models::{Annotation, Channel, Message, NewChannel, BROADCAST_METADATA_ANNOTATION};

/// Broadcast channels visible to the session, split into the ones the user
/// follows and the ones they can post to.
pub struct Registry {
    service: Arc<dyn ChannelService>,
    subscribed: Vec<Channel>,
    writable: Vec<Channel>,
}

impl Registry {
    pub fn new(service: Arc<dyn ChannelService>) -> Self {
        Self {
            service,
            subscribed: Vec::new(),
            writable: Vec::new(),
        }
    }

    pub fn subscribed(&self) -> &[Channel] {
        &self.subscribed
    }

    pub fn writable(&self) -> &[Channel] {
        &self.writable
    }

    pub fn refresh(&mut self) -> api::Result<()> {
        let result = self.service.broadcast_channels();
        self.apply(result)
    }

    pub fn apply(&mut self, result: api::Result<Vec<Channel>>) -> api::Result<()> {
        let channels = result?;
        self.subscribed = channels
            .iter()
            .filter(|channel| channel.you_subscribed)
            .cloned()
            .collect();
        self.writable = channels
            .into_iter()
            .filter(|channel| channel.you_can_edit)
            .collect();
        log::debug!(
            "channels: {} subscribed, {} writable",
            self.subscribed.len(),
            self.writable.len()
        );
        Ok(())
    }

    /// Fetch one channel; anything but a broadcast channel is refused.
    pub fn get(&self, id: &str) -> api::Result<Channel> {
        let channel = self.service.channel(id)?;
        if !channel.is_broadcast() {
            return Err(Error::rejected(format!(
                "channel {id} is not a broadcast channel"
            )));
        }
        Ok(channel)
    }

    pub fn subscribe(&mut self, id: &str) -> api::Result<Channel> {
        let channel = self.service.subscribe(id)?;
        self.replace(channel.clone());
        Ok(channel)
    }

    pub fn unsubscribe(&mut self, id: &str) -> api::Result<Channel> {
        let channel = self.service.unsubscribe(id)?;
        self.replace(channel.clone());
        Ok(channel)
    }

    fn replace(&mut self, channel: Channel) {
        self.subscribed.retain(|existing| existing.id != channel.id);
        if channel.you_subscribed {
            self.subscribed.push(channel.clone());
        }
        if let Some(slot) = self
            .writable
            .iter_mut()
            .find(|existing| existing.id == channel.id)
        {
            *slot = channel;
        }
    }

    /// Create a broadcast channel, attach its metadata with a fallback url
    /// under `site_root`, and subscribe to it.
    pub fn create_broadcast(
        &mut self,
        new_channel: &NewChannel,
        site_root: &str,
    ) -> api::Result<Channel> {
        if new_channel.title.trim().is_empty() {
            return Err(Error::rejected("channel title is required"));
        }
        let created = self.service.create_channel(new_channel)?;
        let fallback_url = format!(
            "{}/channels/{}/",
            site_root.trim_end_matches('/'),
            created.id
        );
        let annotations = vec![Annotation {
            kind: BROADCAST_METADATA_ANNOTATION.to_string(),
            value: json!({
                "title": new_channel.title,
                "description": new_channel.description,
                "fallback_url": fallback_url,
            }),
        }];
        self.service.set_annotations(&created.id, annotations)?;
        log::info!("channels: created broadcast channel {}", created.id);
        self.subscribe(&created.id)
    }

    pub fn messages(&self, id: &str) -> api::Result<Vec<Message>> {
        self.service.messages(id)
    }

    pub fn send_message(&self, id: &str, text: &str) -> api::Result<Message> {
        self.service.create_message(id, text)
    }
}
