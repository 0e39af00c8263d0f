//! Notification channel announcing new users.

use std::borrow::Cow;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::{Client, Msg, RedisError};
use tokio::time::timeout;

/// Error related to the subscription.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot subscribe: {0}")]
    Redis(#[from] RedisError),
    #[error("subscription connection closed")]
    Closed,
}

/// Notification carrying the id of a user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    id: Vec<u8>,
}

impl NotificationEvent {
    /// Create a new [`NotificationEvent`] from a raw payload.
    pub fn new(payload: &[u8]) -> Self {
        Self {
            id: payload.to_vec(),
        }
    }

    /// Record id as published, possibly empty or not UTF-8.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// Record id for logs.
    pub fn lossy_id(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.id)
    }
}

/// What the channel handed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(NotificationEvent),
    /// Anything that is not a message published on our channel.
    Control,
}

impl Delivery {
    /// Sort a pub/sub message received while subscribed to `subscribed`.
    pub fn classify(
        subscribed: &str,
        channel: &str,
        from_pattern: bool,
        payload: &[u8],
    ) -> Self {
        if from_pattern || channel != subscribed {
            Self::Control
        } else {
            Self::Event(NotificationEvent::new(payload))
        }
    }
}

/// Port delivering notifications one at a time.
#[async_trait]
pub trait EventSource: Send {
    /// Wait up to `wait` for the next delivery.
    ///
    /// `Ok(None)` means nothing arrived in time.
    async fn next_delivery(
        &mut self,
        wait: Duration,
    ) -> Result<Option<Delivery>, ChannelError>;
}

type MessageStream = Pin<Box<dyn Stream<Item = Msg> + Send>>;

/// Redis pub/sub subscription to a single channel.
pub struct RedisChannel {
    client: Client,
    channel: String,
    messages: Option<MessageStream>,
}

impl RedisChannel {
    /// Subscribe to `channel`.
    pub async fn subscribe(
        client: Client,
        channel: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        let mut this = Self {
            client,
            channel: channel.into(),
            messages: None,
        };
        this.connect().await?;

        Ok(this)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn connect(&mut self) -> Result<(), ChannelError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        tracing::info!(channel = %self.channel, "subscribed");

        self.messages = Some(Box::pin(pubsub.into_on_message()));
        Ok(())
    }
}

#[async_trait]
impl EventSource for RedisChannel {
    async fn next_delivery(
        &mut self,
        wait: Duration,
    ) -> Result<Option<Delivery>, ChannelError> {
        // resubscribe after a lost connection.
        if self.messages.is_none() {
            self.connect().await?;
        }
        let Some(messages) = self.messages.as_mut() else {
            return Err(ChannelError::Closed);
        };

        match timeout(wait, messages.next()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => Ok(Some(Delivery::classify(
                &self.channel,
                msg.get_channel_name(),
                msg.from_pattern(),
                msg.get_payload_bytes(),
            ))),
            Ok(None) => {
                self.messages = None;
                Err(ChannelError::Closed)
            },
        }
    }
}

/// Scripted source, for tests.
#[cfg(test)]
pub struct ScriptedSource {
    script: std::collections::VecDeque<Result<Option<Delivery>, ChannelError>>,
    exhausted: std::sync::Arc<tokio::sync::Notify>,
}

#[cfg(test)]
impl ScriptedSource {
    pub fn new(
        script: impl IntoIterator<Item = Result<Option<Delivery>, ChannelError>>,
    ) -> Self {
        Self {
            script: script.into_iter().collect(),
            exhausted: Default::default(),
        }
    }

    pub fn events(ids: &[&str]) -> Self {
        Self::new(
            ids.iter()
                .map(|id| Ok(Some(Delivery::Event(NotificationEvent::new(id.as_bytes()))))),
        )
    }

    /// Notified once every scripted delivery has been consumed.
    pub fn exhausted(&self) -> std::sync::Arc<tokio::sync::Notify> {
        std::sync::Arc::clone(&self.exhausted)
    }
}

#[cfg(test)]
#[async_trait]
impl EventSource for ScriptedSource {
    async fn next_delivery(
        &mut self,
        wait: Duration,
    ) -> Result<Option<Delivery>, ChannelError> {
        match self.script.pop_front() {
            Some(delivery) => delivery,
            None => {
                self.exhausted.notify_one();
                tokio::time::sleep(wait).await;
                Ok(None)
            },
        }
    }
}
