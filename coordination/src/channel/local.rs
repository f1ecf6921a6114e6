//! In-process channel hub.
//!
//! Every participant's [`LocalChannel`] publishes into one Tokio broadcast
//! channel, so all participants observe the same event stream in the same
//! order. Posts to a channel can be made to fail on demand, which is how the
//! proposal fallback path is exercised.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    parse_mentions, AnnotationEvent, ChannelError, ChannelEvent, ChannelHandle, ChatChannel,
    InboundMessage, MessageHandle,
};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct HubLog {
    messages: Vec<InboundMessage>,
    annotations: Vec<AnnotationEvent>,
    failing: HashSet<String>,
}

/// Shared in-memory channel.
pub struct LocalChannelHub {
    sender: broadcast::Sender<ChannelEvent>,
    next_id: AtomicU64,
    log: Mutex<HubLog>,
}

impl LocalChannelHub {
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            sender,
            next_id: AtomicU64::new(1),
            log: Mutex::new(HubLog::default()),
        })
    }

    /// A view of the hub that posts as `identity`.
    pub fn channel_for(self: &Arc<Self>, identity: &str) -> LocalChannel {
        LocalChannel {
            hub: Arc::clone(self),
            identity: identity.to_string(),
        }
    }

    /// Make every post to `channel_id` fail until [`Self::restore`] is called.
    pub fn fail_posts_to(&self, channel_id: &str) {
        self.lock().failing.insert(channel_id.to_string());
    }

    pub fn restore(&self, channel_id: &str) {
        self.lock().failing.remove(channel_id);
    }

    /// Messages posted to `channel_id`, oldest first.
    pub fn messages_in(&self, channel_id: &str) -> Vec<InboundMessage> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.handle.channel_id == channel_id)
            .cloned()
            .collect()
    }

    /// Handle of the message with `message_id`, in any channel.
    pub fn find(&self, message_id: &str) -> Option<MessageHandle> {
        self.lock()
            .messages
            .iter()
            .find(|m| m.handle.message_id == message_id)
            .map(|m| m.handle.clone())
    }

    /// Annotations currently attached to `message`.
    pub fn annotations_on(&self, message: &MessageHandle) -> Vec<AnnotationEvent> {
        self.lock()
            .annotations
            .iter()
            .filter(|a| &a.handle == message)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: ChannelEvent) {
        // No receivers is fine; the log still records the traffic.
        match self.sender.send(event) {
            Ok(count) => debug!(receivers = count, "Channel event published"),
            Err(_) => debug!("Channel event published (no receivers)"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One participant's view of a [`LocalChannelHub`].
#[derive(Clone)]
pub struct LocalChannel {
    hub: Arc<LocalChannelHub>,
    identity: String,
}

impl LocalChannel {
    /// Withdraw an annotation previously added by this participant.
    pub fn retract(&self, message: &MessageHandle, symbol: &str) {
        let event = AnnotationEvent {
            handle: message.clone(),
            author: self.identity.clone(),
            symbol: symbol.to_string(),
            added: false,
        };
        {
            let mut log = self.hub.lock();
            log.annotations.retain(|a| {
                !(a.handle == event.handle && a.author == event.author && a.symbol == event.symbol)
            });
        }
        self.hub.publish(ChannelEvent::Annotation(event));
    }

    pub fn hub(&self) -> &Arc<LocalChannelHub> {
        &self.hub
    }
}

#[async_trait]
impl ChatChannel for LocalChannel {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn fetch(&self, channel_id: &str) -> Result<ChannelHandle, ChannelError> {
        if channel_id.trim().is_empty() {
            return Err(ChannelError::NotFound(channel_id.to_string()));
        }
        Ok(ChannelHandle {
            channel_id: channel_id.to_string(),
        })
    }

    async fn post(
        &self,
        channel: &ChannelHandle,
        content: &str,
    ) -> Result<MessageHandle, ChannelError> {
        let message = {
            let mut log = self.hub.lock();
            if log.failing.contains(&channel.channel_id) {
                return Err(ChannelError::Delivery {
                    channel: channel.channel_id.clone(),
                    reason: "channel rejected the post".to_string(),
                });
            }
            let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst);
            let message = InboundMessage {
                handle: MessageHandle {
                    channel_id: channel.channel_id.clone(),
                    message_id: id.to_string(),
                },
                author: self.identity.clone(),
                content: content.to_string(),
                mentions: parse_mentions(content),
                timestamp: Utc::now(),
            };
            log.messages.push(message.clone());
            message
        };
        let handle = message.handle.clone();
        self.hub.publish(ChannelEvent::Message(message));
        Ok(handle)
    }

    async fn annotate(&self, message: &MessageHandle, symbol: &str) -> Result<(), ChannelError> {
        let event = AnnotationEvent {
            handle: message.clone(),
            author: self.identity.clone(),
            symbol: symbol.to_string(),
            added: true,
        };
        {
            let mut log = self.hub.lock();
            if !log.messages.iter().any(|m| &m.handle == message) {
                return Err(ChannelError::MessageNotFound(message.message_id.clone()));
            }
            log.annotations.push(event.clone());
        }
        self.hub.publish(ChannelEvent::Annotation(event));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.hub.subscribe()
    }
}
