use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::{DeliveryError, TransportError};
use crate::identity::Identity;

/// One inbound message as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    pub sender: Identity,
    /// Identity of the bot the transport delivered this to.
    pub receiver: Identity,
    pub conversation_id: String,
    pub content: String,
    pub sent_at: i64,
}

/// Every inbound message across all conversations, in delivery order.
pub type InboundStream = BoxStream<'static, InboundMessage>;

/// Messaging network the agent listens and replies on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The bot's own canonical identity on this network.
    fn identity(&self) -> &Identity;

    /// Subscribe once to all conversations. No filtering happens here; self-echo
    /// suppression belongs to the dispatcher.
    async fn subscribe_all(&self) -> Result<InboundStream, TransportError>;

    /// Resolve `conversation_id` and send `text` to it.
    async fn send(&self, conversation_id: &str, text: &str) -> Result<(), DeliveryError>;
}
