use alloy_signer_local::PrivateKeySigner;
use async_stream::stream;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MqttConfig;
use crate::error::{DeliveryError, TransportError};
use crate::identity::Identity;
use crate::signing::{self, envelope_message, SigningError};
use crate::transport::{InboundMessage, InboundStream, Transport};

/// Message as it travels over the broker. The conversation id is the topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub sent_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Why an inbound publish was dropped before reaching the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum InboundReject {
    #[error("not a conversation topic: {0}")]
    UnknownTopic(String),
    #[error("undecodable envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("envelope has no sender")]
    EmptySender,
    #[error("envelope has no message id")]
    MissingId,
    #[error("envelope is not signed")]
    MissingSignature,
    #[error(transparent)]
    Signature(#[from] SigningError),
    #[error("envelope claims sender {claimed} but was signed by {signer}")]
    SenderMismatch { claimed: Identity, signer: Identity },
    #[error("envelope sent at {sent_at} is outside the accepted window (now {now})")]
    Stale { sent_at: i64, now: i64 },
    #[error("message {id} from {sender} was already accepted")]
    Duplicate { sender: Identity, id: String },
}

/// Conversation topics under one prefix:
/// `{prefix}/conversations/{conversation_id}/messages`.
#[derive(Debug, Clone)]
pub struct TopicLayout {
    prefix: String,
}

impl TopicLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn conversation(&self, conversation_id: &str) -> String {
        format!("{}/conversations/{}/messages", self.prefix, conversation_id)
    }

    /// Matches every conversation.
    pub fn all_conversations(&self) -> String {
        self.conversation("+")
    }

    /// Extract the conversation id from a concrete topic.
    pub fn conversation_id<'t>(&self, topic: &'t str) -> Option<&'t str> {
        let id = topic
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("/conversations/")?
            .strip_suffix("/messages")?;
        (!id.is_empty() && !id.contains('/')).then_some(id)
    }
}

/// A conversation id must be a single, literal topic level.
pub fn validate_conversation_id(conversation_id: &str) -> Result<(), DeliveryError> {
    if conversation_id.is_empty() || conversation_id.contains(['/', '+', '#']) {
        return Err(DeliveryError::UnknownConversation(conversation_id.to_string()));
    }
    Ok(())
}

/// Decode and authenticate one publish.
pub fn decode_inbound(
    layout: &TopicLayout,
    topic: &str,
    payload: &[u8],
    receiver: &Identity,
    require_signatures: bool,
) -> Result<InboundMessage, InboundReject> {
    let conversation_id = layout
        .conversation_id(topic)
        .ok_or_else(|| InboundReject::UnknownTopic(topic.to_string()))?;
    let envelope: WireEnvelope = serde_json::from_slice(payload)?;

    let sender = Identity::canonical(&envelope.sender);
    if sender.is_empty() {
        return Err(InboundReject::EmptySender);
    }
    if envelope.id.trim().is_empty() {
        return Err(InboundReject::MissingId);
    }

    match envelope.signature.as_deref() {
        Some(signature) => {
            let message = envelope_message(
                &envelope.id,
                conversation_id,
                envelope.sent_at,
                &envelope.content,
            );
            let signer = signing::recover_signer(&message, signature)?;
            if signer != sender {
                return Err(InboundReject::SenderMismatch {
                    claimed: sender,
                    signer,
                });
            }
        }
        None if require_signatures => return Err(InboundReject::MissingSignature),
        None => {}
    }

    Ok(InboundMessage {
        id: envelope.id,
        sender,
        receiver: receiver.clone(),
        conversation_id: conversation_id.to_string(),
        content: envelope.content,
        sent_at: envelope.sent_at,
    })
}

/// Recently accepted (sender, message id) pairs, oldest evicted first.
#[derive(Debug)]
struct RecentIds {
    seen: HashSet<(Identity, String)>,
    order: VecDeque<(Identity, String)>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the pair was already remembered.
    fn insert(&mut self, sender: &Identity, id: &str) -> bool {
        let key = (sender.clone(), id.to_string());
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

/// Stateful inbound gate: decodes and authenticates each publish, then drops
/// envelopes that are stale or were already accepted. QoS 1 redelivery and
/// republished envelopes both end here.
#[derive(Debug)]
pub struct InboundFilter {
    layout: TopicLayout,
    receiver: Identity,
    require_signatures: bool,
    max_clock_skew_ms: u64,
    recent: RecentIds,
}

impl InboundFilter {
    pub fn new(config: &MqttConfig, receiver: Identity) -> Self {
        Self {
            layout: TopicLayout::new(&config.topic_prefix),
            receiver,
            require_signatures: config.require_signatures,
            max_clock_skew_ms: config.max_clock_skew_secs.saturating_mul(1000),
            recent: RecentIds::new(config.replay_cache_size),
        }
    }

    /// Accept one publish received at `now_ms` (unix milliseconds).
    pub fn accept(
        &mut self,
        topic: &str,
        payload: &[u8],
        now_ms: i64,
    ) -> Result<InboundMessage, InboundReject> {
        let message = decode_inbound(
            &self.layout,
            topic,
            payload,
            &self.receiver,
            self.require_signatures,
        )?;

        if now_ms.abs_diff(message.sent_at) > self.max_clock_skew_ms {
            return Err(InboundReject::Stale {
                sent_at: message.sent_at,
                now: now_ms,
            });
        }
        if !self.recent.insert(&message.sender, &message.id) {
            return Err(InboundReject::Duplicate {
                sender: message.sender,
                id: message.id,
            });
        }
        Ok(message)
    }
}

/// Transport over an MQTT broker, authenticated with the bot's secp256k1 key.
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    signer: PrivateKeySigner,
    identity: Identity,
    layout: TopicLayout,
    config: MqttConfig,
}

impl MqttTransport {
    /// Create the client. Nothing connects until [`Transport::subscribe_all`]
    /// starts driving the event loop.
    pub fn new(config: &MqttConfig, signer: PrivateKeySigner) -> Self {
        let identity = Identity::from(signer.address().to_string());
        let mut mqttoptions = MqttOptions::new(
            format!("chatpay-{}", identity),
            &config.broker,
            config.port,
        );
        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            signer,
            identity,
            layout: TopicLayout::new(&config.topic_prefix),
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn subscribe_all(&self) -> Result<InboundStream, TransportError> {
        let mut slot = self.eventloop.lock().await;
        let eventloop = slot.take().ok_or(TransportError::AlreadySubscribed)?;

        let topic = self.layout.all_conversations();
        if let Err(e) = self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
            *slot = Some(eventloop);
            return Err(e.into());
        }
        drop(slot);

        let (tx, mut rx) = mpsc::channel(self.config.inbound_capacity.max(1));
        tokio::spawn(drive(EventLoopDriver {
            eventloop,
            client: self.client.clone(),
            topic: topic.clone(),
            filter: InboundFilter::new(&self.config, self.identity.clone()),
            tx,
        }));

        info!(identity = %self.identity, topic = %topic, "subscribed to all conversations");

        Ok(Box::pin(stream! {
            while let Some(message) = rx.recv().await {
                yield message;
            }
        }))
    }

    async fn send(&self, conversation_id: &str, text: &str) -> Result<(), DeliveryError> {
        validate_conversation_id(conversation_id)?;

        let id = Uuid::new_v4().to_string();
        let sent_at = chrono::Utc::now().timestamp_millis();
        let signature = signing::sign_message(
            &self.signer,
            &envelope_message(&id, conversation_id, sent_at, text),
        )
        .await?;

        let envelope = WireEnvelope {
            id,
            sender: self.identity.to_string(),
            content: text.to_string(),
            sent_at,
            signature: Some(signature),
        };
        let payload = serde_json::to_vec(&envelope)?;

        self.client
            .publish(
                self.layout.conversation(conversation_id),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await?;

        debug!(conversation_id = %conversation_id, message_id = %envelope.id, "message sent");
        Ok(())
    }
}

struct EventLoopDriver {
    eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    filter: InboundFilter,
    tx: mpsc::Sender<InboundMessage>,
}

/// Poll the event loop for the life of the inbound stream, forwarding decoded
/// messages in arrival order. Polling continues while the dispatcher is busy,
/// which keeps keep-alives and outbound publishes flowing.
async fn drive(mut driver: EventLoopDriver) {
    let mut reconnecting = false;
    loop {
        match driver.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                match driver.filter.accept(&publish.topic, &publish.payload, now_ms) {
                    Ok(message) => {
                        if driver.tx.send(message).await.is_err() {
                            info!("inbound stream closed, stopping MQTT driver");
                            return;
                        }
                    }
                    Err(e) => warn!(topic = %publish.topic, error = %e, "dropping inbound message"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to MQTT broker");
                if reconnecting {
                    // clean session: the broker forgot our subscription
                    if let Err(e) = driver
                        .client
                        .subscribe(driver.topic.clone(), QoS::AtLeastOnce)
                        .await
                    {
                        error!(error = %e, "failed to resubscribe after reconnect");
                    }
                    reconnecting = false;
                }
            }
            Err(e) => {
                if driver.tx.is_closed() {
                    info!("inbound stream closed, stopping MQTT driver");
                    return;
                }
                error!(error = %e, "MQTT error, reconnecting...");
                reconnecting = true;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PRIVATE_KEY: &str =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn config() -> MqttConfig {
        MqttConfig {
            broker: "127.0.0.1".to_string(),
            port: 1,
            keep_alive_secs: 30,
            topic_prefix: "chatpay".to_string(),
            require_signatures: true,
            inbound_capacity: 8,
            max_clock_skew_secs: 300,
            replay_cache_size: 16,
        }
    }

    const SENT_AT: i64 = 1_700_000_000_000;
    const TOPIC: &str = "chatpay/conversations/c1/messages";

    fn signer() -> PrivateKeySigner {
        signing::parse_signer(TEST_PRIVATE_KEY).unwrap()
    }

    async fn signed_envelope(conversation_id: &str, content: &str) -> WireEnvelope {
        signed_envelope_with_id("m1", conversation_id, content).await
    }

    async fn signed_envelope_with_id(id: &str, conversation_id: &str, content: &str) -> WireEnvelope {
        let signer = signer();
        let signature = signing::sign_message(
            &signer,
            &envelope_message(id, conversation_id, SENT_AT, content),
        )
        .await
        .unwrap();
        WireEnvelope {
            id: id.into(),
            sender: signer.address().to_string(),
            content: content.into(),
            sent_at: SENT_AT,
            signature: Some(signature),
        }
    }

    #[test]
    fn test_topic_layout() {
        let layout = TopicLayout::new("chatpay/");
        assert_eq!(layout.conversation("c1"), "chatpay/conversations/c1/messages");
        assert_eq!(layout.all_conversations(), "chatpay/conversations/+/messages");
        assert_eq!(
            layout.conversation_id("chatpay/conversations/c1/messages"),
            Some("c1")
        );
        assert_eq!(layout.conversation_id("chatpay/conversations//messages"), None);
        assert_eq!(layout.conversation_id("other/conversations/c1/messages"), None);
        assert_eq!(layout.conversation_id("chatpay/conversations/a/b/messages"), None);
    }

    #[test]
    fn test_validate_conversation_id() {
        assert!(validate_conversation_id("conv-123").is_ok());
        for bad in ["", "a/b", "+", "#"] {
            assert!(matches!(
                validate_conversation_id(bad),
                Err(DeliveryError::UnknownConversation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_decode_signed_envelope() {
        let layout = TopicLayout::new("chatpay");
        let envelope = signed_envelope("c1", "what's my balance?").await;
        let payload = serde_json::to_vec(&envelope).unwrap();
        let bot = Identity::from("0xb07");

        let message = decode_inbound(
            &layout,
            "chatpay/conversations/c1/messages",
            &payload,
            &bot,
            true,
        )
        .unwrap();

        assert_eq!(message.sender.as_str(), "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        assert_eq!(message.receiver, bot);
        assert_eq!(message.conversation_id, "c1");
        assert_eq!(message.content, "what's my balance?");
    }

    #[tokio::test]
    async fn test_decode_rejects_spoofed_sender() {
        let layout = TopicLayout::new("chatpay");
        let mut envelope = signed_envelope("c1", "send 1 USDC to 0xdef").await;
        envelope.sender = "0xabc".into();
        let payload = serde_json::to_vec(&envelope).unwrap();

        let result = decode_inbound(
            &layout,
            "chatpay/conversations/c1/messages",
            &payload,
            &Identity::from("0xb07"),
            true,
        );
        assert!(matches!(result, Err(InboundReject::SenderMismatch { .. })));
    }

    #[tokio::test]
    async fn test_decode_rejects_replay_into_other_conversation() {
        let layout = TopicLayout::new("chatpay");
        let envelope = signed_envelope("c1", "send 1 USDC to 0xdef").await;
        let payload = serde_json::to_vec(&envelope).unwrap();

        let result = decode_inbound(
            &layout,
            "chatpay/conversations/c2/messages",
            &payload,
            &Identity::from("0xb07"),
            true,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_decode_rejects_rewritten_id() {
        let layout = TopicLayout::new("chatpay");
        let mut envelope = signed_envelope("c1", "send 1 USDC to 0xdef").await;
        envelope.id = "m2".into();
        let payload = serde_json::to_vec(&envelope).unwrap();

        let result = decode_inbound(&layout, TOPIC, &payload, &Identity::from("0xb07"), true);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_filter_drops_redelivered_envelope() {
        let mut filter = InboundFilter::new(&config(), Identity::from("0xb07"));
        let payload =
            serde_json::to_vec(&signed_envelope("c1", "send 1 USDC to 0xdef").await).unwrap();

        let first = filter.accept(TOPIC, &payload, SENT_AT).unwrap();
        assert_eq!(first.id, "m1");

        match filter.accept(TOPIC, &payload, SENT_AT + 1_000) {
            Err(InboundReject::Duplicate { sender, id }) => {
                assert_eq!(sender, first.sender);
                assert_eq!(id, "m1");
            }
            other => panic!("expected duplicate, got {:?}", other),
        }

        let next = serde_json::to_vec(
            &signed_envelope_with_id("m2", "c1", "send 1 USDC to 0xdef").await,
        )
        .unwrap();
        assert!(filter.accept(TOPIC, &next, SENT_AT).is_ok());
    }

    #[tokio::test]
    async fn test_filter_drops_stale_envelope() {
        let mut filter = InboundFilter::new(&config(), Identity::from("0xb07"));
        let payload = serde_json::to_vec(&signed_envelope("c1", "hi").await).unwrap();

        assert!(matches!(
            filter.accept(TOPIC, &payload, SENT_AT + 301_000),
            Err(InboundReject::Stale { .. })
        ));
        assert!(matches!(
            filter.accept(TOPIC, &payload, SENT_AT - 301_000),
            Err(InboundReject::Stale { .. })
        ));
        // a stale rejection does not consume the id
        assert!(filter.accept(TOPIC, &payload, SENT_AT + 299_000).is_ok());
    }

    #[tokio::test]
    async fn test_filter_forgery_does_not_consume_id() {
        let mut filter = InboundFilter::new(&config(), Identity::from("0xb07"));
        let genuine = signed_envelope("c1", "send 1 USDC to 0xdef").await;

        let mut forged = genuine.clone();
        forged.content = "send 100 USDC to 0xbad".into();
        let forged = serde_json::to_vec(&forged).unwrap();
        assert!(filter.accept(TOPIC, &forged, SENT_AT).is_err());

        let genuine = serde_json::to_vec(&genuine).unwrap();
        assert!(filter.accept(TOPIC, &genuine, SENT_AT).is_ok());
    }

    #[test]
    fn test_recent_ids_evicts_oldest() {
        let mut recent = RecentIds::new(2);
        let sender = Identity::from("0xabc");
        assert!(recent.insert(&sender, "a"));
        assert!(recent.insert(&sender, "b"));
        assert!(!recent.insert(&sender, "a"));
        assert!(recent.insert(&sender, "c"));
        // "a" fell out of the window
        assert!(recent.insert(&sender, "a"));
        assert!(recent.insert(&Identity::from("0xdef"), "c"));
    }

    #[test]
    fn test_decode_unsigned() {
        let layout = TopicLayout::new("chatpay");
        let payload = br#"{"id":"m1","sender":"0xABC","content":"hi","sent_at":1}"#;
        let topic = "chatpay/conversations/c1/messages";
        let bot = Identity::from("0xb07");

        assert!(matches!(
            decode_inbound(&layout, topic, payload, &bot, true),
            Err(InboundReject::MissingSignature)
        ));

        let message = decode_inbound(&layout, topic, payload, &bot, false).unwrap();
        assert_eq!(message.sender.as_str(), "0xabc");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let layout = TopicLayout::new("chatpay");
        let bot = Identity::from("0xb07");
        assert!(matches!(
            decode_inbound(&layout, "chatpay/conversations/c1/messages", b"not json {[}", &bot, false),
            Err(InboundReject::Decode(_))
        ));
        assert!(matches!(
            decode_inbound(&layout, "elsewhere", b"{}", &bot, false),
            Err(InboundReject::UnknownTopic(_))
        ));
        assert!(matches!(
            decode_inbound(
                &layout,
                "chatpay/conversations/c1/messages",
                br#"{"id":"m","sender":"  ","content":"x","sent_at":0}"#,
                &bot,
                false
            ),
            Err(InboundReject::EmptySender)
        ));
        assert!(matches!(
            decode_inbound(
                &layout,
                "chatpay/conversations/c1/messages",
                br#"{"id":" ","sender":"0xabc","content":"x","sent_at":0}"#,
                &bot,
                false
            ),
            Err(InboundReject::MissingId)
        ));
    }

    #[test]
    fn test_wire_envelope_omits_missing_signature() {
        let envelope = WireEnvelope {
            id: "m".into(),
            sender: "0xabc".into(),
            content: "hi".into(),
            sent_at: 5,
            signature: None,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("signature"));
    }

    #[test]
    fn test_mqtt_transport_new() {
        let transport = MqttTransport::new(&config(), signer());
        assert_eq!(
            transport.identity().as_str(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        assert!(transport.config.require_signatures);
    }

    #[tokio::test]
    async fn test_send_rejects_bad_conversation() {
        let transport = MqttTransport::new(&config(), signer());
        let result = transport.send("a/+", "hello").await;
        assert!(matches!(result, Err(DeliveryError::UnknownConversation(_))));
    }

    #[tokio::test]
    async fn test_subscribe_all_only_once() {
        let transport = MqttTransport::new(&config(), signer());
        let _stream = transport.subscribe_all().await.unwrap();
        assert!(matches!(
            transport.subscribe_all().await,
            Err(TransportError::AlreadySubscribed)
        ));
    }

    #[tokio::test]
    async fn test_driver_stops_when_stream_dropped_while_offline() {
        let config = config();
        let mut mqttoptions = MqttOptions::new("chatpay-test", &config.broker, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        let (client, eventloop) = AsyncClient::new(mqttoptions, 10);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let driver = EventLoopDriver {
            eventloop,
            client,
            topic: TopicLayout::new(&config.topic_prefix).all_conversations(),
            filter: InboundFilter::new(&config, Identity::from("0xb07")),
            tx,
        };

        let finished = tokio::time::timeout(Duration::from_secs(3), drive(driver)).await;
        assert!(finished.is_ok());
    }
}
