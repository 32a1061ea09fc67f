use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, ReasoningError};
use crate::factory::SessionFactory;
use crate::identity::Identity;
use crate::llm::{Reasoner, ReasonerTurn};
use crate::metrics::DispatchMetrics;
use crate::registry::SessionRegistry;
use crate::session::AgentSession;
use crate::transport::{InboundMessage, InboundStream, Transport};

/// The only failure text a counterparty ever sees.
pub const APOLOGY: &str =
    "Sorry, I encountered an error while processing your request. Please try again later.";

/// How one inbound message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sent by the bot itself; dropped without a reply.
    SelfEcho,
    /// Nothing to answer (blank content).
    Ignored,
    Replied,
    Apologized,
    /// Neither the reply nor the apology could be delivered.
    Undelivered,
}

/// Routes each inbound message to its sender's session and replies on the
/// conversation it arrived on. Messages are handled strictly one at a time.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    factory: SessionFactory,
    reasoner: Arc<dyn Reasoner>,
    registry: SessionRegistry,
    metrics: DispatchMetrics,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        factory: SessionFactory,
        reasoner: Arc<dyn Reasoner>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            transport,
            factory,
            reasoner,
            registry,
            metrics: DispatchMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Consume `inbound` until it ends or `cancel` fires. A message already
    /// being handled is always finished first.
    pub async fn run(
        &mut self,
        mut inbound: InboundStream,
        cancel: CancellationToken,
        heartbeat: Duration,
    ) {
        info!(identity = %self.transport.identity(), "dispatcher ready, entering main loop");

        let mut heartbeat_interval = tokio::time::interval(heartbeat);
        heartbeat_interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("cancellation requested, dispatcher stopping");
                    break;
                }
                _ = heartbeat_interval.tick() => {
                    self.metrics.increment_uptime(heartbeat.as_secs());
                    info!(
                        metrics = %serde_json::to_string(&self.metrics).unwrap_or_default(),
                        success_rate = self.metrics.success_rate(),
                        sessions = self.registry.len(),
                        "heartbeat"
                    );
                }
                next = inbound.next() => {
                    match next {
                        Some(message) => {
                            self.handle(message).await;
                        }
                        None => {
                            warn!("inbound stream ended, dispatcher stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Handle one message. Never fails: every error ends in an apology or a log line.
    pub async fn handle(&mut self, message: InboundMessage) -> DispatchOutcome {
        self.metrics.record_received();

        if self.is_self_echo(&message.sender) {
            debug!(message_id = %message.id, "ignoring own message");
            self.metrics.record_self_echo();
            return DispatchOutcome::SelfEcho;
        }

        if message.content.trim().is_empty() {
            debug!(sender = %message.sender, message_id = %message.id, "ignoring empty message");
            self.metrics.record_ignored();
            return DispatchOutcome::Ignored;
        }

        info!(
            sender = %message.sender,
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            "received message"
        );

        match self.reply_for(&message).await {
            Ok(reply) => match self.transport.send(&message.conversation_id, &reply).await {
                Ok(()) => {
                    self.metrics.record_reply();
                    DispatchOutcome::Replied
                }
                Err(e) => {
                    error!(conversation_id = %message.conversation_id, error = %e, "failed to send reply");
                    self.metrics.record_delivery_failure();
                    DispatchOutcome::Undelivered
                }
            },
            Err(e) => {
                error!(sender = %message.sender, message_id = %message.id, error = %e, "failed to handle message");
                if matches!(e, DispatchError::Reasoning(_)) {
                    self.metrics.record_reasoning_failure();
                }
                self.apologize(&message.conversation_id).await
            }
        }
    }

    /// Look up the session for `identity`, creating it on first contact.
    pub async fn resolve_session(
        &mut self,
        identity: &Identity,
    ) -> Result<&mut AgentSession, DispatchError> {
        if !self.registry.contains(identity) {
            match self.factory.create(identity, &mut self.registry).await {
                Ok(report) => self.metrics.record_session_created(report.persistence_warnings),
                Err(e) => {
                    self.metrics.record_provisioning_failure();
                    return Err(e.into());
                }
            }
        }
        self.registry
            .get_mut(identity)
            .ok_or_else(|| DispatchError::SessionUnavailable(identity.clone()))
    }

    /// Identities are canonical on construction, so equality is the whole rule.
    fn is_self_echo(&self, sender: &Identity) -> bool {
        sender == self.transport.identity()
    }

    async fn reply_for(&mut self, message: &InboundMessage) -> Result<String, DispatchError> {
        let reasoner = Arc::clone(&self.reasoner);
        let session = self.resolve_session(&message.sender).await?;
        session.touch();

        let mut reply = String::new();
        {
            let mut increments = reasoner.respond(ReasonerTurn {
                instructions: &session.instructions,
                tools: session.tools.as_ref(),
                memory: &session.memory,
                text: &message.content,
            });
            while let Some(increment) = increments.next().await {
                reply.push_str(&increment?);
            }
        }

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(ReasoningError::EmptyResponse.into());
        }

        session
            .memory
            .record_exchange(message.content.as_str(), reply);
        Ok(reply.to_string())
    }

    async fn apologize(&mut self, conversation_id: &str) -> DispatchOutcome {
        match self.transport.send(conversation_id, APOLOGY).await {
            Ok(()) => {
                self.metrics.record_apology();
                DispatchOutcome::Apologized
            }
            Err(e) => {
                error!(conversation_id = %conversation_id, error = %e, "failed to send apology");
                self.metrics.record_delivery_failure();
                DispatchOutcome::Undelivered
            }
        }
    }
}
