//! Error taxonomy for message handling.
//!
//! Everything here is contained to the processing of a single inbound message;
//! only startup errors (config, keys, subscription) terminate the process.

use crate::identity::Identity;
use crate::signing::SigningError;

/// The provisioning collaborator rejected the configuration or prior state.
/// Fatal to session creation, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("provisioning rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("provisioning service unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },
    #[error("provisioning request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stored wallet state is not valid JSON: {0}")]
    InvalidPriorState(#[source] serde_json::Error),
    #[error("malformed provisioning response: {0}")]
    Malformed(String),
}

/// Wallet store read/write failure. Surfaced only as a logged warning.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("wallet store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wallet record encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("wallet record belongs to {found}, expected {expected}")]
    IdentityMismatch { expected: Identity, found: Identity },
}

/// The Reasoner failed or produced unusable output.
#[derive(Debug, thiserror::Error)]
pub enum ReasoningError {
    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed LLM response: {0}")]
    Malformed(String),
    #[error("tool-use loop exceeded {0} rounds")]
    ToolLoop(u32),
    #[error("reasoner produced an empty response")]
    EmptyResponse,
}

/// Sending a reply (or the apology) failed. Logged, never escalated.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("unknown conversation: {0:?}")]
    UnknownConversation(String),
    #[error("publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),
    #[error("failed to sign outbound message: {0}")]
    Signing(#[from] SigningError),
    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Establishing the inbound subscription failed. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("inbound stream already taken")]
    AlreadySubscribed,
    #[error("subscribe failed: {0}")]
    Subscribe(#[from] rumqttc::ClientError),
}

/// Failure while handling one message, before a reply could be produced.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error(transparent)]
    Reasoning(#[from] ReasoningError),
    #[error("session for {0} is not registered")]
    SessionUnavailable(Identity),
}
