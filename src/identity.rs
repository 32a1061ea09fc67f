//! Counterparty identity.
//!
//! Every identity that enters the agent (inbound sender, the bot's own
//! address, wallet store keys, registry keys) goes through [`Identity::canonical`],
//! so comparisons never depend on how a transport happened to case an address.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identifier for one messaging counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Canonicalize a raw sender address: surrounding whitespace trimmed, ASCII lower-cased.
    pub fn canonical(raw: &str) -> Self {
        Self(raw.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// File-name safe key for durable storage.
    ///
    /// Identities made only of `[a-z0-9.-]` (every EVM address) are used as-is;
    /// anything else is hex-encoded behind a `_` prefix, which can never collide
    /// with the plain form since `_` is outside the plain alphabet.
    pub fn storage_key(&self) -> String {
        let plain = !self.0.is_empty()
            && !self.0.starts_with('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
        if plain {
            self.0.clone()
        } else {
            format!("_{}", hex::encode(self.0.as_bytes()))
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(raw: &str) -> Self {
        Self::canonical(raw)
    }
}

impl From<String> for Identity {
    fn from(raw: String) -> Self {
        Self::canonical(&raw)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}
