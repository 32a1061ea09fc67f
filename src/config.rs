use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub const DEFAULT_NETWORK_ID: &str = "base-sepolia";
pub const DEFAULT_TOKEN_SYMBOL: &str = "USDC";
/// USDC on Base Sepolia.
pub const DEFAULT_TOKEN_CONTRACT: &str = "0x036CbD53842c5426634e7929541eC2318f3dCF7e";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,

    /// MQTT broker configuration
    pub mqtt: MqttConfig,

    pub llm: LlmConfig,

    pub wallet: WalletConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hex secp256k1 key that is the bot's identity on the messaging network
    pub private_key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_true")]
    pub require_signatures: bool,
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    /// Inbound envelopes whose `sent_at` is further than this from local time are dropped
    #[serde(default = "default_max_clock_skew")]
    pub max_clock_skew_secs: u64,
    /// How many recent (sender, message id) pairs are remembered for duplicate detection
    #[serde(default = "default_replay_cache_size")]
    pub replay_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default)]
    pub gateway_url: String,
    #[serde(default)]
    pub credential_name: String,
    #[serde(default)]
    pub credential_key: String,
    #[serde(default = "default_network_id")]
    pub network_id: String,
    #[serde(default = "default_token_symbol")]
    pub token_symbol: String,
    #[serde(default = "default_token_contract")]
    pub token_contract: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub wallet_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 0 keeps every session for the life of the process
    #[serde(default)]
    pub max_sessions: usize,
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_topic_prefix() -> String {
    "chatpay".to_string()
}

fn default_true() -> bool {
    true
}

fn default_inbound_capacity() -> usize {
    100
}

fn default_max_clock_skew() -> u64 {
    300
}

fn default_replay_cache_size() -> usize {
    4096
}

fn default_llm_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_llm_model() -> String {
    "claude-3-5-sonnet-latest".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_max_tool_rounds() -> u32 {
    8
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_network_id() -> String {
    DEFAULT_NETWORK_ID.to_string()
}

fn default_token_symbol() -> String {
    DEFAULT_TOKEN_SYMBOL.to_string()
}

fn default_token_contract() -> String {
    DEFAULT_TOKEN_CONTRACT.to_string()
}

fn default_max_history_turns() -> usize {
    20
}

fn default_heartbeat() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wallet_dir: "data/wallets".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 0,
            max_history_turns: default_max_history_turns(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(
            broker = %config.mqtt.broker,
            network_id = %config.wallet.network_id,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Overlay settings from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *target = value;
            }
        };

        set(&mut self.llm.base_url, "LLM_BASE_URL");
        set(&mut self.llm.api_key, "LLM_API_KEY");
        set(&mut self.llm.model, "LLM_MODEL");
        set(&mut self.wallet.gateway_url, "WALLET_GATEWAY_URL");
        set(&mut self.wallet.credential_name, "WALLET_API_KEY_NAME");
        set(&mut self.wallet.credential_key, "WALLET_API_KEY_PRIVATE");
        set(&mut self.wallet.network_id, "NETWORK_ID");
        set(&mut self.agent.private_key_path, "AGENT_PRIVATE_KEY_PATH");
        set(&mut self.mqtt.broker, "MQTT_BROKER");
    }

    /// Check required settings. An empty network id falls back to the default test network.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.wallet.network_id.trim().is_empty() {
            self.wallet.network_id = default_network_id();
        }

        let required = [
            ("agent.private_key_path", &self.agent.private_key_path),
            ("llm.api_key", &self.llm.api_key),
            ("wallet.gateway_url", &self.wallet.gateway_url),
            ("wallet.credential_name", &self.wallet.credential_name),
            ("wallet.credential_key", &self.wallet.credential_key),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(field));
            }
        }

        if self.mqtt.inbound_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "mqtt.inbound_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.mqtt.replay_cache_size == 0 {
            return Err(ConfigError::Invalid {
                field: "mqtt.replay_cache_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.mqtt.topic_prefix.contains(['+', '#']) {
            return Err(ConfigError::Invalid {
                field: "mqtt.topic_prefix",
                reason: "must not contain MQTT wildcards".to_string(),
            });
        }
        if self.llm.max_tool_rounds == 0 {
            return Err(ConfigError::Invalid {
                field: "llm.max_tool_rounds",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.dispatch.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatch.heartbeat_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
