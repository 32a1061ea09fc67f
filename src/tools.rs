//! Wallet-bound tool sets exposed to the reasoner.
//!
//! A [`WalletProvisioner`] turns credentials plus optional prior wallet state
//! into a [`WalletTools`] bound to one wallet. The tool set can be exported
//! back to an opaque blob for the wallet store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::ProvisioningError;
use crate::identity::Identity;

pub const GET_WALLET_DETAILS: &str = "get_wallet_details";
pub const GET_BALANCE: &str = "get_balance";
pub const TRANSFER: &str = "transfer";
pub const REQUEST_FAUCET_FUNDS: &str = "request_faucet_funds";

/// Tool execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(msg.into()),
        }
    }

    /// Text handed back to the model as the tool result content.
    pub fn to_content(&self) -> String {
        match &self.error {
            Some(e) => format!("Error: {}", e),
            None => self.output.to_string(),
        }
    }
}

/// Tool definition for LLM function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// What the provisioning collaborator needs to build a wallet tool set.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub identity: Identity,
    pub credential_name: String,
    pub credential_key: String,
    /// Payload of the last persisted wallet record, if any.
    pub prior_state: Option<String>,
    pub network_id: String,
}

/// Financial actions scoped to a single wallet.
#[async_trait]
pub trait WalletTools: Send + Sync {
    /// On-chain address of the bound wallet.
    fn address(&self) -> &str;

    fn network_id(&self) -> &str;

    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run one tool. Failures are reported in the result, not as `Err`, so the
    /// model can decide whether to retry or explain.
    async fn invoke(&self, name: &str, input: Value) -> ToolResult;

    /// Serialize the current wallet state for persistence.
    async fn export_state(&self) -> Result<String, ProvisioningError>;
}

#[async_trait]
pub trait WalletProvisioner: Send + Sync {
    async fn provision(
        &self,
        request: ProvisionRequest,
    ) -> Result<Arc<dyn WalletTools>, ProvisioningError>;
}

/// JSON-schema definitions for the wallet actions.
pub fn wallet_tool_definitions(token_symbol: &str) -> Vec<ToolDefinition> {
    let asset = token_symbol.to_ascii_lowercase();
    vec![
        ToolDefinition {
            name: GET_WALLET_DETAILS.to_string(),
            description: "Get the wallet address and network of the user's wallet".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
        ToolDefinition {
            name: GET_BALANCE.to_string(),
            description: "Get the balance of an asset held by the user's wallet".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "asset_id": {
                        "type": "string",
                        "description": format!("Asset to query, e.g. \"{}\" or \"eth\"", asset)
                    }
                },
                "required": ["asset_id"]
            }),
        },
        ToolDefinition {
            name: TRANSFER.to_string(),
            description: "Transfer an amount of an asset from the user's wallet to a destination address".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "amount": {
                        "type": "string",
                        "description": "Whole-unit decimal amount, e.g. \"1.5\""
                    },
                    "asset_id": {
                        "type": "string",
                        "description": format!("Asset to send, e.g. \"{}\"", asset)
                    },
                    "destination": {
                        "type": "string",
                        "description": "Destination address (0x...)"
                    }
                },
                "required": ["amount", "asset_id", "destination"]
            }),
        },
        ToolDefinition {
            name: REQUEST_FAUCET_FUNDS.to_string(),
            description: "Request test funds from the network faucet (test networks only)".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "asset_id": {
                        "type": "string",
                        "description": "Asset to request; omit for the native token"
                    }
                },
                "required": []
            }),
        },
    ]
}
