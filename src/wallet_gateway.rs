//! HTTP wallet gateway: the provisioning collaborator.
//!
//! The gateway custodies wallets. We hand it credentials plus whatever wallet
//! state we persisted last time and receive an address and fresh exportable
//! state; wallet actions are proxied through it.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::WalletConfig;
use crate::error::ProvisioningError;
use crate::tools::{
    wallet_tool_definitions, ProvisionRequest, ToolDefinition, ToolResult, WalletProvisioner,
    WalletTools, GET_WALLET_DETAILS,
};

const HEADER_KEY_NAME: &str = "x-api-key-name";
const HEADER_KEY_SECRET: &str = "x-api-key-secret";

#[derive(Debug, Serialize)]
struct ProvisionBody<'a> {
    label: &'a str,
    network_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    wallet_data: Option<Value>,
}

/// Exported wallet state; also the persisted record payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub address: String,
    pub network_id: String,
    pub wallet_data: Value,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Value,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Clone)]
struct Credentials {
    name: String,
    secret: String,
}

pub struct WalletGateway {
    client: Client,
    base_url: String,
    token_symbol: String,
}

impl WalletGateway {
    pub fn new(config: &WalletConfig) -> Result<Self, ProvisioningError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            token_symbol: config.token_symbol.clone(),
        })
    }
}

#[async_trait]
impl WalletProvisioner for WalletGateway {
    async fn provision(
        &self,
        request: ProvisionRequest,
    ) -> Result<Arc<dyn WalletTools>, ProvisioningError> {
        // prior state is our own snapshot format; the gateway only wants its wallet_data
        let wallet_data = match request.prior_state.as_deref() {
            Some(raw) => {
                let snapshot: WalletSnapshot =
                    serde_json::from_str(raw).map_err(ProvisioningError::InvalidPriorState)?;
                Some(snapshot.wallet_data)
            }
            None => None,
        };
        let restoring = wallet_data.is_some();

        let url = format!("{}/v1/wallets/provision", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(HEADER_KEY_NAME, &request.credential_name)
            .header(HEADER_KEY_SECRET, &request.credential_key)
            .json(&ProvisionBody {
                label: request.identity.as_str(),
                network_id: &request.network_id,
                wallet_data,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }

        let snapshot = parse_snapshot(&body)?;

        info!(
            identity = %request.identity,
            address = %snapshot.address,
            network_id = %snapshot.network_id,
            restoring,
            "wallet provisioned"
        );

        Ok(Arc::new(GatewayWallet {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            credentials: Credentials {
                name: request.credential_name,
                secret: request.credential_key,
            },
            definitions: wallet_tool_definitions(&self.token_symbol),
            snapshot,
        }))
    }
}

fn classify_failure(status: StatusCode, body: &str) -> ProvisioningError {
    let message = serde_json::from_str::<GatewayError>(body)
        .ok()
        .and_then(|e| e.error.or(e.message))
        .unwrap_or_else(|| body.to_string());

    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::UNPROCESSABLE_ENTITY => ProvisioningError::Rejected {
            status: status.as_u16(),
            message,
        },
        _ => ProvisioningError::Unavailable {
            status: status.as_u16(),
            message,
        },
    }
}

/// Parse a gateway snapshot. The address ends up in request paths, so anything
/// other than `0x` plus 40 hex digits is refused.
fn parse_snapshot(body: &str) -> Result<WalletSnapshot, ProvisioningError> {
    let snapshot: WalletSnapshot =
        serde_json::from_str(body).map_err(|e| ProvisioningError::Malformed(e.to_string()))?;
    if !is_hex_address(&snapshot.address) {
        return Err(ProvisioningError::Malformed(format!(
            "invalid wallet address: {:?}",
            snapshot.address
        )));
    }
    Ok(snapshot)
}

fn is_hex_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .is_some_and(|digits| digits.len() == 40 && digits.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Tool set bound to one gateway wallet.
pub struct GatewayWallet {
    client: Client,
    base_url: String,
    credentials: Credentials,
    definitions: Vec<ToolDefinition>,
    snapshot: WalletSnapshot,
}

impl GatewayWallet {
    fn details(&self) -> Value {
        serde_json::json!({
            "address": self.snapshot.address,
            "network_id": self.snapshot.network_id,
        })
    }

    async fn call_action(&self, name: &str, input: Value) -> ToolResult {
        let url = format!(
            "{}/v1/wallets/{}/actions/{}",
            self.base_url, self.snapshot.address, name
        );
        let response = match self
            .client
            .post(&url)
            .header(HEADER_KEY_NAME, &self.credentials.name)
            .header(HEADER_KEY_SECRET, &self.credentials.secret)
            .json(&input)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(tool = %name, error = %e, "wallet action request failed");
                return ToolResult::err(format!("request failed: {}", e));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return ToolResult::err(format!("failed to read response: {}", e)),
        };
        action_result(status, &body)
    }
}

/// Map a gateway action response to a tool result. The status code is kept in
/// the error text so the model can tell server errors from user errors.
fn action_result(status: StatusCode, body: &str) -> ToolResult {
    if !status.is_success() {
        let message = serde_json::from_str::<GatewayError>(body)
            .ok()
            .and_then(|e| e.error.or(e.message))
            .unwrap_or_else(|| body.to_string());
        return ToolResult::err(format!("upstream {}: {}", status.as_u16(), message));
    }

    match serde_json::from_str::<ActionResponse>(body) {
        Ok(parsed) if parsed.ok => ToolResult::ok(parsed.result),
        Ok(parsed) => ToolResult::err(
            parsed
                .error
                .unwrap_or_else(|| "action failed without a reason".to_string()),
        ),
        Err(e) => ToolResult::err(format!("malformed gateway response: {}", e)),
    }
}

#[async_trait]
impl WalletTools for GatewayWallet {
    fn address(&self) -> &str {
        &self.snapshot.address
    }

    fn network_id(&self) -> &str {
        &self.snapshot.network_id
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }

    async fn invoke(&self, name: &str, input: Value) -> ToolResult {
        debug!(tool = %name, wallet = %self.snapshot.address, "invoking wallet tool");

        if name == GET_WALLET_DETAILS {
            return ToolResult::ok(self.details());
        }
        if !self.definitions.iter().any(|d| d.name == name) {
            return ToolResult::err(format!("unknown tool: {}", name));
        }
        self.call_action(name, input).await
    }

    async fn export_state(&self) -> Result<String, ProvisioningError> {
        let url = format!(
            "{}/v1/wallets/{}/export",
            self.base_url, self.snapshot.address
        );
        let response = self
            .client
            .get(&url)
            .header(HEADER_KEY_NAME, &self.credentials.name)
            .header(HEADER_KEY_SECRET, &self.credentials.secret)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }

        let snapshot = parse_snapshot(&body)?;
        serde_json::to_string(&snapshot).map_err(|e| ProvisioningError::Malformed(e.to_string()))
    }
}
