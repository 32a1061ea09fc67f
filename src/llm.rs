use async_stream::stream;
use futures_util::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::LlmConfig;
use crate::error::ReasoningError;
use crate::session::{ConversationMemory, Role};
use crate::tools::{ToolDefinition, WalletTools};

/// Ordered text increments making up one reply. Finite; to get the reply
/// again the call has to be reissued.
pub type TextStream<'a> = BoxStream<'a, Result<String, ReasoningError>>;

/// Everything the reasoner sees for one user message.
pub struct ReasonerTurn<'a> {
    pub instructions: &'a str,
    pub tools: &'a dyn WalletTools,
    pub memory: &'a ConversationMemory,
    pub text: &'a str,
}

/// Natural-language engine that answers a user message, calling wallet tools as needed.
pub trait Reasoner: Send + Sync {
    fn respond<'a>(&'a self, turn: ReasonerTurn<'a>) -> TextStream<'a>;
}

/// Reasoner backed by an Anthropic-compatible Messages API with tool use.
pub struct LlmReasoner {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    max_tool_rounds: u32,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ApiTool],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ChatMessage {
    role: Role,
    content: Vec<ContentBlock>,
}

impl ChatMessage {
    fn text(role: Role, text: &str) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

impl From<ToolDefinition> for ApiTool {
    fn from(def: ToolDefinition) -> Self {
        Self {
            name: def.name,
            description: def.description,
            input_schema: def.parameters,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

impl ChatResponse {
    fn wants_tools(&self) -> bool {
        self.stop_reason.as_deref() == Some("tool_use")
    }

    fn texts(&self) -> Vec<String> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.is_empty() => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
    msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

fn no_tools(tools: &&[ApiTool]) -> bool {
    tools.is_empty()
}

fn history_messages(memory: &ConversationMemory) -> Vec<ChatMessage> {
    memory
        .turns()
        .map(|turn| ChatMessage::text(turn.role, &turn.content))
        .collect()
}

fn api_error(status: u16, body: &str) -> ReasoningError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|err| err.msg.or_else(|| err.error.and_then(|e| e.message)))
        .unwrap_or_else(|| body.to_string());
    ReasoningError::Api { status, message }
}

impl LlmReasoner {
    /// Create a new LLM client
    pub fn new(config: &LlmConfig) -> Result<Self, ReasoningError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_tool_rounds: config.max_tool_rounds,
        })
    }

    async fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, ReasoningError> {
        let url = format!("{}/v1/messages", self.base_url);

        debug!(
            model = %self.model,
            messages = request.messages.len(),
            "sending LLM request"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }

        let chat_response: ChatResponse =
            serde_json::from_str(&body).map_err(|e| ReasoningError::Malformed(e.to_string()))?;

        if let Some(usage) = &chat_response.usage {
            info!(
                model = %chat_response.model.as_deref().unwrap_or(&self.model),
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                stop_reason = ?chat_response.stop_reason,
                "LLM response received"
            );
        }

        Ok(chat_response)
    }
}

impl Reasoner for LlmReasoner {
    fn respond<'a>(&'a self, turn: ReasonerTurn<'a>) -> TextStream<'a> {
        Box::pin(stream! {
            let tools: Vec<ApiTool> = turn.tools.definitions().into_iter().map(ApiTool::from).collect();
            let mut messages = history_messages(turn.memory);
            messages.push(ChatMessage::text(Role::User, turn.text));

            let mut rounds = 0u32;
            let mut emitted = false;
            loop {
                let request = ChatRequest {
                    model: &self.model,
                    max_tokens: self.max_tokens,
                    system: turn.instructions,
                    messages: &messages,
                    tools: &tools,
                };
                let response = match self.complete(&request).await {
                    Ok(r) => r,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                for text in response.texts() {
                    // newline between text blocks
                    if emitted {
                        yield Ok("\n".to_string());
                    }
                    emitted = true;
                    yield Ok(text);
                }

                if !response.wants_tools() {
                    return;
                }

                rounds += 1;
                if rounds > self.max_tool_rounds {
                    yield Err(ReasoningError::ToolLoop(self.max_tool_rounds));
                    return;
                }

                let mut results = Vec::new();
                for block in &response.content {
                    if let ContentBlock::ToolUse { id, name, input } = block {
                        let result = turn.tools.invoke(name, input.clone()).await;
                        debug!(tool = %name, success = result.success, "tool call finished");
                        results.push(ContentBlock::ToolResult {
                            tool_use_id: id.clone(),
                            content: result.to_content(),
                            is_error: !result.success,
                        });
                    }
                }
                if results.is_empty() {
                    yield Err(ReasoningError::Malformed("tool_use stop without tool calls".to_string()));
                    return;
                }

                let assistant_content = response
                    .content
                    .into_iter()
                    .filter(|block| !matches!(block, ContentBlock::Unsupported))
                    .collect();
                messages.push(ChatMessage { role: Role::Assistant, content: assistant_content });
                messages.push(ChatMessage { role: Role::User, content: results });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisioningError;
    use crate::tools::{wallet_tool_definitions, ToolResult};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct BalanceWallet {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl WalletTools for BalanceWallet {
        fn address(&self) -> &str {
            "0xwallet"
        }
        fn network_id(&self) -> &str {
            "base-sepolia"
        }
        fn definitions(&self) -> Vec<ToolDefinition> {
            wallet_tool_definitions("USDC")
        }
        async fn invoke(&self, name: &str, input: Value) -> ToolResult {
            self.calls.lock().unwrap().push((name.to_string(), input));
            ToolResult::ok(serde_json::json!({"balance": "42", "asset_id": "usdc"}))
        }
        async fn export_state(&self) -> Result<String, ProvisioningError> {
            Ok("{}".into())
        }
    }

    /// Minimal HTTP server answering each connection with the next canned response.
    async fn serve(responses: Vec<(u16, String)>) -> (String, Arc<Mutex<Vec<Value>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let seen = bodies.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let header_end = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
                let length: usize = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .map(|v| v.trim().parse().unwrap())
                    .unwrap_or(0);
                while buf.len() < header_end + length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                }
                seen.lock()
                    .unwrap()
                    .push(serde_json::from_slice(&buf[header_end..header_end + length]).unwrap());

                let reply = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        (url, bodies)
    }

    fn reasoner(url: &str, max_tool_rounds: u32) -> LlmReasoner {
        LlmReasoner::new(&LlmConfig {
            base_url: url.to_string(),
            api_key: "sk-test".into(),
            model: "test-model".into(),
            max_tokens: 256,
            max_tool_rounds,
            timeout_secs: 5,
        })
        .unwrap()
    }

    async fn collect(stream: TextStream<'_>) -> Result<String, ReasoningError> {
        let mut stream = stream;
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }

    #[test]
    fn test_chat_request_serialization() {
        let messages = vec![ChatMessage::text(Role::User, "Hello")];
        let tools: Vec<ApiTool> = wallet_tool_definitions("USDC")
            .into_iter()
            .map(ApiTool::from)
            .collect();
        let request = ChatRequest {
            model: "test",
            max_tokens: 1000,
            system: "You are helpful",
            messages: &messages,
            tools: &tools,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["system"], "You are helpful");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
        assert_eq!(json["tools"][1]["name"], "get_balance");
        assert!(json["tools"][1]["input_schema"]["properties"]["asset_id"].is_object());
    }

    #[test]
    fn test_request_omits_empty_tools() {
        let request = ChatRequest {
            model: "m",
            max_tokens: 1,
            system: "s",
            messages: &[],
            tools: &[],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn test_chat_response_with_tool_use() {
        let json = r#"{
            "id": "msg_123",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "thinking", "thinking": "..."},
                {"type": "tool_use", "id": "tu_1", "name": "get_balance", "input": {"asset_id": "usdc"}}
            ],
            "model": "test-model",
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }"#;

        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(response.wants_tools());
        assert_eq!(response.texts(), vec!["Let me check.".to_string()]);
        assert_eq!(response.content[1], ContentBlock::Unsupported);
        assert!(matches!(
            &response.content[2],
            ContentBlock::ToolUse { name, .. } if name == "get_balance"
        ));
    }

    #[test]
    fn test_tool_result_serialization() {
        let ok = ContentBlock::ToolResult {
            tool_use_id: "tu_1".into(),
            content: "{}".into(),
            is_error: false,
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert!(json.get("is_error").is_none());
    }

    #[test]
    fn test_history_messages() {
        let mut memory = ConversationMemory::new(0);
        memory.record_exchange("hi", "hello");
        let messages = history_messages(&memory);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], ChatMessage::text(Role::Assistant, "hello"));
    }

    #[test]
    fn test_api_error_parsing() {
        let err = api_error(529, r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#);
        assert_eq!(err.to_string(), "LLM API error 529: Overloaded");

        let err = api_error(500, "boom");
        assert_eq!(err.to_string(), "LLM API error 500: boom");
    }

    #[tokio::test]
    async fn test_respond_runs_tool_round() {
        let (url, bodies) = serve(vec![
            (
                200,
                r#"{"content":[{"type":"tool_use","id":"tu_1","name":"get_balance","input":{"asset_id":"usdc"}}],"stop_reason":"tool_use"}"#.into(),
            ),
            (
                200,
                r#"{"content":[{"type":"text","text":"  You have 42 USDC. "}],"stop_reason":"end_turn","usage":{"input_tokens":3,"output_tokens":4}}"#.into(),
            ),
        ])
        .await;

        let reasoner = reasoner(&url, 4);
        let wallet = BalanceWallet {
            calls: Mutex::new(Vec::new()),
        };
        let mut memory = ConversationMemory::new(0);
        memory.record_exchange("hi", "hello");

        let reply = collect(reasoner.respond(ReasonerTurn {
            instructions: "sys",
            tools: &wallet,
            memory: &memory,
            text: "what's my balance?",
        }))
        .await
        .unwrap();

        assert_eq!(reply, "  You have 42 USDC. ");
        assert_eq!(wallet.calls.lock().unwrap()[0].0, "get_balance");

        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.len(), 2);
        // history + new message on the first call
        assert_eq!(bodies[0]["messages"].as_array().unwrap().len(), 3);
        // second call carries the tool_use turn and its result
        let second = bodies[1]["messages"].as_array().unwrap();
        assert_eq!(second.len(), 5);
        assert_eq!(second[4]["content"][0]["type"], "tool_result");
        assert_eq!(second[4]["content"][0]["tool_use_id"], "tu_1");
    }

    #[tokio::test]
    async fn test_respond_surfaces_api_error() {
        let (url, _) = serve(vec![(503, r#"{"msg":"busy"}"#.into())]).await;
        let reasoner = reasoner(&url, 4);
        let wallet = BalanceWallet {
            calls: Mutex::new(Vec::new()),
        };
        let memory = ConversationMemory::new(0);

        let result = collect(reasoner.respond(ReasonerTurn {
            instructions: "sys",
            tools: &wallet,
            memory: &memory,
            text: "hi",
        }))
        .await;

        assert!(matches!(
            result,
            Err(ReasoningError::Api { status: 503, ref message }) if message == "busy"
        ));
    }

    #[tokio::test]
    async fn test_respond_stops_runaway_tool_loop() {
        let tool_turn = r#"{"content":[{"type":"tool_use","id":"tu","name":"get_balance","input":{}}],"stop_reason":"tool_use"}"#;
        let (url, _) = serve(vec![(200, tool_turn.into()), (200, tool_turn.into())]).await;
        let reasoner = reasoner(&url, 1);
        let wallet = BalanceWallet {
            calls: Mutex::new(Vec::new()),
        };
        let memory = ConversationMemory::new(0);

        let result = collect(reasoner.respond(ReasonerTurn {
            instructions: "sys",
            tools: &wallet,
            memory: &memory,
            text: "loop",
        }))
        .await;

        assert!(matches!(result, Err(ReasoningError::ToolLoop(1))));
    }

    #[tokio::test]
    async fn test_respond_separates_text_across_rounds() {
        let (url, _) = serve(vec![
            (
                200,
                r#"{"content":[{"type":"text","text":"Let me check."},{"type":"tool_use","id":"tu_1","name":"get_balance","input":{"asset_id":"usdc"}}],"stop_reason":"tool_use"}"#.into(),
            ),
            (
                200,
                r#"{"content":[{"type":"text","text":"You have 42 USDC."}],"stop_reason":"end_turn"}"#.into(),
            ),
        ])
        .await;

        let reasoner = reasoner(&url, 4);
        let wallet = BalanceWallet {
            calls: Mutex::new(Vec::new()),
        };
        let memory = ConversationMemory::new(0);

        let reply = collect(reasoner.respond(ReasonerTurn {
            instructions: "sys",
            tools: &wallet,
            memory: &memory,
            text: "what's my balance?",
        }))
        .await
        .unwrap();

        assert_eq!(reply, "Let me check.\nYou have 42 USDC.");
    }
}
