use crate::error::GenerationError;
use crate::session::StateMap;
use async_trait::async_trait;
use genai::Client;
use genai::chat::{ChatMessage, ChatRequest, ChatRole, ContentPart, ToolCall, ToolResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.unwrap_or_default(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool_response(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Declaration of a callable tool offered to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub visible_state: StateMap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Generation {
    Text(String),
    /// `text` carries any commentary produced alongside the tool requests.
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCallRequest>,
    },
}

/// The opaque generation capability agents and the router build on.
///
/// Implementations own retries and provider specifics; the orchestration core
/// only applies timeouts and cancellation around each call.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError>;
}

#[derive(Deserialize, Clone, Debug)]
pub struct GenaiConfig {
    pub model: String,
    pub api_key: Option<String>,
}

/// [`Generator`] backed by the `genai` multi-provider client.
#[derive(Clone)]
pub struct GenaiGenerator {
    pub model: String,
    pub client: Client,
    pub api_key: Option<String>,
}

impl GenaiGenerator {
    pub fn new(config: GenaiConfig) -> Self {
        Self {
            model: config.model,
            client: Client::default(),
            api_key: config.api_key,
        }
    }

    fn export_api_key(&self) {
        let Some(key) = &self.api_key else {
            return;
        };
        let var = if self.model.starts_with("gpt") {
            "OPENAI_API_KEY"
        } else if self.model.starts_with("claude") {
            "ANTHROPIC_API_KEY"
        } else if self.model.starts_with("gemini") {
            "GEMINI_API_KEY"
        } else {
            return;
        };
        if env::var(var).is_err() {
            unsafe {
                env::set_var(var, key);
            }
        }
    }

    fn to_chat_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        for message in &request.messages {
            match message.role {
                Role::System => messages.push(ChatMessage::system(message.content.clone())),
                Role::User => messages.push(ChatMessage::user(message.content.clone())),
                Role::Assistant if message.tool_calls.is_empty() => {
                    messages.push(ChatMessage::assistant(message.content.clone()))
                }
                Role::Assistant => {
                    let mut parts = vec![];
                    if !message.content.is_empty() {
                        parts.push(ContentPart::Text(message.content.clone()));
                    }
                    for call in &message.tool_calls {
                        parts.push(ContentPart::ToolCall(ToolCall {
                            call_id: call.call_id.clone(),
                            fn_name: call.name.clone(),
                            fn_arguments: call.arguments.clone(),
                        }));
                    }
                    messages.push(ChatMessage {
                        role: ChatRole::Assistant,
                        content: parts.into(),
                        options: None,
                    });
                }
                Role::Tool => messages.push(ChatMessage::from(ToolResponse::new(
                    message.tool_call_id.clone().unwrap_or_default(),
                    message.content.clone(),
                ))),
            }
        }
        if !request.visible_state.is_empty() {
            let state: serde_json::Map<String, Value> = request
                .visible_state
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            messages.insert(
                0,
                ChatMessage::system(format!("Session state:\n{}", Value::Object(state))),
            );
        }
        messages
    }
}

#[async_trait]
impl Generator for GenaiGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        self.export_api_key();

        let mut chat_req = ChatRequest::new(Self::to_chat_messages(request));
        if !request.tools.is_empty() {
            let tools: Vec<genai::chat::Tool> = request
                .tools
                .iter()
                .map(|t| genai::chat::Tool {
                    name: t.name.clone(),
                    description: Some(t.description.clone()),
                    schema: Some(t.parameters.clone()),
                    config: None,
                })
                .collect();
            chat_req = chat_req.with_tools(tools);
        }

        let output = self
            .client
            .exec_chat(&self.model, chat_req, None)
            .await
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;

        let text: String = output.content.texts().join("");
        let calls: Vec<ToolCallRequest> = output
            .tool_calls()
            .iter()
            .map(|t| ToolCallRequest {
                call_id: t.call_id.clone(),
                name: t.fn_name.clone(),
                arguments: t.fn_arguments.clone(),
            })
            .collect();

        if calls.is_empty() {
            Ok(Generation::Text(text))
        } else {
            Ok(Generation::ToolCalls {
                text: (!text.is_empty()).then_some(text),
                calls,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StateValue;

    #[test]
    fn test_genai_instantiation() {
        let generator = GenaiGenerator::new(GenaiConfig {
            model: "gpt-4o-mini".to_string(),
            api_key: Some("test-key".to_string()),
        });
        assert_eq!(generator.model, "gpt-4o-mini");
        assert_eq!(generator.api_key, Some("test-key".to_string()));
    }

    #[test]
    fn test_visible_state_becomes_leading_system_message() {
        let mut visible_state = StateMap::new();
        visible_state.insert("target_city".into(), StateValue::Text("Tokyo".into()));
        let request = GenerationRequest {
            messages: vec![
                Message::system("You plan trips."),
                Message::user("book a flight"),
                Message::assistant_tool_calls(
                    None,
                    vec![ToolCallRequest {
                        call_id: "c1".into(),
                        name: "searchFlights".into(),
                        arguments: serde_json::json!({"dest": "Tokyo"}),
                    }],
                ),
                Message::tool_response("c1", "NH 211"),
            ],
            tools: vec![],
            visible_state,
        };
        let messages = GenaiGenerator::to_chat_messages(&request);
        assert_eq!(messages.len(), 5);
        assert!(matches!(messages[0].role, ChatRole::System));
        assert!(matches!(messages[3].role, ChatRole::Assistant));
    }

    #[tokio::test]
    async fn test_genai_generate() {
        dotenv::dotenv().ok();

        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() {
            println!("Skipping test_genai_generate because OPENAI_API_KEY is not set");
            return;
        }

        let generator = GenaiGenerator::new(GenaiConfig {
            model: "gpt-4o-mini".to_string(),
            api_key,
        });
        let request = GenerationRequest {
            messages: vec![Message::user("Say hello in Rust")],
            ..Default::default()
        };
        match generator.generate(&request).await {
            Ok(Generation::Text(text)) => assert!(!text.is_empty()),
            Ok(other) => println!("Unexpected tool request: {:?}", other),
            Err(e) => println!("Generation error: {}", e),
        }
    }
}
