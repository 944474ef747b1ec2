use super::{AcceptRule, Agent, AgentOutput, AgentProfile, AgentResult};
use crate::context::ExecutionContext;
use crate::error::{AgentFailure, GenerationError, OrchestrationError, ToolError};
use crate::events::EventPayload;
use crate::llm::{Generation, GenerationRequest, Generator, Message};
use crate::prompts::{extract_json, render_instruction};
use crate::session::{StateMap, StateValue};
use crate::tools::{Tool, Toolset};
use serde_json::Value;
use std::sync::Arc;

/// An agent wrapping one generation capability and an optional tool set.
pub struct LeafAgent {
    pub(crate) profile: AgentProfile,
    instruction: String,
    generator: Arc<dyn Generator>,
    tools: Toolset,
    state_keys: Vec<String>,
    output_key: Option<String>,
    structured_output: bool,
}

impl LeafAgent {
    pub fn builder(name: impl Into<String>, generator: Arc<dyn Generator>) -> LeafBuilder {
        LeafBuilder {
            agent: LeafAgent {
                profile: AgentProfile::new(name),
                instruction: String::new(),
                generator,
                tools: Toolset::default(),
                state_keys: vec![],
                output_key: None,
                structured_output: false,
            },
        }
    }

    /// Key the final text (or parsed record) is stored under, if any.
    pub fn output_key(&self) -> Option<String> {
        match (&self.output_key, self.structured_output) {
            (Some(key), _) => Some(key.clone()),
            (None, true) => Some(format!("{}_output", self.profile.name)),
            (None, false) => None,
        }
    }

    fn visible_state(&self, ctx: &ExecutionContext) -> StateMap {
        self.state_keys
            .iter()
            .filter_map(|k| ctx.state().get(k).map(|v| (k.clone(), v)))
            .collect()
    }

    pub(crate) async fn run(&self, ctx: &ExecutionContext) -> AgentResult {
        let name = self.profile.name.as_str();
        let fail = |error: OrchestrationError| AgentFailure::new(name, error);
        let config = ctx.config();

        let mut messages = vec![
            Message::system(render_instruction(&self.instruction, ctx.state())),
            Message::user(ctx.request()),
        ];
        let tool_specs = self.tools.specs();
        let mut tool_calls = 0usize;

        loop {
            let request = GenerationRequest {
                messages: messages.clone(),
                tools: tool_specs.clone(),
                visible_state: self.visible_state(ctx),
            };
            let generation = match ctx
                .suspend(config.generation_timeout(), self.generator.generate(&request))
                .await
                .map_err(fail)?
            {
                Some(Ok(g)) => g,
                Some(Err(e)) => return Err(fail(e.into())),
                None => {
                    return Err(fail(
                        GenerationError::Timeout(config.generation_timeout_secs).into(),
                    ));
                }
            };

            let (text, calls) = match generation {
                Generation::Text(text) => return self.finish(ctx, text).await,
                Generation::ToolCalls { text, calls } if calls.is_empty() => {
                    return self.finish(ctx, text.unwrap_or_default()).await;
                }
                Generation::ToolCalls { text, calls } => (text, calls),
            };

            if let Some(thought) = text.as_deref().filter(|t| !t.trim().is_empty()) {
                ctx.emit(
                    name,
                    EventPayload::PartialOutput {
                        text: thought.to_string(),
                    },
                )
                .await;
            }
            messages.push(Message::assistant_tool_calls(text, calls.clone()));

            for call in calls {
                if tool_calls >= config.max_tool_calls {
                    return Err(fail(OrchestrationError::ToolLoopExceeded {
                        limit: config.max_tool_calls,
                    }));
                }
                tool_calls += 1;

                tracing::debug!(agent = name, tool = %call.name, "invoking tool");
                ctx.emit(
                    name,
                    EventPayload::ToolCall {
                        tool_name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                )
                .await;

                let output = ctx
                    .suspend(
                        config.tool_timeout(),
                        self.tools.invoke(&call.name, call.arguments.clone()),
                    )
                    .await
                    .map_err(fail)?
                    .unwrap_or(Err(ToolError::Timeout(config.tool_timeout_secs)))
                    .map_err(|source| {
                        fail(OrchestrationError::ToolFailure {
                            tool: call.name.clone(),
                            source,
                        })
                    })?;

                ctx.emit(
                    name,
                    EventPayload::ToolResult {
                        tool_name: call.name.clone(),
                        result: output.clone(),
                    },
                )
                .await;
                messages.push(Message::tool_response(call.call_id, output));
            }
        }
    }

    async fn finish(&self, ctx: &ExecutionContext, text: String) -> AgentResult {
        let name = &self.profile.name;
        let mut result = text;

        if self.structured_output {
            match extract_json(&result) {
                Some(Value::Object(record)) => {
                    let user_message = record
                        .get("user_message")
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                    if let Some(key) = self.output_key() {
                        ctx.state().set(key, StateValue::from(Value::Object(record)));
                    }
                    if let Some(message) = user_message {
                        result = message;
                    }
                }
                _ => {
                    tracing::warn!(agent = %name, "structured output is not a JSON object, using raw text");
                    if let Some(key) = &self.output_key {
                        ctx.state().set(key.clone(), result.clone());
                    }
                }
            }
        } else if let Some(key) = &self.output_key {
            ctx.state().set(key.clone(), result.clone());
        }

        ctx.emit(
            name,
            EventPayload::FinalResult {
                result: result.clone(),
            },
        )
        .await;
        Ok(AgentOutput {
            agent: name.clone(),
            text: Some(result),
        })
    }
}

pub struct LeafBuilder {
    agent: LeafAgent,
}

impl LeafBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.agent.profile.description = description.into();
        self
    }

    pub fn accepts(mut self, rule: AcceptRule) -> Self {
        self.agent.profile.accept = rule;
        self
    }

    /// Instruction template; `{key}` placeholders are filled from session state.
    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.agent.instruction = instruction.into();
        self
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.agent.tools = self.agent.tools.with(tool);
        self
    }

    pub fn tools(mut self, tools: Toolset) -> Self {
        self.agent.tools = tools;
        self
    }

    /// Makes a state key visible to the generator alongside the prompt.
    pub fn state_key(mut self, key: impl Into<String>) -> Self {
        self.agent.state_keys.push(key.into());
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.agent.output_key = Some(key.into());
        self
    }

    /// Parse the final reply as JSON, store the record and show only its
    /// `user_message` field.
    pub fn structured_output(mut self) -> Self {
        self.agent.structured_output = true;
        self
    }

    pub fn build(self) -> Agent {
        Agent::Leaf(self.agent)
    }
}
