//! Scripted generators and a context harness shared by the unit tests.

use crate::config::OrchestratorConfig;
use crate::context::ExecutionContext;
use crate::error::GenerationError;
use crate::events::{Event, EventSink};
use crate::llm::{Generation, GenerationRequest, Generator, ToolCallRequest};
use crate::runner::RunStream;
use crate::session::SessionState;
use crate::tools::FunctionTool;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Reply = Result<Generation, GenerationError>;

enum Script {
    Queue(VecDeque<Reply>),
    Repeat(Reply),
}

/// A [`Generator`] that replays canned replies and records every request.
pub(crate) struct ScriptedGenerator {
    script: Mutex<Script>,
    requests: Mutex<Vec<GenerationRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedGenerator {
    fn with_script(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            requests: Mutex::new(vec![]),
            delay: Mutex::new(None),
        })
    }

    /// Replies in order; once the queue is empty every call fails.
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Self::with_script(Script::Queue(replies.into()))
    }

    pub fn repeating(reply: Reply) -> Arc<Self> {
        Self::with_script(Script::Repeat(reply))
    }

    pub fn failing(error: GenerationError) -> Arc<Self> {
        Self::repeating(Err(error))
    }

    /// Sleeps before every reply.
    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock() = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_reply(&self) -> Reply {
        match &mut *self.script.lock() {
            Script::Queue(queue) => queue.pop_front().unwrap_or_else(|| {
                Err(GenerationError::Unavailable("script exhausted".into()))
            }),
            Script::Repeat(reply) => reply.clone(),
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        self.requests.lock().push(request.clone());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.next_reply()
    }
}

pub(crate) fn text(reply: &str) -> Reply {
    Ok(Generation::Text(reply.to_string()))
}

pub(crate) fn tool_calls(calls: Vec<(&str, Value)>) -> Reply {
    Ok(Generation::ToolCalls {
        text: None,
        calls: calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, arguments))| ToolCallRequest {
                call_id: format!("call_{}", i),
                name: name.to_string(),
                arguments,
            })
            .collect(),
    })
}

/// A root context plus a future collecting its events until every sink
/// clone is dropped.
pub(crate) fn harness(
    config: OrchestratorConfig,
) -> (ExecutionContext, impl Future<Output = Vec<Event>>) {
    let cancel = CancellationToken::new();
    let (sink, mut rx) = EventSink::channel(config.event_buffer, cancel.clone(), config.stream_tool_results);
    let ctx = ExecutionContext::root(
        Uuid::new_v4(),
        "test request",
        SessionState::new(),
        sink,
        cancel,
        Arc::new(config),
    );
    let events = async move {
        let mut out = vec![];
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    };
    (ctx, events)
}

/// A tool that answers `reply` and records the arguments of every call.
pub(crate) fn recording_tool(name: &str, reply: &str) -> (FunctionTool, Arc<Mutex<Vec<Value>>>) {
    let calls = Arc::new(Mutex::new(vec![]));
    let seen = calls.clone();
    let reply = reply.to_string();
    let tool = FunctionTool::new(
        name,
        format!("{} (recorded)", name),
        serde_json::json!({"type": "object"}),
        move |args| {
            seen.lock().push(args);
            let reply = reply.clone();
            async move { Ok(reply) }
        },
    );
    (tool, calls)
}

/// Drains a run to the end of its stream.
pub(crate) async fn collect(stream: RunStream) -> Vec<Event> {
    stream.collect().await
}
