use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::events::{EventPayload, EventSink};
use crate::session::{SessionState, StateValue};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an agent needs for one run: the request, the shared session
/// state, the event sink, the cancellation signal and its delegation depth.
///
/// A delegated run gets a fresh context from [`ExecutionContext::delegate`];
/// the state and sink are shared, the depth grows by one and the cancellation
/// token is a child of the parent's.
#[derive(Clone)]
pub struct ExecutionContext {
    run_id: Uuid,
    request: Arc<str>,
    state: SessionState,
    sink: EventSink,
    cancel: CancellationToken,
    depth: u32,
    config: Arc<OrchestratorConfig>,
}

impl ExecutionContext {
    pub fn root(
        run_id: Uuid,
        request: impl Into<Arc<str>>,
        state: SessionState,
        sink: EventSink,
        cancel: CancellationToken,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            run_id,
            request: request.into(),
            state,
            sink,
            cancel,
            depth: 0,
            config,
        }
    }

    /// Context for a sub-agent called `target`.
    pub fn delegate(&self, target: &str) -> Result<Self, OrchestrationError> {
        let depth = self.depth + 1;
        if depth > self.config.max_delegation_depth {
            return Err(OrchestrationError::DelegationDepthExceeded {
                target: target.to_string(),
                limit: self.config.max_delegation_depth,
            });
        }
        Ok(Self {
            run_id: self.run_id,
            request: self.request.clone(),
            state: self.state.clone(),
            sink: self.sink.clone(),
            cancel: self.cancel.child_token(),
            depth,
            config: self.config.clone(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn emit(&self, agent_id: &str, payload: EventPayload) -> Option<u64> {
        self.sink.emit(agent_id, self.depth, payload).await
    }

    /// Writes `value` into the session state and reports it as a state-write event.
    pub async fn write_state(&self, agent_id: &str, key: &str, value: StateValue) {
        self.state.set(key, value.clone());
        self.emit(
            agent_id,
            EventPayload::StateWrite {
                key: key.to_string(),
                value: Some(value),
            },
        )
        .await;
    }

    pub async fn remove_state(&self, agent_id: &str, key: &str) {
        if self.state.remove(key).is_some() {
            self.emit(
                agent_id,
                EventPayload::StateWrite {
                    key: key.to_string(),
                    value: None,
                },
            )
            .await;
        }
    }

    /// Awaits `fut` at a suspension point: cancellation wins, then the timeout.
    /// `Ok(None)` means the timeout elapsed.
    pub async fn suspend<F, T>(
        &self,
        limit: Duration,
        fut: F,
    ) -> Result<Option<T>, OrchestrationError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OrchestrationError::Cancelled),
            res = tokio::time::timeout(limit, fut) => Ok(res.ok()),
        }
    }
}
