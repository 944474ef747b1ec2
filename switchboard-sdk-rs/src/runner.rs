use crate::agent::{Agent, AgentOutput};
use crate::config::OrchestratorConfig;
use crate::context::ExecutionContext;
use crate::error::{AgentFailure, OrchestrationError};
use crate::events::{Event, EventPayload, EventSink, RUNNER_ID};
use crate::persistence::SnapshotStore;
use crate::router::Router;
use crate::session::{SessionState, StateMap};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Entry point: routes each request to a root agent and streams its events.
pub struct Runner {
    roster: Arc<Vec<Arc<Agent>>>,
    router: Arc<Router>,
    config: Arc<OrchestratorConfig>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl Runner {
    pub fn new(roster: Vec<Arc<Agent>>, router: Router) -> Self {
        Self {
            roster: Arc::new(roster),
            router: Arc::new(router),
            config: Arc::new(OrchestratorConfig::default()),
            snapshots: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Hands the final session state of every run to `store`.
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn roster(&self) -> &[Arc<Agent>] {
        &self.roster
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Starts a run on the current tokio runtime.
    ///
    /// The returned stream ends with exactly one run-terminal event. Dropping
    /// it cancels the run.
    pub fn start(&self, request: impl Into<String>, initial_state: StateMap) -> RunStream {
        let run_id = Uuid::new_v4();
        let request = request.into();
        let cancel = CancellationToken::new();
        let (sink, rx) = EventSink::channel(
            self.config.event_buffer,
            cancel.clone(),
            self.config.stream_tool_results,
        );
        let state = SessionState::with_initial(initial_state);
        let ctx = ExecutionContext::root(
            run_id,
            request,
            state.clone(),
            sink.clone(),
            cancel.clone(),
            self.config.clone(),
        );

        let drive = Drive {
            ctx,
            sink,
            roster: self.roster.clone(),
            router: self.router.clone(),
            snapshots: self.snapshots.clone(),
        };
        let task = tokio::spawn(drive.run());

        RunStream {
            run_id,
            inner: ReceiverStream::new(rx),
            cancel,
            state,
            task,
        }
    }
}

struct Drive {
    ctx: ExecutionContext,
    sink: EventSink,
    roster: Arc<Vec<Arc<Agent>>>,
    router: Arc<Router>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl Drive {
    async fn run(self) {
        let ctx = &self.ctx;
        tracing::info!(run_id = %ctx.run_id(), request = ctx.request(), "run started");

        let outcome = self.route_and_run().await;

        if ctx.is_cancelled() {
            if !self.sink.run_terminal_sent() {
                self.sink.emit_cancellation("run cancelled").await;
            }
            tracing::info!(run_id = %ctx.run_id(), "run cancelled");
        } else {
            if !self.sink.run_terminal_sent() {
                self.emit_terminal(&outcome).await;
            }
            match &outcome {
                Ok(out) => tracing::info!(run_id = %ctx.run_id(), agent = %out.agent, "run finished"),
                Err(failure) => tracing::warn!(run_id = %ctx.run_id(), "run failed: {}", failure),
            }
        }

        if let Some(store) = &self.snapshots {
            if let Err(e) = store.persist(ctx.run_id(), ctx.state().snapshot()).await {
                tracing::warn!(run_id = %ctx.run_id(), "failed to persist snapshot: {:#}", e);
            }
        }
    }

    async fn route_and_run(&self) -> Result<AgentOutput, AgentFailure> {
        let ctx = &self.ctx;
        let chosen = self
            .router
            .route(ctx, &self.roster)
            .await
            .map_err(|e| AgentFailure::new(RUNNER_ID, e))?;
        let Some(root) = chosen.into_iter().next() else {
            return Err(AgentFailure::new(
                RUNNER_ID,
                OrchestrationError::RoutingUnavailable("no agent accepts the request".into()),
            ));
        };
        tracing::info!(run_id = %ctx.run_id(), agent = root.name(), "request routed");
        root.run(ctx).await
    }

    /// Closes a run whose root agent did not emit its own terminal event.
    async fn emit_terminal(&self, outcome: &Result<AgentOutput, AgentFailure>) {
        match outcome {
            Ok(out) => {
                let result = out.text.clone().unwrap_or_else(|| "completed".to_string());
                self.ctx
                    .emit(&out.agent, EventPayload::FinalResult { result })
                    .await;
            }
            Err(failure) => {
                self.ctx
                    .emit(
                        RUNNER_ID,
                        EventPayload::Error {
                            error_kind: failure.kind(),
                            message: failure.error.to_string(),
                            origin: failure.origin.clone(),
                        },
                    )
                    .await;
            }
        }
    }
}

/// The event stream of one run.
pub struct RunStream {
    run_id: Uuid,
    inner: ReceiverStream<Event>,
    cancel: CancellationToken,
    state: SessionState,
    task: JoinHandle<()>,
}

impl RunStream {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Stops the run; the stream then ends with a single cancellation event.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The run's session state, shared with the agents while they run.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Stream for RunStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl Drop for RunStream {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            tracing::debug!(run_id = %self.run_id, "run stream dropped, cancelling");
            self.cancel.cancel();
        }
    }
}
