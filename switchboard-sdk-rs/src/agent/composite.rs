use super::{AcceptRule, Agent, AgentOutput, AgentProfile, AgentResult};
use crate::context::ExecutionContext;
use crate::error::{AgentFailure, ErrorKind, OrchestrationError};
use crate::events::EventPayload;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::fmt;
use std::sync::Arc;

/// Lifecycle of one composite run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeState {
    Dispatching,
    Delegating,
    Aggregating,
    Done,
    Failed,
}

/// A finished sub-agent run, in the order the composite observed it.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub agent: String,
    pub output: Option<String>,
}

/// Next move chosen by a [`Delegator`].
#[derive(Clone)]
pub enum Dispatch {
    Delegate(Arc<Agent>),
    Finish,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Delegate(agent) => write!(f, "Delegate({})", agent.name()),
            Dispatch::Finish => f.write_str("Finish"),
        }
    }
}

/// Custom dispatch logic for a conditional composite.
///
/// Delegators are shared across concurrent runs, so anything they need to
/// remember between dispatch rounds belongs in the session state.
#[async_trait]
pub trait Delegator: Send + Sync {
    /// Picks the next sub-agent given the current state and what already ran.
    async fn next(
        &self,
        ctx: &ExecutionContext,
        sub_agents: &[Arc<Agent>],
        history: &[StepRecord],
    ) -> Result<Dispatch, OrchestrationError>;

    /// Optional recovery agent to run before the composite reports `failure`.
    async fn on_failure(
        &self,
        _ctx: &ExecutionContext,
        _sub_agents: &[Arc<Agent>],
        _failure: &AgentFailure,
    ) -> Option<Arc<Agent>> {
        None
    }
}

#[derive(Clone)]
pub enum DelegationPolicy {
    /// One sub-agent at a time in list order; the first failure aborts the rest.
    Sequential,
    /// All sub-agents at once; fails only after every branch has finished.
    Parallel,
    Conditional(Arc<dyn Delegator>),
}

impl fmt::Debug for DelegationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelegationPolicy::Sequential => f.write_str("Sequential"),
            DelegationPolicy::Parallel => f.write_str("Parallel"),
            DelegationPolicy::Conditional(_) => f.write_str("Conditional(..)"),
        }
    }
}

/// How the composite's own final result is synthesized.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Aggregation {
    #[default]
    LastOutput,
    Concatenate(String),
    FromState(String),
    /// No final result of its own.
    Silent,
}

pub struct CompositeAgent {
    pub(crate) profile: AgentProfile,
    sub_agents: Vec<Arc<Agent>>,
    policy: DelegationPolicy,
    aggregation: Aggregation,
    output_key: Option<String>,
}

impl CompositeAgent {
    pub fn builder(name: impl Into<String>, policy: DelegationPolicy) -> CompositeBuilder {
        CompositeBuilder {
            agent: CompositeAgent {
                profile: AgentProfile::new(name),
                sub_agents: vec![],
                policy,
                aggregation: Aggregation::default(),
                output_key: None,
            },
        }
    }

    pub fn sub_agents(&self) -> &[Arc<Agent>] {
        &self.sub_agents
    }

    pub fn policy(&self) -> &DelegationPolicy {
        &self.policy
    }

    fn transition(&self, state: &mut CompositeState, next: CompositeState) {
        let from = *state;
        tracing::debug!(agent = %self.profile.name, ?from, to = ?next, "composite transition");
        *state = next;
    }

    pub(crate) async fn run(&self, ctx: &ExecutionContext) -> AgentResult {
        match &self.policy {
            DelegationPolicy::Parallel => self.run_parallel(ctx).await,
            DelegationPolicy::Sequential => self.run_serial(ctx, None).await,
            DelegationPolicy::Conditional(delegator) => {
                self.run_serial(ctx, Some(delegator.as_ref())).await
            }
        }
    }

    /// Sequential and conditional policies: one sub-agent at a time.
    async fn run_serial(
        &self,
        ctx: &ExecutionContext,
        delegator: Option<&dyn Delegator>,
    ) -> AgentResult {
        let name = self.profile.name.as_str();
        let mut state = CompositeState::Dispatching;
        let mut history: Vec<StepRecord> = vec![];
        let mut pending: Option<Arc<Agent>> = None;
        let mut failure: Option<AgentFailure> = None;
        let mut output: Option<AgentOutput> = None;
        let mut dispatches = 0usize;

        loop {
            match state {
                CompositeState::Dispatching => {
                    if ctx.is_cancelled() {
                        return Err(AgentFailure::new(name, OrchestrationError::Cancelled));
                    }
                    let next = match delegator {
                        None => self
                            .sub_agents
                            .get(history.len())
                            .cloned()
                            .map(Dispatch::Delegate)
                            .unwrap_or(Dispatch::Finish),
                        Some(d) => d
                            .next(ctx, &self.sub_agents, &history)
                            .await
                            .map_err(|e| AgentFailure::new(name, e))?,
                    };
                    tracing::debug!(agent = name, dispatch = ?next, "dispatch decided");
                    match next {
                        Dispatch::Delegate(agent) => {
                            dispatches += 1;
                            if dispatches > ctx.config().max_dispatch_steps {
                                failure = Some(AgentFailure::new(
                                    name,
                                    OrchestrationError::DelegationDepthExceeded {
                                        target: agent.name().to_string(),
                                        limit: ctx.config().max_dispatch_steps as u32,
                                    },
                                ));
                                self.transition(&mut state, CompositeState::Failed);
                            } else {
                                pending = Some(agent);
                                self.transition(&mut state, CompositeState::Delegating);
                            }
                        }
                        Dispatch::Finish => {
                            self.transition(&mut state, CompositeState::Aggregating)
                        }
                    }
                }
                CompositeState::Delegating => {
                    let Some(agent) = pending.take() else {
                        self.transition(&mut state, CompositeState::Dispatching);
                        continue;
                    };
                    match self.delegate_to(ctx, &agent).await {
                        Ok(out) => {
                            history.push(StepRecord {
                                agent: out.agent,
                                output: out.text,
                            });
                            self.transition(&mut state, CompositeState::Dispatching);
                        }
                        Err(f) => {
                            failure = Some(f);
                            self.transition(&mut state, CompositeState::Failed);
                        }
                    }
                }
                CompositeState::Aggregating => {
                    output = Some(self.aggregate(ctx, &history).await);
                    self.transition(&mut state, CompositeState::Done);
                }
                CompositeState::Done => {
                    return Ok(output.unwrap_or_else(|| AgentOutput {
                        agent: name.to_string(),
                        text: None,
                    }));
                }
                CompositeState::Failed => {
                    let failure = failure.take().unwrap_or_else(|| {
                        AgentFailure::new(name, OrchestrationError::Cancelled)
                    });
                    if let Some(d) = delegator {
                        if failure.kind() != ErrorKind::Cancelled {
                            if let Some(recovery) =
                                d.on_failure(ctx, &self.sub_agents, &failure).await
                            {
                                tracing::info!(agent = name, recovery = recovery.name(), "running failure handler");
                                if let Err(e) = self.delegate_to(ctx, &recovery).await {
                                    tracing::warn!(agent = name, "failure handler failed: {}", e);
                                }
                            }
                        }
                    }
                    return Err(failure);
                }
            }
        }
    }

    async fn run_parallel(&self, ctx: &ExecutionContext) -> AgentResult {
        let name = self.profile.name.as_str();
        let mut state = CompositeState::Dispatching;
        if ctx.is_cancelled() {
            return Err(AgentFailure::new(name, OrchestrationError::Cancelled));
        }
        self.transition(&mut state, CompositeState::Delegating);

        let mut branches: FuturesUnordered<_> = self
            .sub_agents
            .iter()
            .enumerate()
            .map(|(idx, agent)| async move { (idx, self.delegate_to(ctx, agent).await) })
            .collect();

        let mut outputs: Vec<Option<AgentOutput>> = vec![None; self.sub_agents.len()];
        let mut first_failure: Option<AgentFailure> = None;
        while let Some((idx, result)) = branches.next().await {
            match result {
                Ok(out) => outputs[idx] = Some(out),
                Err(f) => {
                    tracing::debug!(agent = name, branch = %f.origin, "parallel branch failed");
                    if first_failure.is_none() {
                        first_failure = Some(f);
                    }
                }
            }
        }

        if ctx.is_cancelled() {
            self.transition(&mut state, CompositeState::Failed);
            return Err(AgentFailure::new(name, OrchestrationError::Cancelled));
        }
        if let Some(failure) = first_failure {
            self.transition(&mut state, CompositeState::Failed);
            return Err(failure);
        }

        self.transition(&mut state, CompositeState::Aggregating);
        let history: Vec<StepRecord> = outputs
            .into_iter()
            .flatten()
            .map(|out| StepRecord {
                agent: out.agent,
                output: out.text,
            })
            .collect();
        let output = self.aggregate(ctx, &history).await;
        self.transition(&mut state, CompositeState::Done);
        Ok(output)
    }

    /// Runs `agent` one level deeper, announcing the delegation first.
    pub(crate) async fn delegate_to(
        &self,
        ctx: &ExecutionContext,
        agent: &Arc<Agent>,
    ) -> AgentResult {
        let name = self.profile.name.as_str();
        let child = ctx
            .delegate(agent.name())
            .map_err(|e| AgentFailure::new(name, e))?;
        ctx.emit(
            name,
            EventPayload::Delegation {
                delegated_to: agent.name().to_string(),
            },
        )
        .await;
        agent.run(&child).await
    }

    async fn aggregate(&self, ctx: &ExecutionContext, history: &[StepRecord]) -> AgentOutput {
        let name = &self.profile.name;
        let text = match &self.aggregation {
            Aggregation::LastOutput => history.iter().rev().find_map(|s| s.output.clone()),
            Aggregation::Concatenate(separator) => {
                let parts: Vec<&str> = history.iter().filter_map(|s| s.output.as_deref()).collect();
                (!parts.is_empty()).then(|| parts.join(separator))
            }
            Aggregation::FromState(key) => ctx.state().get(key).map(|v| v.to_string()),
            Aggregation::Silent => None,
        };

        if let Some(result) = &text {
            if let Some(key) = &self.output_key {
                ctx.state().set(key.clone(), result.clone());
            }
            ctx.emit(
                name,
                EventPayload::FinalResult {
                    result: result.clone(),
                },
            )
            .await;
        }
        AgentOutput {
            agent: name.clone(),
            text,
        }
    }
}

pub struct CompositeBuilder {
    agent: CompositeAgent,
}

impl CompositeBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.agent.profile.description = description.into();
        self
    }

    pub fn accepts(mut self, rule: AcceptRule) -> Self {
        self.agent.profile.accept = rule;
        self
    }

    pub fn sub_agent(mut self, agent: Arc<Agent>) -> Self {
        self.agent.sub_agents.push(agent);
        self
    }

    pub fn sub_agents(mut self, agents: impl IntoIterator<Item = Arc<Agent>>) -> Self {
        self.agent.sub_agents.extend(agents);
        self
    }

    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.agent.aggregation = aggregation;
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.agent.output_key = Some(key.into());
        self
    }

    pub fn build(self) -> Agent {
        Agent::Composite(self.agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LeafAgent;
    use crate::config::OrchestratorConfig;
    use crate::error::GenerationError;
    use crate::events::{Event, EventKind};
    use crate::testing::{ScriptedGenerator, harness, text};
    use std::time::Duration;

    fn leaf(name: &str, reply: &str) -> (Arc<Agent>, Arc<ScriptedGenerator>) {
        let generator = ScriptedGenerator::new(vec![text(reply)]);
        let agent = LeafAgent::builder(name, generator.clone())
            .output_key(format!("{}_text", name))
            .build();
        (Arc::new(agent), generator)
    }

    fn failing_leaf(name: &str) -> (Arc<Agent>, Arc<ScriptedGenerator>) {
        let generator = ScriptedGenerator::failing(GenerationError::Unavailable("down".into()));
        (
            Arc::new(LeafAgent::builder(name, generator.clone()).build()),
            generator,
        )
    }

    fn errors(events: &[Event]) -> Vec<(&str, u32)> {
        events
            .iter()
            .filter(|e| e.kind() == EventKind::Error)
            .map(|e| (e.agent_id.as_str(), e.depth))
            .collect()
    }

    #[tokio::test]
    async fn test_sequential_passes_state_forward() {
        let (a, _) = leaf("city_input_agent", "Tokyo");
        let info_gen = ScriptedGenerator::new(vec![text("Tokyo: sushi, Asakusa.")]);
        let b = Arc::new(
            LeafAgent::builder("city_info_agent", info_gen.clone())
                .instruction("Describe {city_input_agent_text}.")
                .build(),
        );
        let composite = CompositeAgent::builder("travel_planner", DelegationPolicy::Sequential)
            .sub_agents([a, b])
            .build();

        let (ctx, events) = harness(OrchestratorConfig::default());
        let out = composite.run(&ctx).await.unwrap();
        drop(ctx);
        let events = events.await;

        assert_eq!(out.text.as_deref(), Some("Tokyo: sushi, Asakusa."));
        assert_eq!(info_gen.requests()[0].messages[0].content, "Describe Tokyo.");
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Delegation,
                EventKind::FinalResult,
                EventKind::Delegation,
                EventKind::FinalResult,
                EventKind::FinalResult,
            ]
        );
        assert!(events.last().unwrap().is_run_terminal());
        assert_eq!(events.iter().filter(|e| e.is_run_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_sequential_failure_skips_rest() {
        let (a, _) = failing_leaf("a");
        let (b, b_gen) = leaf("b", "never");
        let composite = CompositeAgent::builder("seq", DelegationPolicy::Sequential)
            .sub_agents([a, b])
            .build();

        let (ctx, events) = harness(OrchestratorConfig::default());
        let failure = composite.run(&ctx).await.unwrap_err();
        drop(ctx);
        let events = events.await;

        assert_eq!(failure.origin, "a");
        assert_eq!(b_gen.calls(), 0);
        assert_eq!(errors(&events), vec![("a", 1), ("seq", 0)]);
        match &events.last().unwrap().payload {
            EventPayload::Error { origin, .. } => assert_eq!(origin, "a"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parallel_waits_for_all_branches() {
        let (a, _) = failing_leaf("a");
        let slow_gen = ScriptedGenerator::new(vec![text("b done")])
            .with_delay(Duration::from_millis(50));
        let b = Arc::new(
            LeafAgent::builder("b", slow_gen.clone())
                .output_key("b_text")
                .build(),
        );
        let composite = CompositeAgent::builder("par", DelegationPolicy::Parallel)
            .sub_agents([a, b])
            .build();

        let (ctx, events) = harness(OrchestratorConfig::default());
        let failure = composite.run(&ctx).await.unwrap_err();
        let state = ctx.state().clone();
        drop(ctx);
        let events = events.await;

        assert_eq!(failure.origin, "a");
        // b finished even though a failed first
        assert_eq!(state.get_text("b_text").as_deref(), Some("b done"));
        let b_final = events
            .iter()
            .position(|e| e.agent_id == "b" && e.kind() == EventKind::FinalResult)
            .unwrap();
        let par_error = events
            .iter()
            .position(|e| e.agent_id == "par" && e.kind() == EventKind::Error)
            .unwrap();
        assert!(b_final < par_error);
        assert_eq!(par_error, events.len() - 1);
    }

    #[tokio::test]
    async fn test_parallel_concatenates_in_list_order() {
        let slow_gen = ScriptedGenerator::new(vec![text("weather: rain")])
            .with_delay(Duration::from_millis(30));
        let slow = Arc::new(LeafAgent::builder("weather_agent", slow_gen).build());
        let (fast, _) = leaf("rag_agent", "docs: ADK routing");
        let composite = CompositeAgent::builder("brief", DelegationPolicy::Parallel)
            .sub_agents([slow, fast])
            .aggregation(Aggregation::Concatenate("\n".into()))
            .output_key("brief")
            .build();

        let (ctx, _events) = harness(OrchestratorConfig::default());
        let out = composite.run(&ctx).await.unwrap();
        assert_eq!(out.text.as_deref(), Some("weather: rain\ndocs: ADK routing"));
        assert_eq!(
            ctx.state().get_text("brief").as_deref(),
            Some("weather: rain\ndocs: ADK routing")
        );
    }

    #[tokio::test]
    async fn test_depth_limit_fails_delegation() {
        let (inner_leaf, inner_gen) = leaf("leaf", "deep");
        let inner = Arc::new(
            CompositeAgent::builder("inner", DelegationPolicy::Sequential)
                .sub_agent(inner_leaf)
                .build(),
        );
        let outer = CompositeAgent::builder("outer", DelegationPolicy::Sequential)
            .sub_agent(inner)
            .build();
        let config = OrchestratorConfig {
            max_delegation_depth: 1,
            ..Default::default()
        };
        let (ctx, events) = harness(config);
        let failure = outer.run(&ctx).await.unwrap_err();
        drop(ctx);
        let events = events.await;

        assert_eq!(failure.kind(), ErrorKind::DelegationDepthExceeded);
        assert_eq!(failure.origin, "inner");
        assert_eq!(inner_gen.calls(), 0);
        assert_eq!(errors(&events), vec![("inner", 1), ("outer", 0)]);
    }

    struct StateSwitch;

    #[async_trait]
    impl Delegator for StateSwitch {
        async fn next(
            &self,
            ctx: &ExecutionContext,
            sub_agents: &[Arc<Agent>],
            history: &[StepRecord],
        ) -> Result<Dispatch, OrchestrationError> {
            if !history.is_empty() {
                return Ok(Dispatch::Finish);
            }
            let wanted = match ctx.state().get_text("intent").as_deref() {
                Some("cancel") => "cancel_order_agent",
                _ => "order_inquiry_agent",
            };
            Ok(sub_agents
                .iter()
                .find(|a| a.name() == wanted)
                .cloned()
                .map(Dispatch::Delegate)
                .unwrap_or(Dispatch::Finish))
        }
    }

    #[tokio::test]
    async fn test_conditional_reads_state() {
        let (inquiry, inquiry_gen) = leaf("order_inquiry_agent", "2 orders");
        let (cancel, cancel_gen) = leaf("cancel_order_agent", "order 1 cancelled");
        let composite = CompositeAgent::builder(
            "order_agent",
            DelegationPolicy::Conditional(Arc::new(StateSwitch)),
        )
        .sub_agents([inquiry, cancel])
        .build();

        let (ctx, _events) = harness(OrchestratorConfig::default());
        ctx.state().set("intent", "cancel");
        let out = composite.run(&ctx).await.unwrap();
        assert_eq!(out.text.as_deref(), Some("order 1 cancelled"));
        assert_eq!(inquiry_gen.calls(), 0);
        assert_eq!(cancel_gen.calls(), 1);
    }

    struct Forever;

    #[async_trait]
    impl Delegator for Forever {
        async fn next(
            &self,
            _ctx: &ExecutionContext,
            sub_agents: &[Arc<Agent>],
            _history: &[StepRecord],
        ) -> Result<Dispatch, OrchestrationError> {
            Ok(Dispatch::Delegate(sub_agents[0].clone()))
        }
    }

    #[tokio::test]
    async fn test_conditional_dispatch_budget() {
        let generator = ScriptedGenerator::repeating(text("again"));
        let looping = Arc::new(LeafAgent::builder("looping", generator.clone()).build());
        let composite =
            CompositeAgent::builder("loop", DelegationPolicy::Conditional(Arc::new(Forever)))
                .sub_agent(looping)
                .build();
        let config = OrchestratorConfig {
            max_dispatch_steps: 3,
            ..Default::default()
        };
        let (ctx, _events) = harness(config);
        let failure = composite.run(&ctx).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::DelegationDepthExceeded);
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_silent_aggregation_emits_no_final() {
        let (a, _) = leaf("a", "x");
        let composite = CompositeAgent::builder("quiet", DelegationPolicy::Sequential)
            .sub_agent(a)
            .aggregation(Aggregation::Silent)
            .build();
        let (ctx, events) = harness(OrchestratorConfig::default());
        let out = composite.run(&ctx).await.unwrap();
        drop(ctx);
        assert_eq!(out.text, None);
        assert!(!events.await.iter().any(|e| e.is_run_terminal()));
    }
}
