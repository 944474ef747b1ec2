//! Scenario graphs: components that hand a conversation from one to the next.
//!
//! A scenario runs as a conditional composite. Each component is an agent with
//! structured output; the `decision` field of its `<agent>_output` record
//! decides whether the scenario moves on (`complete`), waits for the user
//! (`continue`) or gives up (`failed`). Progress lives in the session state
//! under `scenario_state`, so a later run seeded with that state resumes at
//! the component that was waiting.

use crate::agent::{
    AcceptRule, Agent, Aggregation, CompositeAgent, DelegationPolicy, Delegator, Dispatch,
    StepRecord,
};
use crate::context::ExecutionContext;
use crate::error::{AgentFailure, OrchestrationError, ScenarioError};
use crate::session::{SessionState, StateMap, StateValue};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub const SCENARIO_STATE_KEY: &str = "scenario_state";
pub const COMPONENT_DATA_KEY: &str = "component_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    Pending,
    /// Waiting for more user input.
    Running,
    Completed,
    Failed,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Pending => "pending",
            ComponentStatus::Running => "running",
            ComponentStatus::Completed => "completed",
            ComponentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ComponentStatus::Pending),
            "running" => Some(ComponentStatus::Running),
            "completed" => Some(ComponentStatus::Completed),
            "failed" => Some(ComponentStatus::Failed),
            _ => None,
        }
    }

    /// Status implied by a component's output record. Anything but
    /// `continue` or `failed` counts as completed.
    pub fn from_output(output: &StateMap) -> Self {
        match output.get("decision").and_then(|d| d.as_text()) {
            Some("continue") => ComponentStatus::Running,
            Some("failed") => ComponentStatus::Failed,
            _ => ComponentStatus::Completed,
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ConditionFn = dyn Fn(&StateMap, &SessionState) -> bool + Send + Sync;

#[derive(Clone)]
pub enum Condition {
    /// The output's `decision` field equals the given text.
    Decision(String),
    FieldEquals { field: String, value: StateValue },
    StateEquals { key: String, value: StateValue },
    Custom(Arc<ConditionFn>),
}

impl Condition {
    fn matches(&self, output: &StateMap, state: &SessionState) -> bool {
        match self {
            Condition::Decision(expected) => {
                output.get("decision").and_then(|d| d.as_text()) == Some(expected.as_str())
            }
            Condition::FieldEquals { field, value } => output.get(field) == Some(value),
            Condition::StateEquals { key, value } => state.get(key).as_ref() == Some(value),
            Condition::Custom(f) => f(output, state),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Decision(d) => f.debug_tuple("Decision").field(d).finish(),
            Condition::FieldEquals { field, value } => f
                .debug_struct("FieldEquals")
                .field("field", field)
                .field("value", value)
                .finish(),
            Condition::StateEquals { key, value } => f
                .debug_struct("StateEquals")
                .field("key", key)
                .field("value", value)
                .finish(),
            Condition::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Sends the scenario to `target` when `condition` holds.
#[derive(Debug, Clone)]
pub struct RoutingCondition {
    pub target: String,
    pub condition: Condition,
}

impl RoutingCondition {
    pub fn on_decision(decision: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            condition: Condition::Decision(decision.into()),
        }
    }

    pub fn field_equals(
        field: impl Into<String>,
        value: impl Into<StateValue>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            condition: Condition::FieldEquals {
                field: field.into(),
                value: value.into(),
            },
        }
    }

    pub fn state_equals(
        key: impl Into<String>,
        value: impl Into<StateValue>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            condition: Condition::StateEquals {
                key: key.into(),
                value: value.into(),
            },
        }
    }
}

#[derive(Clone)]
pub struct ScenarioComponent {
    pub id: String,
    pub agent: Arc<Agent>,
    /// Fallback targets; only the first one is used.
    pub next_components: Vec<String>,
    /// Checked in order before the fallback.
    pub routing_conditions: Vec<RoutingCondition>,
}

impl ScenarioComponent {
    pub fn new(id: impl Into<String>, agent: Arc<Agent>) -> Self {
        Self {
            id: id.into(),
            agent,
            next_components: vec![],
            routing_conditions: vec![],
        }
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next_components.push(next.into());
        self
    }

    pub fn route(mut self, condition: RoutingCondition) -> Self {
        self.routing_conditions.push(condition);
        self
    }

    fn output(&self, state: &SessionState) -> StateMap {
        state
            .get(&format!("{}_output", self.agent.name()))
            .and_then(|v| v.as_record().cloned())
            .unwrap_or_default()
    }

    fn next_component(&self, output: &StateMap, state: &SessionState) -> Option<String> {
        self.routing_conditions
            .iter()
            .find(|rc| rc.condition.matches(output, state))
            .map(|rc| rc.target.clone())
            .or_else(|| self.next_components.first().cloned())
    }
}

pub struct Scenario {
    name: String,
    entry_component: String,
    description: String,
    accept: AcceptRule,
    components: Vec<ScenarioComponent>,
    failure_component: Option<Arc<Agent>>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, entry_component: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: format!("Scenario agent: {}", name),
            name,
            entry_component: entry_component.into(),
            accept: AcceptRule::Any,
            components: vec![],
            failure_component: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn accepts(mut self, rule: AcceptRule) -> Self {
        self.accept = rule;
        self
    }

    pub fn component(mut self, component: ScenarioComponent) -> Self {
        self.components.push(component);
        self
    }

    /// Agent run when a component reports `failed` or a component run errors.
    pub fn failure_component(mut self, agent: Arc<Agent>) -> Self {
        self.failure_component = Some(agent);
        self
    }

    /// Validates the graph and turns it into a conditional composite named
    /// `scenario_agent_<name>`.
    pub fn build(self) -> Result<Agent, ScenarioError> {
        let mut seen = HashSet::new();
        for component in &self.components {
            if !seen.insert(component.id.as_str()) {
                return Err(ScenarioError::DuplicateComponent(component.id.clone()));
            }
        }
        if !seen.contains(self.entry_component.as_str()) {
            return Err(ScenarioError::UnknownEntry {
                scenario: self.name,
                entry: self.entry_component,
            });
        }
        for component in &self.components {
            let missing: Vec<&str> = component
                .routing_conditions
                .iter()
                .map(|rc| rc.target.as_str())
                .chain(component.next_components.iter().map(String::as_str))
                .filter(|target| !seen.contains(target))
                .collect();
            if !missing.is_empty() {
                tracing::warn!(scenario = %self.name, component = %component.id, ?missing, "routing targets not found");
            }
        }

        let agent_name = format!("scenario_agent_{}", self.name);
        let mut sub_agents: Vec<Arc<Agent>> =
            self.components.iter().map(|c| c.agent.clone()).collect();
        sub_agents.extend(self.failure_component.clone());

        let delegator = ScenarioDelegator {
            agent_name: agent_name.clone(),
            scenario_name: self.name,
            entry_component: self.entry_component,
            components: self.components,
            failure_component: self.failure_component,
        };
        Ok(
            CompositeAgent::builder(agent_name, DelegationPolicy::Conditional(Arc::new(delegator)))
                .description(self.description)
                .accepts(self.accept)
                .sub_agents(sub_agents)
                .aggregation(Aggregation::LastOutput)
                .build(),
        )
    }
}

/// The bookkeeping record stored under `scenario_state`.
#[derive(Debug, Clone, PartialEq)]
struct Progress {
    scenario_name: String,
    current_component: String,
    component_status: BTreeMap<String, ComponentStatus>,
    completed: bool,
    completion_reason: String,
    handling_failure: bool,
}

impl Progress {
    fn start(scenario_name: &str, entry: &str) -> Self {
        Self {
            scenario_name: scenario_name.to_string(),
            current_component: entry.to_string(),
            component_status: BTreeMap::new(),
            completed: false,
            completion_reason: String::new(),
            handling_failure: false,
        }
    }

    fn load(state: &SessionState) -> Option<Self> {
        let value = state.get(SCENARIO_STATE_KEY)?;
        let record = value.as_record()?;
        let text = |key: &str| {
            record
                .get(key)
                .and_then(|v| v.as_text())
                .unwrap_or_default()
                .to_string()
        };
        let flag = |key: &str| record.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
        let component_status = record
            .get("component_status")
            .and_then(|v| v.as_record())
            .map(|statuses| {
                statuses
                    .iter()
                    .filter_map(|(id, s)| Some((id.clone(), ComponentStatus::parse(s.as_text()?)?)))
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            scenario_name: text("scenario_name"),
            current_component: text("current_component"),
            component_status,
            completed: flag("completed"),
            completion_reason: text("completion_reason"),
            handling_failure: flag("handling_failure"),
        })
    }

    fn to_value(&self) -> StateValue {
        let statuses: StateMap = self
            .component_status
            .iter()
            .map(|(id, s)| (id.clone(), StateValue::from(s.as_str())))
            .collect();
        let mut record = StateMap::new();
        record.insert("scenario_name".into(), self.scenario_name.clone().into());
        record.insert("current_component".into(), self.current_component.clone().into());
        record.insert("component_status".into(), statuses.into());
        record.insert("completed".into(), self.completed.into());
        record.insert("completion_reason".into(), self.completion_reason.clone().into());
        record.insert("handling_failure".into(), self.handling_failure.into());
        StateValue::Record(record)
    }
}

/// Drives a [`Scenario`] one component per dispatch round.
pub struct ScenarioDelegator {
    agent_name: String,
    scenario_name: String,
    entry_component: String,
    components: Vec<ScenarioComponent>,
    failure_component: Option<Arc<Agent>>,
}

impl ScenarioDelegator {
    fn component(&self, id: &str) -> Option<&ScenarioComponent> {
        self.components.iter().find(|c| c.id == id)
    }

    async fn save(&self, ctx: &ExecutionContext, progress: &Progress) {
        ctx.write_state(&self.agent_name, SCENARIO_STATE_KEY, progress.to_value())
            .await;
    }

    /// Picks up a suspended scenario of the same name or starts a fresh one.
    async fn restore(&self, ctx: &ExecutionContext) -> Progress {
        match Progress::load(ctx.state()) {
            Some(p) if p.scenario_name == self.scenario_name && !p.current_component.is_empty() => {
                tracing::info!(scenario = %self.scenario_name, component = %p.current_component, "resuming scenario");
                p
            }
            _ => {
                tracing::info!(scenario = %self.scenario_name, "starting scenario");
                let p = Progress::start(&self.scenario_name, &self.entry_component);
                self.save(ctx, &p).await;
                p
            }
        }
    }

    /// Records the component's output per component and merges its fields
    /// into the session state.
    async fn merge_context(&self, ctx: &ExecutionContext, component_id: &str, output: &StateMap) {
        let mut data = ctx
            .state()
            .get(COMPONENT_DATA_KEY)
            .and_then(|v| v.as_record().cloned())
            .unwrap_or_default();
        data.insert(component_id.to_string(), StateValue::Record(output.clone()));
        ctx.write_state(&self.agent_name, COMPONENT_DATA_KEY, data.into())
            .await;
        for (key, value) in output {
            ctx.write_state(&self.agent_name, key, value.clone()).await;
        }
    }

    async fn complete(&self, ctx: &ExecutionContext, mut progress: Progress, reason: &str) -> Dispatch {
        progress.completed = true;
        progress.completion_reason = reason.to_string();
        self.save(ctx, &progress).await;
        tracing::info!(scenario = %self.scenario_name, reason, "scenario completed");
        self.cleanup(ctx).await;
        Dispatch::Finish
    }

    async fn cleanup(&self, ctx: &ExecutionContext) {
        for key in [SCENARIO_STATE_KEY, COMPONENT_DATA_KEY] {
            ctx.remove_state(&self.agent_name, key).await;
        }
    }

    async fn enter(&self, ctx: &ExecutionContext, progress: Progress) -> Dispatch {
        match self.component(&progress.current_component) {
            Some(component) => {
                tracing::debug!(scenario = %self.scenario_name, component = %component.id, "running component");
                Dispatch::Delegate(component.agent.clone())
            }
            None => {
                tracing::error!(scenario = %self.scenario_name, component = %progress.current_component, "component not found");
                self.complete(ctx, progress, "component_not_found").await
            }
        }
    }
}

#[async_trait]
impl Delegator for ScenarioDelegator {
    async fn next(
        &self,
        ctx: &ExecutionContext,
        _sub_agents: &[Arc<Agent>],
        history: &[StepRecord],
    ) -> Result<Dispatch, OrchestrationError> {
        if history.is_empty() {
            let progress = self.restore(ctx).await;
            return Ok(self.enter(ctx, progress).await);
        }

        let mut progress = Progress::load(ctx.state())
            .unwrap_or_else(|| Progress::start(&self.scenario_name, &self.entry_component));
        if progress.handling_failure {
            return Ok(self.complete(ctx, progress, "failure_handled").await);
        }

        let current = progress.current_component.clone();
        let Some(component) = self.component(&current) else {
            return Ok(self.complete(ctx, progress, "component_not_found").await);
        };
        let output = component.output(ctx.state());
        let status = ComponentStatus::from_output(&output);
        tracing::info!(scenario = %self.scenario_name, component = %current, %status, "component finished");

        progress.component_status.insert(current.clone(), status);
        self.save(ctx, &progress).await;
        self.merge_context(ctx, &current, &output).await;

        match status {
            ComponentStatus::Running => {
                progress.completed = false;
                progress.completion_reason = "user_input_required".into();
                self.save(ctx, &progress).await;
                tracing::info!(scenario = %self.scenario_name, component = %current, "waiting for user input");
                Ok(Dispatch::Finish)
            }
            ComponentStatus::Failed => match &self.failure_component {
                Some(agent) => {
                    progress.handling_failure = true;
                    self.save(ctx, &progress).await;
                    Ok(Dispatch::Delegate(agent.clone()))
                }
                None => {
                    tracing::warn!(scenario = %self.scenario_name, "no failure component");
                    Ok(self.complete(ctx, progress, "failure_handled").await)
                }
            },
            ComponentStatus::Completed | ComponentStatus::Pending => {
                match component.next_component(&output, ctx.state()) {
                    Some(next) => {
                        progress.current_component = next;
                        self.save(ctx, &progress).await;
                        Ok(self.enter(ctx, progress).await)
                    }
                    None => Ok(self.complete(ctx, progress, "no_next_component").await),
                }
            }
        }
    }

    async fn on_failure(
        &self,
        ctx: &ExecutionContext,
        _sub_agents: &[Arc<Agent>],
        failure: &AgentFailure,
    ) -> Option<Arc<Agent>> {
        tracing::error!(scenario = %self.scenario_name, origin = %failure.origin, "scenario failed: {}", failure.error);
        let handling_failure = Progress::load(ctx.state()).is_some_and(|p| p.handling_failure);
        self.cleanup(ctx).await;
        // the failure component itself failed
        if handling_failure {
            return None;
        }
        self.failure_component.clone()
    }
}
