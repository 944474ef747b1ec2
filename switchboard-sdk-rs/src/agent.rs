pub mod composite;
pub mod leaf;

pub use composite::{
    Aggregation, CompositeAgent, CompositeBuilder, CompositeState, DelegationPolicy, Delegator,
    Dispatch, StepRecord,
};
pub use leaf::{LeafAgent, LeafBuilder};

use crate::context::ExecutionContext;
use crate::error::{AgentFailure, ErrorKind, OrchestrationError};
use crate::events::EventPayload;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Decides whether an agent is willing to take a request at all.
#[derive(Clone, Default)]
pub enum AcceptRule {
    #[default]
    Any,
    /// Accept when the request contains any keyword, case-insensitively.
    Keywords(Vec<String>),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl AcceptRule {
    pub fn keywords<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AcceptRule::Keywords(words.into_iter().map(|w| w.into().to_lowercase()).collect())
    }

    pub fn accepts(&self, request: &str) -> bool {
        match self {
            AcceptRule::Any => true,
            AcceptRule::Keywords(words) => {
                let request = request.to_lowercase();
                words.iter().any(|w| request.contains(w.as_str()))
            }
            AcceptRule::Predicate(f) => f(request),
        }
    }
}

impl fmt::Debug for AcceptRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptRule::Any => f.write_str("Any"),
            AcceptRule::Keywords(words) => f.debug_tuple("Keywords").field(words).finish(),
            AcceptRule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Name, declared purpose and accept rule shared by every agent variant.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub name: String,
    pub description: String,
    pub accept: AcceptRule,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            accept: AcceptRule::Any,
        }
    }
}

/// What a successful run hands back to its caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub agent: String,
    pub text: Option<String>,
}

pub type AgentResult = Result<AgentOutput, AgentFailure>;

/// A unit of work: either a single generation call or an orchestration of
/// sub-agents. New behaviours become new variants or new delegation policies.
pub enum Agent {
    Leaf(LeafAgent),
    Composite(CompositeAgent),
}

impl Agent {
    pub fn profile(&self) -> &AgentProfile {
        match self {
            Agent::Leaf(a) => &a.profile,
            Agent::Composite(a) => &a.profile,
        }
    }

    pub fn name(&self) -> &str {
        &self.profile().name
    }

    pub fn description(&self) -> &str {
        &self.profile().description
    }

    pub fn accepts(&self, request: &str) -> bool {
        self.profile().accept.accepts(request)
    }

    /// Runs the agent, writing its events into the context's sink.
    ///
    /// A failure is reported as exactly one error event from this agent,
    /// attributed to the agent where it started. Cancellation produces no
    /// event here; the runner announces it once for the whole run.
    pub fn run<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, AgentResult> {
        Box::pin(async move {
            let name = self.name();
            if ctx.is_cancelled() {
                return Err(AgentFailure::new(name, OrchestrationError::Cancelled));
            }
            tracing::info!(agent = name, depth = ctx.depth(), "agent started");

            let result = match self {
                Agent::Leaf(a) => a.run(ctx).await,
                Agent::Composite(a) => a.run(ctx).await,
            };

            match &result {
                Ok(_) => tracing::info!(agent = name, "agent finished"),
                Err(failure) if ctx.is_cancelled() || failure.kind() == ErrorKind::Cancelled => {
                    tracing::info!(agent = name, origin = %failure.origin, "agent cancelled")
                }
                Err(failure) => {
                    tracing::warn!(agent = name, origin = %failure.origin, "agent failed: {}", failure.error);
                    ctx.emit(
                        name,
                        EventPayload::Error {
                            error_kind: failure.kind(),
                            message: failure.error.to_string(),
                            origin: failure.origin.clone(),
                        },
                    )
                    .await;
                }
            }
            result
        })
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            Agent::Leaf(_) => "Leaf",
            Agent::Composite(_) => "Composite",
        };
        f.debug_struct("Agent")
            .field("variant", &variant)
            .field("name", &self.name())
            .finish()
    }
}
