use crate::agent::{Agent, Delegator, Dispatch, StepRecord};
use crate::context::ExecutionContext;
use crate::error::{GenerationError, OrchestrationError};
use crate::llm::{Generation, GenerationRequest, Generator, Message};
use crate::prompts::{extract_json, router_prompt};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingPolicy {
    /// Ask the generator and keep only the best match.
    #[default]
    Classify,
    /// Ask the generator and keep every scored candidate, best first.
    Ranked,
    /// Take the first accepting agent in roster order.
    FirstAccepting,
}

/// Picks the agent(s) that should handle a request.
///
/// The router never reads or writes session state; the same request against
/// the same roster is classified the same way however often it is asked.
pub struct Router {
    policy: RoutingPolicy,
    generator: Option<Arc<dyn Generator>>,
}

impl Router {
    pub fn classifying(generator: Arc<dyn Generator>) -> Self {
        Self {
            policy: RoutingPolicy::Classify,
            generator: Some(generator),
        }
    }

    pub fn ranked(generator: Arc<dyn Generator>) -> Self {
        Self {
            policy: RoutingPolicy::Ranked,
            generator: Some(generator),
        }
    }

    pub fn first_accepting() -> Self {
        Self {
            policy: RoutingPolicy::FirstAccepting,
            generator: None,
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Returns the chosen agents in preference order; empty when no agent
    /// accepts the request.
    pub async fn select(
        &self,
        request: &str,
        roster: &[Arc<Agent>],
    ) -> Result<Vec<Arc<Agent>>, OrchestrationError> {
        let candidates: Vec<&Arc<Agent>> = roster.iter().filter(|a| a.accepts(request)).collect();
        tracing::debug!(
            policy = ?self.policy,
            candidates = candidates.len(),
            "routing request"
        );

        if candidates.is_empty() {
            return Ok(vec![]);
        }
        if candidates.len() == 1 || self.policy == RoutingPolicy::FirstAccepting {
            return Ok(vec![candidates[0].clone()]);
        }

        let generator = self.generator.as_ref().ok_or_else(|| {
            OrchestrationError::RoutingUnavailable("no generator configured for classification".into())
        })?;
        let described: Vec<(&str, &str)> =
            candidates.iter().map(|a| (a.name(), a.description())).collect();
        let classification = GenerationRequest {
            messages: vec![Message::system(router_prompt(&described)), Message::user(request)],
            ..Default::default()
        };

        let reply = match generator.generate(&classification).await {
            Ok(Generation::Text(reply)) => reply,
            Ok(Generation::ToolCalls { .. }) => {
                return Err(unavailable(GenerationError::Malformed(
                    "classifier replied with tool calls".into(),
                )));
            }
            Err(e) => return Err(unavailable(e)),
        };

        let names: Vec<&str> = candidates.iter().map(|a| a.name()).collect();
        let ranking = rank_reply(&reply, &names);
        tracing::debug!(reply = %reply, ranking = ?ranking, "classifier reply");
        if ranking.is_empty() {
            return Err(OrchestrationError::RoutingUnavailable(format!(
                "classifier named no known agent: {}",
                reply.trim()
            )));
        }

        let chosen = ranking.into_iter().map(|i| candidates[i].clone());
        Ok(match self.policy {
            RoutingPolicy::Ranked => chosen.collect(),
            _ => chosen.take(1).collect(),
        })
    }

    /// [`Router::select`] as a suspension point of `ctx`: cancellation wins and
    /// a slow classifier counts as unavailable.
    pub async fn route(
        &self,
        ctx: &ExecutionContext,
        roster: &[Arc<Agent>],
    ) -> Result<Vec<Arc<Agent>>, OrchestrationError> {
        let timeout = ctx.config().generation_timeout();
        ctx.suspend(timeout, self.select(ctx.request(), roster))
            .await?
            .unwrap_or_else(|| {
                Err(unavailable(GenerationError::Timeout(
                    ctx.config().generation_timeout_secs,
                )))
            })
    }
}

fn unavailable(e: GenerationError) -> OrchestrationError {
    OrchestrationError::RoutingUnavailable(format!("classification failed: {}", e))
}

/// Candidate indexes named by a classifier reply, best first.
///
/// A JSON `scores` map wins, then a JSON `agent` field, then the earliest
/// candidate name mentioned as a whole word in free text. Equal scores keep
/// roster order.
fn rank_reply(reply: &str, names: &[&str]) -> Vec<usize> {
    let index_of = |name: &str| names.iter().position(|n| *n == name);
    let parsed = extract_json(reply);

    if let Some(Value::Object(scores)) = parsed.as_ref().and_then(|v| v.get("scores")) {
        let mut scored: Vec<(usize, f64)> = scores
            .iter()
            .filter_map(|(name, score)| Some((index_of(name.as_str())?, score.as_f64()?)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        if !scored.is_empty() {
            return scored.into_iter().map(|(i, _)| i).collect();
        }
    }

    let best = parsed
        .as_ref()
        .and_then(|v| v.get("agent"))
        .and_then(|v| v.as_str())
        .and_then(index_of)
        .or_else(|| {
            names
                .iter()
                .enumerate()
                .filter_map(|(i, name)| {
                    let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(name))).ok()?;
                    pattern.find(reply).map(|m| (m.start(), i))
                })
                .min()
                .map(|(_, i)| i)
        });

    match best {
        Some(best) => std::iter::once(best)
            .chain((0..names.len()).filter(|i| *i != best))
            .collect(),
        None => vec![],
    }
}

/// Conditional delegation that asks a [`Router`] for the best sub-agent and
/// hands the request over once.
pub struct RouteDelegator {
    router: Arc<Router>,
}

impl RouteDelegator {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Delegator for RouteDelegator {
    async fn next(
        &self,
        ctx: &ExecutionContext,
        sub_agents: &[Arc<Agent>],
        history: &[StepRecord],
    ) -> Result<Dispatch, OrchestrationError> {
        if !history.is_empty() {
            return Ok(Dispatch::Finish);
        }
        let chosen = self.router.route(ctx, sub_agents).await?;
        chosen
            .into_iter()
            .next()
            .map(Dispatch::Delegate)
            .ok_or_else(|| {
                OrchestrationError::RoutingUnavailable("no sub-agent accepts the request".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AcceptRule, CompositeAgent, DelegationPolicy, LeafAgent};
    use crate::config::OrchestratorConfig;
    use crate::error::ErrorKind;
    use crate::testing::{ScriptedGenerator, harness, text, tool_calls};
    use serde_json::json;

    fn agent(name: &str, description: &str, rule: AcceptRule) -> Arc<Agent> {
        let generator = ScriptedGenerator::new(vec![text(&format!("{} reply", name))]);
        Arc::new(
            LeafAgent::builder(name, generator)
                .description(description)
                .accepts(rule)
                .build(),
        )
    }

    fn roster() -> Vec<Arc<Agent>> {
        vec![
            agent("weather_agent", "Provides quick weather summaries.", AcceptRule::Any),
            agent("travel_agent", "Books flights and hotels.", AcceptRule::Any),
            agent(
                "order_agent",
                "Looks up and cancels orders.",
                AcceptRule::keywords(["order", "주문"]),
            ),
        ]
    }

    fn names(agents: &[Arc<Agent>]) -> Vec<&str> {
        agents.iter().map(|a| a.name()).collect()
    }

    #[tokio::test]
    async fn test_classify_picks_best_score() {
        let classifier = ScriptedGenerator::new(vec![text(
            r#"{"agent": "travel_agent", "scores": {"weather_agent": 0.2, "travel_agent": 0.9}}"#,
        )]);
        let router = Router::classifying(classifier.clone());
        let chosen = router.select("Book a flight to Tokyo", &roster()).await.unwrap();
        assert_eq!(names(&chosen), vec!["travel_agent"]);

        // order_agent's keywords filtered it out before classification
        let prompt = &classifier.requests()[0].messages[0].content;
        assert!(prompt.contains("travel_agent"));
        assert!(!prompt.contains("order_agent"));
    }

    #[tokio::test]
    async fn test_ranked_ties_keep_roster_order() {
        let classifier = ScriptedGenerator::new(vec![text(
            "```json\n{\"scores\": {\"travel_agent\": 0.5, \"weather_agent\": 0.5}}\n```",
        )]);
        let router = Router::ranked(classifier);
        let chosen = router.select("weekend plans?", &roster()).await.unwrap();
        assert_eq!(names(&chosen), vec!["weather_agent", "travel_agent"]);
    }

    #[tokio::test]
    async fn test_plain_text_reply() {
        let classifier = ScriptedGenerator::new(vec![text("I'd send this to weather_agent.")]);
        let router = Router::ranked(classifier);
        let chosen = router.select("Is it raining?", &roster()).await.unwrap();
        assert_eq!(names(&chosen), vec!["weather_agent", "travel_agent"]);
    }

    #[test]
    fn test_free_text_matches_whole_names() {
        let names = ["travel", "travel_agent"];
        assert_eq!(rank_reply("Route this to travel_agent.", &names), vec![1, 0]);
        assert_eq!(rank_reply("travel, not travel_agent", &names), vec![0, 1]);
        assert!(rank_reply("travelling soon", &names).is_empty());
    }

    #[tokio::test]
    async fn test_single_candidate_skips_classifier() {
        let classifier = ScriptedGenerator::new(vec![]);
        let router = Router::classifying(classifier.clone());
        let only = vec![agent("order_agent", "orders", AcceptRule::keywords(["order"]))];
        let chosen = router.select("cancel my order", &only).await.unwrap();
        assert_eq!(names(&chosen), vec!["order_agent"]);
        assert_eq!(classifier.calls(), 0);

        let none = router.select("hello", &only).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_classification_failures_are_unavailable() {
        for reply in [
            text("no idea"),
            tool_calls(vec![("lookup", json!({}))]),
            Err(GenerationError::Unavailable("quota".into())),
        ] {
            let router = Router::classifying(ScriptedGenerator::new(vec![reply]));
            let err = router.select("anything", &roster()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::RoutingUnavailable);
        }
    }

    #[tokio::test]
    async fn test_first_accepting_needs_no_generator() {
        let router = Router::first_accepting();
        let chosen = router.select("주문 취소해줘", &roster()).await.unwrap();
        assert_eq!(names(&chosen), vec!["weather_agent"]);
    }

    #[tokio::test]
    async fn test_route_delegator_hands_over_once() {
        let classifier = ScriptedGenerator::new(vec![text(r#"{"agent": "weather_agent"}"#)]);
        let delegator = RouteDelegator::new(Arc::new(Router::classifying(classifier)));
        let root = CompositeAgent::builder("root_agent", DelegationPolicy::Conditional(Arc::new(delegator)))
            .sub_agents(roster())
            .build();

        let (ctx, _events) = harness(OrchestratorConfig::default());
        let out = root.run(&ctx).await.unwrap();
        assert_eq!(out.text.as_deref(), Some("weather_agent reply"));
    }
}
