use crate::session::SessionState;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;

pub const ROUTER_PROMPT: &str = r#"You are a request router. Decide which agent is best suited to handle the user's request.

<AGENTS>
{agents}
</AGENTS>

<OUTPUT>
Reply with JSON only:
{"agent": "<agent name>", "scores": {"<agent name>": <number between 0 and 1>, ...}}
Score every agent listed above. Use the exact agent names.
</OUTPUT>
"#;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(\?)?\}").unwrap();
    static ref JSON_FENCE: Regex = Regex::new(r"(?s)```json\s*\n(.*?)\n\s*```").unwrap();
}

/// Substitutes `{key}` placeholders with values from the session state.
///
/// `{key?}` renders empty when the key is absent; a missing required key is
/// left in place so the gap stays visible in the prompt.
pub fn render_instruction(template: &str, state: &SessionState) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            match state.get(key) {
                Some(value) => value.to_string(),
                None if caps.get(2).is_some() => String::new(),
                None => {
                    tracing::warn!(key, "instruction references missing state key");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Parses a JSON reply, accepting either bare JSON or a ```json fenced block.
pub fn extract_json(text: &str) -> Option<Value> {
    let body = JSON_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);
    match serde_json::from_str(body.trim()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!("reply is not JSON: {}", e);
            None
        }
    }
}

pub fn router_prompt(candidates: &[(&str, &str)]) -> String {
    let agents = candidates
        .iter()
        .map(|(name, description)| format!("- {}: {}", name, description))
        .collect::<Vec<_>>()
        .join("\n");
    ROUTER_PROMPT.replace("{agents}", &agents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_instruction() {
        let state = SessionState::new();
        state.set("target_city", "Tokyo");
        let out = render_instruction(
            "Describe {target_city}. Budget: {budget?}. Dates: {dates}.",
            &state,
        );
        assert_eq!(out, "Describe Tokyo. Budget: . Dates: {dates}.");
    }

    #[test]
    fn test_json_braces_are_not_placeholders() {
        let state = SessionState::new();
        let template = "Reply as:\n{\n  \"decision\": \"complete\"\n}";
        assert_eq!(render_instruction(template, &state), template);
    }

    #[test]
    fn test_extract_json_variants() {
        let fenced = "Here you go:\n```json\n{\"decision\": \"complete\"}\n```";
        assert_eq!(extract_json(fenced), Some(json!({"decision": "complete"})));
        assert_eq!(extract_json(" {\"a\": 1} "), Some(json!({"a": 1})));
        assert_eq!(extract_json("Paris sounds lovely"), None);
    }

    #[test]
    fn test_router_prompt_lists_agents() {
        let prompt = router_prompt(&[
            ("weather_agent", "Provides quick weather summaries."),
            ("travel_agent", "Books flights."),
        ]);
        assert!(prompt.contains("- weather_agent: Provides quick weather summaries."));
        assert!(prompt.contains("- travel_agent: Books flights."));
        assert!(!prompt.contains("{agents}"));
    }
}
