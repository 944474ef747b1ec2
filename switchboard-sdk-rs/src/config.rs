use crate::error::ConfigError;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "SWITCHBOARD_";

/// Limits and timeouts applied to every run started by a [`crate::runner::Runner`].
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Tool invocations a single leaf agent may make before giving up.
    pub max_tool_calls: usize,
    /// Deepest delegation level allowed; the root agent runs at depth 0.
    pub max_delegation_depth: u32,
    /// Dispatch rounds a conditional composite may take in one run.
    pub max_dispatch_steps: usize,
    pub generation_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    /// Capacity of the event channel between the run task and the caller.
    pub event_buffer: usize,
    /// Emit a tool-result event after every tool invocation.
    pub stream_tool_results: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 8,
            max_delegation_depth: 4,
            max_dispatch_steps: 16,
            generation_timeout_secs: 60,
            tool_timeout_secs: 30,
            event_buffer: 64,
            stream_tool_results: false,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `SWITCHBOARD_*` environment variables,
    /// e.g. `SWITCHBOARD_MAX_TOOL_CALLS=4`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        override_from(&lookup, "MAX_TOOL_CALLS", &mut config.max_tool_calls)?;
        override_from(&lookup, "MAX_DELEGATION_DEPTH", &mut config.max_delegation_depth)?;
        override_from(&lookup, "MAX_DISPATCH_STEPS", &mut config.max_dispatch_steps)?;
        override_from(
            &lookup,
            "GENERATION_TIMEOUT_SECS",
            &mut config.generation_timeout_secs,
        )?;
        override_from(&lookup, "TOOL_TIMEOUT_SECS", &mut config.tool_timeout_secs)?;
        override_from(&lookup, "EVENT_BUFFER", &mut config.event_buffer)?;
        override_from(
            &lookup,
            "STREAM_TOOL_RESULTS",
            &mut config.stream_tool_results,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tool_calls == 0 {
            return Err(ConfigError::Zero("max_tool_calls"));
        }
        if self.max_dispatch_steps == 0 {
            return Err(ConfigError::Zero("max_dispatch_steps"));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Zero("event_buffer"));
        }
        Ok(())
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

fn override_from<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    if let Some(raw) = lookup(&key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw })?;
    }
    Ok(())
}
