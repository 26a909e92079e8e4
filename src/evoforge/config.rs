//! Process configuration read from the environment.
//!
//! Recognized variables: `ORACLE_API_KEY`, `ORACLE_BASE_URL`,
//! `DEFAULT_IDEATOR_MODEL`, `DEFAULT_SIMULATOR_MODEL`,
//! `DEFAULT_CRITIC_MODEL`, `DEFAULT_SYNTHESIS_MODEL`, `HTTP_PORT`,
//! `MAX_AGENTS`, `MAX_ITERATIONS`, `EVENT_BUS_CAPACITY`, `LOG_LEVEL`.

use crate::evoforge::clients::openai::DEFAULT_BASE_URL;
use crate::evoforge::orchestrator::RoleModels;
use std::env;

/// Default control-plane bind port.
pub const DEFAULT_HTTP_PORT: u16 = 8042;

/// Top-level configuration for the server binary.
#[derive(Debug, Clone)]
pub struct EvoForgeConfig {
    /// Credential for the text-completion provider.  `None` means the
    /// process cannot reach a real oracle.
    pub api_key: Option<String>,
    pub base_url: String,
    pub models: RoleModels,
    pub http_port: u16,
    /// Default agent cap applied to mandates that do not set one.
    pub max_agents: usize,
    /// Default iteration budget applied to mandates that do not set one.
    pub max_iterations: u32,
    /// Per-subscriber event inbox capacity.
    pub event_bus_capacity: usize,
    /// error | warn | info | debug
    pub log_level: String,
}

impl Default for EvoForgeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            models: RoleModels::default(),
            http_port: DEFAULT_HTTP_PORT,
            max_agents: 12,
            max_iterations: 10,
            event_bus_capacity: crate::evoforge::bus::DEFAULT_CAPACITY,
            log_level: String::from("info"),
        }
    }
}

impl EvoForgeConfig {
    /// Read configuration from the process environment, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let models = RoleModels {
            ideator: env_or("DEFAULT_IDEATOR_MODEL", &defaults.models.ideator),
            simulator: env_or("DEFAULT_SIMULATOR_MODEL", &defaults.models.simulator),
            critic: env_or("DEFAULT_CRITIC_MODEL", &defaults.models.critic),
            synthesizer: env_or("DEFAULT_SYNTHESIS_MODEL", &defaults.models.synthesizer),
        };
        Self {
            api_key: env::var("ORACLE_API_KEY").ok().filter(|k| !k.is_empty()),
            base_url: env_or("ORACLE_BASE_URL", &defaults.base_url),
            models,
            http_port: env_parsed("HTTP_PORT", defaults.http_port),
            max_agents: env_parsed("MAX_AGENTS", defaults.max_agents),
            max_iterations: env_parsed("MAX_ITERATIONS", defaults.max_iterations),
            event_bus_capacity: env_parsed("EVENT_BUS_CAPACITY", defaults.event_bus_capacity),
            log_level: env_or("LOG_LEVEL", &defaults.log_level),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_parsed<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EvoForgeConfig::default();
        assert_eq!(config.http_port, 8042);
        assert_eq!(config.max_agents, 12);
        assert_eq!(config.event_bus_capacity, 256);
        assert!(config.api_key.is_none());
    }
}
