//! Configuration for the agent.

use anyhow::{Context, Result};

/// Agent configuration.
///
/// Built once at startup and shared read-only for the life of the process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Agent identifier issued by the control plane.
    pub agent_id: String,

    /// Agent credential, used as the bus password and the API bearer token.
    pub agent_token: String,

    /// Control plane API base URL.
    pub api_url: String,

    /// MQTT broker URL (`mqtt://host:port`).
    pub mqtt_url: String,

    /// Path to the Docker engine socket.
    pub docker_socket: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let agent_id = std::env::var("FORA_AGENT_ID").context("FORA_AGENT_ID is not set")?;
        let agent_token =
            std::env::var("FORA_AGENT_TOKEN").context("FORA_AGENT_TOKEN is not set")?;

        let api_url =
            std::env::var("FORA_API").unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());

        let mqtt_url =
            std::env::var("FORA_MQTT").unwrap_or_else(|_| "mqtt://127.0.0.1:1883".to_string());

        let docker_socket = std::env::var("FORA_DOCKER_SOCKET")
            .unwrap_or_else(|_| "/var/run/docker.sock".to_string());

        let log_level = std::env::var("FORA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            agent_id,
            agent_token,
            api_url: api_url.trim_end_matches('/').to_string(),
            mqtt_url,
            docker_socket,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 6] = [
        "FORA_AGENT_ID",
        "FORA_AGENT_TOKEN",
        "FORA_API",
        "FORA_MQTT",
        "FORA_DOCKER_SOCKET",
        "FORA_LOG_LEVEL",
    ];

    // One test owns the process environment for all cases.
    #[test]
    fn test_from_env() {
        for var in VARS {
            std::env::remove_var(var);
        }

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("FORA_AGENT_ID"));

        std::env::set_var("FORA_AGENT_ID", "agent_1");
        std::env::set_var("FORA_AGENT_TOKEN", "secret");
        let config = Config::from_env().unwrap();
        assert_eq!(config.api_url, "http://127.0.0.1:3000");
        assert_eq!(config.mqtt_url, "mqtt://127.0.0.1:1883");
        assert_eq!(config.docker_socket, "/var/run/docker.sock");
        assert_eq!(config.log_level, "info");

        std::env::set_var("FORA_API", "https://api.fora.dev/");
        std::env::set_var("FORA_LOG_LEVEL", "debug");
        let config = Config::from_env().unwrap();
        assert_eq!(config.api_url, "https://api.fora.dev");
        assert_eq!(config.log_level, "debug");

        for var in VARS {
            std::env::remove_var(var);
        }
    }
}
