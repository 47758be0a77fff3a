//! Server configuration.

use std::path::Path;

use serde::Deserialize;

use weft_crypto::Keypair;

use crate::ServerError;

/// Relay server configuration, loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address for client sessions.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Hex-encoded 32-byte identity secret. A fresh identity is generated
    /// when absent.
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Idle timeout for established relays, in seconds.
    #[serde(default = "default_relay_idle_timeout_secs")]
    pub relay_idle_timeout_secs: u64,
    /// Log filter, `tracing_subscriber::EnvFilter` syntax.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8585".to_string()
}

fn default_relay_idle_timeout_secs() -> u64 {
    weft_core::DEFAULT_RELAY_IDLE_TIMEOUT.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            secret_key: None,
            relay_idle_timeout_secs: default_relay_idle_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// The configured identity, or a freshly generated one.
    pub fn keypair(&self) -> Result<Keypair, ServerError> {
        match &self.secret_key {
            Some(sk_hex) => {
                let bytes = hex::decode(sk_hex)
                    .map_err(|_| ServerError::Config("secret_key is not valid hex".into()))?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| ServerError::Config("secret_key must be 32 bytes".into()))?;
                Ok(Keypair::from_secret_bytes(bytes))
            }
            None => Ok(Keypair::generate()),
        }
    }
}

/// Loads a config file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ServerError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ServerError::Config(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&raw).map_err(|e| ServerError::Config(format!("{e}")))
}

/// Validates a config before use.
pub fn validate_config(config: &ServerConfig) -> Result<(), ServerError> {
    config
        .listen
        .parse::<std::net::SocketAddr>()
        .map_err(|_| ServerError::Config("invalid listen address".into()))?;
    if config.relay_idle_timeout_secs == 0 {
        return Err(ServerError::Config(
            "relay_idle_timeout_secs must be positive".into(),
        ));
    }
    config.keypair().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        validate_config(&ServerConfig::default()).unwrap();
    }

    #[test]
    fn parses_full_config() {
        let sk = hex::encode([7u8; 32]);
        let raw = format!(
            "listen = \"127.0.0.1:9000\"\nsecret_key = \"{sk}\"\nrelay_idle_timeout_secs = 60\nlog_level = \"debug\"\n"
        );
        let config: ServerConfig = toml::from_str(&raw).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.relay_idle_timeout_secs, 60);
    }

    #[test]
    fn rejects_bad_listen_address() {
        let config = ServerConfig {
            listen: "not-an-address".into(),
            ..Default::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn rejects_short_secret_key() {
        let config = ServerConfig {
            secret_key: Some("abcd".into()),
            ..Default::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn identity_is_stable_for_a_given_secret() {
        let config = ServerConfig {
            secret_key: Some(hex::encode([9u8; 32])),
            ..Default::default()
        };
        let a = config.keypair().unwrap();
        let b = config.keypair().unwrap();
        assert_eq!(a.public(), b.public());
    }
}
