use std::path::PathBuf;
use std::time::Duration;

use serde_derive::Deserialize;
use thiserror::Error;

use crate::arp::DEFAULT_INTERFACE;
use crate::scanner::{DEFAULT_COMMAND, DEFAULT_MIN_REFRESH_INTERVAL};
use crate::session::{
    Credential, DEFAULT_COMMAND_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PROMPT,
    SessionTimeouts, SshTarget,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(12);

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub router: RouterConfig,
    pub scan: Option<ScanConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RouterConfig {
    pub host: String,
    pub port: Option<u16>,
    #[serde(default = "default_username")]
    pub username: String,
    pub key_path: Option<PathBuf>,
    pub password: Option<String>,
    /// Only ARP entries on this interface are reported.
    pub interface: Option<String>,
    pub command: Option<String>,
    /// Regex matched against the tail of the session output.
    pub prompt: Option<String>,
    pub accept_new_host_keys: Option<bool>,
}

fn default_username() -> String {
    "root".to_string()
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub min_refresh_interval_seconds: Option<u64>,
    pub handshake_timeout_seconds: Option<u64>,
    pub command_timeout_seconds: Option<u64>,
    pub poll_interval_seconds: Option<u64>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("router.{0} must not be empty")]
    Empty(&'static str),
    #[error("router needs either key_path or password")]
    MissingCredential,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.router.credential().map(|_| ())
    }

    pub fn scan(&self) -> ScanConfig {
        self.scan.clone().unwrap_or_default()
    }
}

impl RouterConfig {
    /// Key files win over passwords when both are configured.
    pub fn credential(&self) -> Result<Credential, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Empty("host"));
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::Empty("username"));
        }
        match (&self.key_path, &self.password) {
            (Some(path), _) if path.as_os_str().is_empty() => Err(ConfigError::Empty("key_path")),
            (Some(path), _) => Ok(Credential::KeyFile(path.clone())),
            (None, Some(password)) if password.is_empty() => Err(ConfigError::Empty("password")),
            (None, Some(password)) => Ok(Credential::Password(password.clone())),
            (None, None) => Err(ConfigError::MissingCredential),
        }
    }

    pub fn target(&self) -> Result<SshTarget, ConfigError> {
        Ok(SshTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            credential: self.credential()?,
            accept_new_host_keys: self.accept_new_host_keys.unwrap_or(false),
        })
    }

    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or(DEFAULT_INTERFACE)
    }

    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_COMMAND)
    }

    pub fn prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(DEFAULT_PROMPT)
    }
}

impl ScanConfig {
    pub fn min_refresh_interval(&self) -> Duration {
        self.min_refresh_interval_seconds
            .map_or(DEFAULT_MIN_REFRESH_INTERVAL, Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_seconds
            .map_or(DEFAULT_POLL_INTERVAL, Duration::from_secs)
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            handshake: self
                .handshake_timeout_seconds
                .map_or(DEFAULT_HANDSHAKE_TIMEOUT, Duration::from_secs),
            command: self
                .command_timeout_seconds
                .map_or(DEFAULT_COMMAND_TIMEOUT, Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MQTT: &str = r#"
        [mqtt]
        host = "localhost"
        port = 1883
        username = "user"
        password = "pass"
    "#;

    fn parse(router: &str) -> AppConfig {
        toml::de::from_str(&format!("{MQTT}\n{router}")).unwrap()
    }

    #[test]
    fn test_config() {
        let config = parse(
            r#"
            [router]
            host = "192.168.1.1"
            key_path = "/etc/arp-presence/id_ed25519"

            [scan]
            min_refresh_interval_seconds = 90
            handshake_timeout_seconds = 20
            poll_interval_seconds = 30
        "#,
        );
        assert!(config.mqtt.host == "localhost");
        assert!(config.validate().is_ok());
        assert_eq!(config.router.username, "root");
        assert_eq!(config.router.interface(), "br-lan");
        assert_eq!(config.router.command(), "arp");

        let scan = config.scan();
        assert_eq!(scan.min_refresh_interval(), Duration::from_secs(90));
        assert_eq!(scan.poll_interval(), Duration::from_secs(30));
        assert_eq!(scan.timeouts().handshake, Duration::from_secs(20));
        assert_eq!(scan.timeouts().command, DEFAULT_COMMAND_TIMEOUT);
    }

    #[test]
    fn test_scan_defaults() {
        let config = parse(
            r#"
            [router]
            host = "192.168.1.1"
            password = "secret"
        "#,
        );
        let scan = config.scan();
        assert_eq!(scan.min_refresh_interval(), Duration::from_secs(60));
        assert_eq!(scan.timeouts(), SessionTimeouts::default());
        assert_eq!(
            config.router.credential(),
            Ok(Credential::Password("secret".to_string()))
        );
    }

    #[test]
    fn test_empty_host_rejected() {
        let config = parse(
            r#"
            [router]
            host = ""
            password = "secret"
        "#,
        );
        assert_eq!(config.validate(), Err(ConfigError::Empty("host")));
    }

    #[test]
    fn test_empty_username_rejected() {
        let config = parse(
            r#"
            [router]
            host = "192.168.1.1"
            username = " "
            key_path = "/root/.ssh/id_rsa"
        "#,
        );
        assert_eq!(config.validate(), Err(ConfigError::Empty("username")));
    }

    #[test]
    fn test_missing_credential_rejected() {
        let config = parse(
            r#"
            [router]
            host = "192.168.1.1"
        "#,
        );
        assert_eq!(config.validate(), Err(ConfigError::MissingCredential));

        let config = parse(
            r#"
            [router]
            host = "192.168.1.1"
            password = ""
        "#,
        );
        assert_eq!(config.validate(), Err(ConfigError::Empty("password")));
    }
}
