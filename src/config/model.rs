//! Configuration data model.
//!
//! All structs derive `Serialize`/`Deserialize` for TOML persistence.
//! Every field has a default so an empty file yields an anonymous,
//! read-only client with no channels.

use serde::{Deserialize, Serialize};

use super::nickname::anonymous_nickname;
use crate::client::events::EventKind;
use crate::irc::resolver::{ServiceClass, DEFAULT_PROBE_TIMEOUT};

/// Root client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Login credentials. Both empty means an anonymous login.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Nickname and password actually sent at logon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub nickname: String,
    pub password: String,
}

const ANONYMOUS_PASSWORD: &str = "anonymous";

impl IdentityConfig {
    /// Resolve the logon credentials. Without a username a random anonymous
    /// nickname is drawn; a password lacking the `oauth:` prefix gets one.
    pub fn credentials(&self) -> Credentials {
        let nickname = match self.username.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_lowercase(),
            _ => return Credentials {
                nickname: anonymous_nickname(),
                password: ANONYMOUS_PASSWORD.to_string(),
            },
        };
        let password = match self.password.as_deref() {
            Some(p) if p.starts_with("oauth:") => p.to_string(),
            Some(p) if !p.is_empty() => format!("oauth:{}", p),
            _ => ANONYMOUS_PASSWORD.to_string(),
        };
        Credentials { nickname, password }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub preferred_server: Option<String>,
    #[serde(default)]
    pub preferred_port: Option<u16>,
    #[serde(default)]
    pub service_class: ServiceClass,
    #[serde(default = "default_true")]
    pub reconnect: bool,
    /// Reconnect attempts allowed before giving up; unlimited when unset.
    #[serde(default)]
    pub retry_budget: Option<u32>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            preferred_server: None,
            preferred_port: None,
            service_class: ServiceClass::Chat,
            reconnect: true,
            retry_budget: None,
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsConfig {
    /// `TWITCHCLIENT` compatibility level; 4 when unset.
    #[serde(default)]
    pub legacy_level: Option<u8>,
    #[serde(default = "default_true")]
    pub use_tags: bool,
    #[serde(default = "default_true")]
    pub exit_on_crash: bool,
    #[serde(default)]
    pub debug_details: bool,
    /// Report our own outgoing chat as chat/action events.
    #[serde(default)]
    pub emit_self: bool,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: char,
    /// Event kinds left out of debug logging.
    #[serde(default)]
    pub debug_ignore: Vec<EventKind>,
}

impl OptionsConfig {
    pub fn level(&self) -> u8 {
        self.legacy_level.unwrap_or(DEFAULT_LEGACY_LEVEL)
    }

    /// Levels 1 and 2 predate the free-text control sentences.
    pub fn is_early_legacy(&self) -> bool {
        matches!(self.legacy_level, Some(1) | Some(2))
    }
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            legacy_level: None,
            use_tags: true,
            exit_on_crash: true,
            debug_details: false,
            emit_self: false,
            command_prefix: default_command_prefix(),
            debug_ignore: Vec::new(),
        }
    }
}

/// Chat transcript settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
        }
    }
}

pub const DEFAULT_LEGACY_LEVEL: u8 = 4;

fn default_true() -> bool {
    true
}
fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT.as_millis() as u64
}
fn default_command_prefix() -> char {
    '!'
}
fn default_log_dir() -> String {
    "~/.local/share/tmiclient/logs".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert!(config.channels.is_empty());
        assert!(config.connection.reconnect);
        assert_eq!(config.connection.service_class, ServiceClass::Chat);
        assert_eq!(config.connection.probe_timeout_ms, 5000);
        assert!(config.options.use_tags);
        assert!(config.options.exit_on_crash);
        assert_eq!(config.options.command_prefix, '!');
        assert_eq!(config.options.level(), 4);
        assert!(!config.logging.enabled);
    }

    #[test]
    fn full_file_round_trips_fields() {
        let config: ClientConfig = toml::from_str(
            r##"
            channels = ["#one", "two"]

            [identity]
            username = "Bot"
            password = "secret"

            [connection]
            service_class = "events"
            preferred_port = 80
            reconnect = false
            retry_budget = 3

            [options]
            legacy_level = 2
            emit_self = true
            command_prefix = "?"
            debug_ignore = ["ping", "pong"]
            "##,
        )
        .unwrap();

        assert_eq!(config.channels, vec!["#one", "two"]);
        assert_eq!(config.connection.service_class, ServiceClass::Events);
        assert_eq!(config.connection.retry_budget, Some(3));
        assert!(config.options.is_early_legacy());
        assert_eq!(config.options.debug_ignore, vec![EventKind::Ping, EventKind::Pong]);

        let creds = config.identity.credentials();
        assert_eq!(creds.nickname, "bot");
        assert_eq!(creds.password, "oauth:secret");
    }

    #[test]
    fn unknown_service_class_falls_back_to_chat() {
        let config: ClientConfig = toml::from_str(
            r#"
            [connection]
            service_class = "bogus"
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.service_class, ServiceClass::Chat);
    }

    #[test]
    fn anonymous_identity_uses_generated_nickname() {
        let creds = IdentityConfig::default().credentials();
        assert!(creds.nickname.starts_with("justinfan"));
        assert_eq!(creds.password, ANONYMOUS_PASSWORD);
    }

    #[test]
    fn prefixed_password_is_kept() {
        let identity = IdentityConfig {
            username: Some("bot".into()),
            password: Some("oauth:abc".into()),
        };
        assert_eq!(identity.credentials().password, "oauth:abc");
    }
}
