//! Diagnostics and chat transcripts.
//!
//! [`init`] installs the `tracing` subscriber. [`ChatLogger`] writes chat
//! events to daily per-channel files named `<channel>_<date>.log` under the
//! configured log directory (default: `~/.local/share/tmiclient/logs/`).

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::client::events::Event;
use crate::config::{LoggingConfig, OptionsConfig};

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// verbosity. Calling this twice is harmless.
pub fn init(options: &OptionsConfig) {
    let default = if options.debug_details {
        "tmiclient=debug"
    } else {
        "tmiclient=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Writes chat and action events to per-channel daily log files.
///
/// File handles are cached for the lifetime of the logger. A file that
/// cannot be opened is reported once and its lines are dropped.
pub struct ChatLogger {
    enabled: bool,
    log_dir: PathBuf,
    file_handles: HashMap<String, Option<fs::File>>,
}

impl ChatLogger {
    pub fn new(config: &LoggingConfig) -> Self {
        Self {
            enabled: config.enabled,
            log_dir: expand_home(&config.log_dir),
            file_handles: HashMap::new(),
        }
    }

    /// Record `event` if it is a chat line. Other events are ignored.
    pub fn log_event(&mut self, event: &Event) {
        if !self.enabled {
            return;
        }
        let timestamp = chrono::Local::now().format("%H:%M:%S");
        let (channel, line) = match event {
            Event::Chat { channel, user, text, .. } => {
                (channel, format!("[{}] <{}> {}", timestamp, display(user), text))
            }
            Event::Action { channel, user, text, .. } => {
                (channel, format!("[{}] * {} {}", timestamp, display(user), text))
            }
            Event::Timeout { channel, user } => {
                (channel, format!("[{}] *** {} was timed out", timestamp, user))
            }
            Event::ClearChat { channel } => {
                (channel, format!("[{}] *** Chat was cleared", timestamp))
            }
            _ => return,
        };
        self.write_line(channel, &line);
    }

    fn write_line(&mut self, channel: &str, line: &str) {
        let safe_target: String = channel
            .trim_start_matches('#')
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let date = chrono::Local::now().format("%Y-%m-%d");
        let filename = format!("{}_{}.log", safe_target, date);

        let log_dir = &self.log_dir;
        let handle = self.file_handles.entry(filename.clone()).or_insert_with(|| {
            let filepath = log_dir.join(&filename);
            let opened = fs::create_dir_all(log_dir).and_then(|_| {
                OpenOptions::new().create(true).append(true).open(&filepath)
            });
            match opened {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(path = %filepath.display(), error = %e, "Cannot open chat log");
                    None
                }
            }
        });
        if let Some(file) = handle {
            let _ = writeln!(file, "{}", line);
        }
    }
}

fn display(user: &crate::client::events::UserRecord) -> &str {
    user.display_name.as_deref().unwrap_or(&user.username)
}

fn expand_home(dir: &str) -> PathBuf {
    match dir.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(dir)),
        None => PathBuf::from(dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::events::UserRecord;

    #[test]
    fn chat_lines_land_in_per_channel_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            enabled: true,
            log_dir: dir.path().display().to_string(),
        };
        let mut logger = ChatLogger::new(&config);
        logger.log_event(&Event::Chat {
            channel: "#chan".into(),
            user: UserRecord::new("bob"),
            text: "hello".into(),
            is_self: false,
        });
        logger.log_event(&Event::Ping);

        let date = chrono::Local::now().format("%Y-%m-%d");
        let contents =
            fs::read_to_string(dir.path().join(format!("chan_{}.log", date))).unwrap();
        assert!(contents.ends_with("<bob> hello\n"));
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            enabled: false,
            log_dir: dir.path().display().to_string(),
        };
        let mut logger = ChatLogger::new(&config);
        logger.log_event(&Event::ClearChat { channel: "#chan".into() });
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn home_prefix_is_expanded() {
        assert!(!expand_home("~/logs").starts_with("~"));
        assert_eq!(expand_home("/var/log"), PathBuf::from("/var/log"));
    }
}
