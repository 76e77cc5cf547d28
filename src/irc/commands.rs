//! Outbound line builders and chat-command parsing.
//!
//! Builders produce the exact wire text (without `\r\n`) for registration,
//! membership and messaging. Moderation is expressed as [`Directive`]s that
//! travel as dot-prefixed chat messages. [`parse_bang_command`] splits
//! prefixed chat lines like `!so bob` into a command and its arguments.

use crate::client::events::BangCommand;

/// Capabilities requested on every welcome.
pub const BASE_CAPABILITIES: &str = "twitch.tv/tags twitch.tv/commands";
pub const MEMBERSHIP_CAPABILITY: &str = "twitch.tv/membership";

/// Legal commercial lengths in seconds.
pub const COMMERCIAL_LENGTHS: [u32; 6] = [30, 60, 90, 120, 150, 180];
pub const DEFAULT_TIMEOUT_SECS: u32 = 300;
pub const DEFAULT_SLOW_SECS: u32 = 300;

/// Lowercase a channel name and drop any leading `#`.
pub fn normalize_channel(channel: &str) -> String {
    channel.trim().trim_start_matches('#').to_lowercase()
}

/// `#name` form of a channel for the wire and for events.
pub fn wire_channel(channel: &str) -> String {
    format!("#{}", normalize_channel(channel))
}

pub fn pass(password: &str) -> String {
    format!("PASS {}", password)
}

pub fn nick(nickname: &str) -> String {
    format!("NICK {}", nickname)
}

pub fn user(nickname: &str) -> String {
    format!("USER {} 8 * :{}", nickname, nickname)
}

pub fn join(channel: &str) -> String {
    format!("JOIN {}", wire_channel(channel))
}

pub fn part(channel: &str) -> String {
    format!("PART {}", wire_channel(channel))
}

pub fn privmsg(channel: &str, text: &str) -> String {
    // No line breaks may leak into the payload.
    let clean: String = text.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    format!("PRIVMSG {} :{}", wire_channel(channel), clean)
}

pub fn action(channel: &str, text: &str) -> String {
    let clean = text.replace('\x01', "");
    privmsg(channel, &format!("\x01ACTION {}\x01", clean))
}

pub fn ping() -> String {
    "PING".to_string()
}

pub fn pong(payload: Option<&str>) -> String {
    match payload {
        Some(payload) => format!("PONG :{}", payload),
        None => "PONG".to_string(),
    }
}

pub fn cap_request(capabilities: &str) -> String {
    format!("CAP REQ :{}", capabilities)
}

pub fn legacy_level(level: u8) -> String {
    format!("TWITCHCLIENT {}", level)
}

/// Round a requested commercial length onto the legal set. Unknown
/// values fall back to 30 seconds.
pub fn clamp_commercial(seconds: Option<u32>) -> u32 {
    match seconds {
        Some(s) if COMMERCIAL_LENGTHS.contains(&s) => s,
        _ => COMMERCIAL_LENGTHS[0],
    }
}

/// A moderation or channel-management command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Ban { user: String },
    Unban { user: String },
    Timeout { user: String, seconds: u32 },
    Mod { user: String },
    Unmod { user: String },
    Slow { seconds: u32 },
    SlowOff,
    Subscribers,
    SubscribersOff,
    R9kBeta,
    R9kBetaOff,
    Clear,
    Color { color: String },
    Host { target: String },
    Unhost,
    Commercial { seconds: u32 },
    Mods,
}

impl Directive {
    /// Chat text carrying the directive, e.g. `.timeout bob 300`.
    pub fn text(&self) -> String {
        match self {
            Directive::Ban { user } => format!(".ban {}", user),
            Directive::Unban { user } => format!(".unban {}", user),
            Directive::Timeout { user, seconds } => format!(".timeout {} {}", user, seconds),
            Directive::Mod { user } => format!(".mod {}", user),
            Directive::Unmod { user } => format!(".unmod {}", user),
            Directive::Slow { seconds } => format!(".slow {}", seconds),
            Directive::SlowOff => ".slowoff".to_string(),
            Directive::Subscribers => ".subscribers".to_string(),
            Directive::SubscribersOff => ".subscribersoff".to_string(),
            Directive::R9kBeta => ".r9kbeta".to_string(),
            Directive::R9kBetaOff => ".r9kbetaoff".to_string(),
            Directive::Clear => ".clear".to_string(),
            Directive::Color { color } => format!(".color {}", color),
            Directive::Host { target } => format!(".host {}", normalize_channel(target)),
            Directive::Unhost => ".unhost".to_string(),
            Directive::Commercial { seconds } => format!(".commercial {}", seconds),
            Directive::Mods => ".mods".to_string(),
        }
    }

    pub fn line(&self, channel: &str) -> String {
        privmsg(channel, &self.text())
    }
}

/// Split a chat line that starts with `prefix` into a command and its
/// whitespace-separated arguments. Returns `None` for ordinary chat and for
/// a bare prefix with no command word.
pub fn parse_bang_command(prefix: char, text: &str) -> Option<BangCommand> {
    let body = text.strip_prefix(prefix)?;
    let mut words = body.split_whitespace();
    let command = words.next()?.to_string();
    if body.starts_with(char::is_whitespace) {
        return None;
    }
    Some(BangCommand {
        command,
        args: words.map(str::to_string).collect(),
        raw: text.to_string(),
    })
}

/// Strip a CTCP ACTION wrapper, tolerating a leading space before the
/// marker. Returns the inner text for actions, `None` for plain chat.
pub fn strip_action(text: &str) -> Option<&str> {
    let body = text.strip_prefix(' ').unwrap_or(text);
    let inner = body.strip_prefix("\x01ACTION")?;
    let inner = inner.strip_prefix(' ').unwrap_or(inner);
    Some(inner.strip_suffix('\x01').unwrap_or(inner))
}
