/// Protocol line parsing.
///
/// A line has the shape
///   [`@`tags SPACE] [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
///
/// Parsing operates on the content without the `\r\n` terminator.
use std::collections::HashMap;

/// Source of a message: either a server hostname or a `nick!user@host` mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    pub raw: String,
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
    pub is_server: bool,
}

impl Prefix {
    pub fn parse(raw: &str) -> Self {
        let is_server = !raw.contains('!') && !raw.contains('@') && raw.contains('.');
        if is_server {
            return Prefix {
                raw: raw.to_owned(),
                nick: raw.to_owned(),
                user: None,
                host: None,
                is_server,
            };
        }

        let (before_host, host) = match raw.split_once('@') {
            Some((left, host)) => (left, Some(host.to_owned())),
            None => (raw, None),
        };
        let (nick, user) = match before_host.split_once('!') {
            Some((nick, user)) => (nick, Some(user.to_owned())),
            None => (before_host, None),
        };

        Prefix {
            raw: raw.to_owned(),
            nick: nick.to_owned(),
            user,
            host,
            is_server,
        }
    }

    /// True when the sender is the given identity, matched on the raw
    /// prefix or the nick part.
    pub fn is(&self, identity: &str) -> bool {
        self.raw == identity || self.nick == identity
    }
}

/// One decoded protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub tags: Option<HashMap<String, String>>,
    pub prefix: Option<Prefix>,
    /// The command (e.g. `PRIVMSG`, `376`, `PING`).
    pub command: String,
    /// Parameters; the last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,
    #[error("tag block is not followed by a command")]
    DanglingTags,
    #[error("prefix present but missing command")]
    MissingCommand,
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("line exceeds maximum length ({0} bytes)")]
    LineTooLong(usize),
}

impl ProtocolMessage {
    /// Parse a single line (without the trailing `\r\n`).
    pub fn parse(input: &str) -> Result<Self, DecodeError> {
        let input = input.trim_end_matches(['\r', '\n']);

        if input.is_empty() {
            return Err(DecodeError::Empty);
        }

        let (tags, rest) = match input.strip_prefix('@') {
            Some(tagged) => match tagged.split_once(' ') {
                Some((block, rest)) => (Some(parse_tags(block)), rest.trim_start_matches(' ')),
                None => return Err(DecodeError::DanglingTags),
            },
            None => (None, input),
        };

        let (prefix, rest) = match rest.strip_prefix(':') {
            Some(prefixed) => match prefixed.split_once(' ') {
                Some((raw, rest)) => (Some(Prefix::parse(raw)), rest.trim_start_matches(' ')),
                None => return Err(DecodeError::MissingCommand),
            },
            None => (None, rest),
        };

        let (command, param_str) = match rest.split_once(' ') {
            Some((command, params)) => (command, Some(params)),
            None => (rest, None),
        };

        if command.is_empty() {
            return Err(DecodeError::MissingCommand);
        }

        let mut params = Vec::new();
        if let Some(mut remaining) = param_str {
            while !remaining.is_empty() {
                if let Some(trailing) = remaining.strip_prefix(':') {
                    params.push(trailing.to_owned());
                    break;
                }
                match remaining.split_once(' ') {
                    Some((param, rest)) => {
                        if !param.is_empty() {
                            params.push(param.to_owned());
                        }
                        remaining = rest;
                    }
                    None => {
                        params.push(remaining.to_owned());
                        break;
                    }
                }
            }
        }

        Ok(ProtocolMessage {
            tags,
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.as_ref()?.get(key).map(String::as_str)
    }

    /// Nick of the sender, or the empty string for prefix-less lines.
    pub fn sender(&self) -> &str {
        self.prefix.as_ref().map(|p| p.nick.as_str()).unwrap_or("")
    }

    pub fn is_numeric(&self) -> bool {
        !self.command.is_empty() && self.command.bytes().all(|b| b.is_ascii_digit())
    }
}

fn parse_tags(block: &str) -> HashMap<String, String> {
    block
        .split(';')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_owned(), unescape_tag_value(value)),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_ping_without_prefix() {
        let msg = ProtocolMessage::parse("PING :tmi.twitch.tv").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["tmi.twitch.tv"]);
    }

    #[test]
    fn server_prefix_is_detected_by_dot() {
        let msg = ProtocolMessage::parse(":tmi.twitch.tv 376 bot :>").unwrap();
        let prefix = msg.prefix.unwrap();
        assert!(prefix.is_server);
        assert_eq!(prefix.nick, "tmi.twitch.tv");
        assert_eq!(msg.params, vec!["bot", ">"]);
    }

    #[test]
    fn bare_identity_prefix_is_not_a_server() {
        let msg = ProtocolMessage::parse(":jtv PRIVMSG #chan :USERCOLOR bob #FF0000").unwrap();
        let prefix = msg.prefix.unwrap();
        assert!(!prefix.is_server);
        assert!(prefix.is("jtv"));
        assert_eq!(prefix.user, None);
    }

    #[test]
    fn hostmask_prefix_is_split() {
        let msg =
            ProtocolMessage::parse(":bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :hello there world")
                .unwrap();
        let prefix = msg.prefix.clone().unwrap();
        assert!(!prefix.is_server);
        assert_eq!(prefix.nick, "bob");
        assert_eq!(prefix.user.as_deref(), Some("bob"));
        assert_eq!(prefix.host.as_deref(), Some("bob.tmi.twitch.tv"));
        assert_eq!(msg.params, vec!["#chan", "hello there world"]);
        assert_eq!(msg.sender(), "bob");
    }

    #[test]
    fn tags_are_parsed_and_unescaped() {
        let msg = ProtocolMessage::parse(
            "@color=#0D4200;display-name=Bob\\sB;emotes=25:0-4;subscriber=1;turbo= :bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :Kappa",
        )
        .unwrap();
        assert_eq!(msg.tag("color"), Some("#0D4200"));
        assert_eq!(msg.tag("display-name"), Some("Bob B"));
        assert_eq!(msg.tag("emotes"), Some("25:0-4"));
        assert_eq!(msg.tag("turbo"), Some(""));
        assert_eq!(msg.tag("missing"), None);
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn trailing_keeps_inner_colons_and_spaces() {
        let msg = ProtocolMessage::parse(
            ":jtv PRIVMSG #chan :The moderators of this room are: a, b, c",
        )
        .unwrap();
        assert_eq!(msg.param(1), Some("The moderators of this room are: a, b, c"));
    }

    #[test]
    fn numeric_detection() {
        assert!(ProtocolMessage::parse(":tmi.twitch.tv 372 bot :hi").unwrap().is_numeric());
        assert!(!ProtocolMessage::parse("PING").unwrap().is_numeric());
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert_eq!(ProtocolMessage::parse(""), Err(DecodeError::Empty));
        assert_eq!(ProtocolMessage::parse(":onlyprefix"), Err(DecodeError::MissingCommand));
        assert_eq!(ProtocolMessage::parse("@a=b"), Err(DecodeError::DanglingTags));
    }
}
