//! Compatibility shim for the legacy control sub-protocol.
//!
//! Before message tags existed, the server delivered channel state as chat
//! lines from synthetic senders. `jtv` sends either a keyword line
//! (`USERCOLOR bob #FF0000`) or an English sentence; `twitchnotify` announces
//! subscriptions. Nothing here is documented by the server, so sentences are
//! matched against a fixed table of literal fragments.

use crate::client::events::{ControlError, ControlErrorCode};

pub const CONTROL_IDENTITY: &str = "jtv";
pub const NOTIFY_IDENTITY: &str = "twitchnotify";

/// Leading keyword of a structured control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    SpecialUser,
    UserColor,
    EmoteSet,
    ClearChat,
    RoomBan,
    RoomChanged,
    RoomDeleted,
    RoomInvite,
    HostTarget,
    HistoryEnd,
}

impl Keyword {
    fn parse(word: &str) -> Option<Self> {
        Some(match word {
            "SPECIALUSER" => Keyword::SpecialUser,
            "USERCOLOR" => Keyword::UserColor,
            "EMOTESET" => Keyword::EmoteSet,
            "CLEARCHAT" => Keyword::ClearChat,
            "ROOMBAN" => Keyword::RoomBan,
            "ROOMCHANGED" => Keyword::RoomChanged,
            "ROOMDELETED" => Keyword::RoomDeleted,
            "ROOMINVITE" => Keyword::RoomInvite,
            "HOSTTARGET" => Keyword::HostTarget,
            "HISTORYEND" => Keyword::HistoryEnd,
            _ => return None,
        })
    }
}

/// A free-text control sentence after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Subscribers(bool),
    /// `Some(seconds)` when slow mode was switched on.
    Slow(Option<u32>),
    R9k(bool),
    Hosted { by: String, viewers: Option<u32> },
    Mods(Vec<String>),
    Limitation(ControlError),
    Permission(ControlError),
    /// Refusal of a command with no dedicated event.
    Rejected(String),
}

impl Notice {
    /// Text to hold for command correlation, if this sentence refuses a command.
    pub fn rejection(&self) -> Option<&str> {
        match self {
            Notice::Limitation(err) | Notice::Permission(err) => Some(&err.message),
            Notice::Rejected(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Keyword { keyword: Keyword, args: Vec<String> },
    Notice(Notice),
    Unrecognized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    Exact,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    SubscribersOn,
    SubscribersOff,
    SlowOn,
    SlowOff,
    R9kOn,
    R9kOff,
    Hosted,
    Mods,
    Limitation(ControlErrorCode),
    Permission(ControlErrorCode),
    Rejected,
}

/// Checked in order; the first hit wins.
const NOTICE_TABLE: &[(Match, &str, Rule)] = &[
    (Match::Exact, "This room is now in subscribers-only mode.", Rule::SubscribersOn),
    (Match::Exact, "This room is no longer in subscribers-only mode.", Rule::SubscribersOff),
    (Match::Contains, "This room is now in slow mode.", Rule::SlowOn),
    (Match::Exact, "This room is no longer in slow mode.", Rule::SlowOff),
    (Match::Contains, "This room is now in r9k mode.", Rule::R9kOn),
    (Match::Exact, "This room is no longer in r9k mode.", Rule::R9kOff),
    (Match::Contains, "is now hosting you for", Rule::Hosted),
    (Match::Contains, "The moderators of this room are:", Rule::Mods),
    (
        Match::Exact,
        "Host target cannot be changed more than three times per 30 minutes.",
        Rule::Limitation(ControlErrorCode::CannotHost),
    ),
    (Match::Exact, "UNAUTHORIZED JOIN", Rule::Limitation(ControlErrorCode::UnauthorizedJoin)),
    (
        Match::Exact,
        "You don't have permission to do this.",
        Rule::Permission(ControlErrorCode::NoPermission),
    ),
    (
        Match::Exact,
        "You don't have permission to timeout people in this room.",
        Rule::Permission(ControlErrorCode::NoPermission),
    ),
    (
        Match::Contains,
        "Only the owner of this channel can use",
        Rule::Permission(ControlErrorCode::OwnerOnly),
    ),
    (Match::Contains, "Unrecognized command:", Rule::Rejected),
    (Match::Contains, "You cannot ban", Rule::Rejected),
    (Match::Contains, "You cannot timeout", Rule::Rejected),
];

/// Classify a `jtv` message body.
pub fn classify_control(text: &str) -> ControlLine {
    let mut words = text.split_whitespace();
    if let Some(keyword) = words.next().and_then(Keyword::parse) {
        return ControlLine::Keyword {
            keyword,
            args: words.map(str::to_string).collect(),
        };
    }

    NOTICE_TABLE
        .iter()
        .find(|(how, needle, _)| match how {
            Match::Exact => text == *needle,
            Match::Contains => text.contains(needle),
        })
        .map(|(_, _, rule)| ControlLine::Notice(build_notice(*rule, text)))
        .unwrap_or(ControlLine::Unrecognized)
}

/// Word `back` positions from the end, counting the last word as 1.
fn word_from_end<'a>(words: &[&'a str], back: usize) -> Option<&'a str> {
    words.len().checked_sub(back).map(|i| words[i])
}

fn build_notice(rule: Rule, text: &str) -> Notice {
    let words: Vec<&str> = text.split(' ').collect();
    match rule {
        Rule::SubscribersOn => Notice::Subscribers(true),
        Rule::SubscribersOff => Notice::Subscribers(false),
        Rule::SlowOn => Notice::Slow(Some(
            word_from_end(&words, 2).and_then(|w| w.parse().ok()).unwrap_or(0),
        )),
        Rule::SlowOff => Notice::Slow(None),
        Rule::R9kOn => Notice::R9k(true),
        Rule::R9kOff => Notice::R9k(false),
        Rule::Hosted => Notice::Hosted {
            by: words.first().map(|w| w.to_lowercase()).unwrap_or_default(),
            viewers: word_from_end(&words, 2).and_then(|w| w.parse().ok()),
        },
        Rule::Mods => Notice::Mods(parse_mod_list(text)),
        Rule::Limitation(code) => Notice::Limitation(ControlError {
            message: text.to_string(),
            code,
        }),
        Rule::Permission(code) => Notice::Permission(ControlError {
            message: text.to_string(),
            code,
        }),
        Rule::Rejected => Notice::Rejected(text.to_string()),
    }
}

/// `The moderators of this room are: A, b, c` -> `[a, b, c]`.
fn parse_mod_list(text: &str) -> Vec<String> {
    let Some((_, list)) = text.split_once(':') else {
        return Vec::new();
    };
    list.replace(',', "")
        .split(' ')
        .filter(|name| !name.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Subscription announcements from `twitchnotify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Subscription { user: String },
    SubAnniversary { user: String, months: Option<u32> },
    Other,
}

pub fn classify_notification(text: &str) -> Notification {
    let words: Vec<&str> = text.split(' ').collect();
    let user = words.first().map(|w| w.to_lowercase()).unwrap_or_default();
    if text.contains("subscribed to") {
        Notification::Other
    } else if text.contains("just subscribed") {
        Notification::Subscription { user }
    } else if text.contains("subscribed") && text.contains("in a row") {
        Notification::SubAnniversary {
            user,
            months: word_from_end(&words, 5).and_then(|w| w.parse().ok()),
        }
    } else {
        Notification::Other
    }
}

/// `[23,568,4458]` -> `["23", "568", "4458"]`.
pub fn parse_emote_sets(value: &str) -> Vec<String> {
    value
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}
