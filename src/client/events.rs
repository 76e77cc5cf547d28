//! Typed domain events and the observer registry.
//!
//! Consumers register callbacks per [`EventKind`]; every emitted [`Event`]
//! carries its own payload, so there is no name-based dispatch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Attributes of a chat user as seen on one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub display_name: Option<String>,
    pub color: Option<String>,
    /// Role and badge names: `mod`, `subscriber`, `turbo`, `broadcaster`, ...
    pub roles: BTreeSet<String>,
    /// Emote id -> character ranges, tag dialect only.
    pub emotes: BTreeMap<String, Vec<String>>,
    /// Emote set ids, legacy dialect only.
    pub emote_sets: Vec<String>,
}

impl UserRecord {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// A chat line starting with the configured prefix character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BangCommand {
    pub command: String,
    pub args: Vec<String>,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlErrorCode {
    CannotHost,
    UnauthorizedJoin,
    NoPermission,
    OwnerOnly,
}

/// A limitation or permission error reported by the control identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlError {
    pub message: String,
    pub code: ControlErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Transport(String),
    LoginFailed(String),
    PingTimeout,
    Manual,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Transport(reason) => f.write_str(reason),
            DisconnectReason::LoginFailed(reason) => write!(f, "{}", reason),
            DisconnectReason::PingTimeout => f.write_str("Ping timeout."),
            DisconnectReason::Manual => f.write_str("Connection closed."),
        }
    }
}

/// Everything the client reports to its observers.
///
/// Channels are reported in wire form (`#name`, lowercase).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Ping,
    Pong { latency: f64 },
    Connecting { host: String, port: u16 },
    Connected { host: String, port: u16 },
    Disconnected { reason: DisconnectReason },
    Reconnect,
    ConnectFail,
    Logon,
    Join { channel: String, user: String },
    Part { channel: String, user: String },
    Names { channel: String, names: Vec<String> },
    Mod { channel: String, user: String },
    Unmod { channel: String, user: String },
    Timeout { channel: String, user: String },
    ClearChat { channel: String },
    Subscriber { channel: String, enabled: bool },
    SlowMode { channel: String, enabled: bool, seconds: Option<u32> },
    R9kBeta { channel: String, enabled: bool },
    Hosted { channel: String, by: String, viewers: Option<u32> },
    Hosting { channel: String, target: String, remaining: Option<u32> },
    Unhost { channel: String, remaining: Option<u32> },
    Mods { channel: String, mods: Vec<String> },
    Limitation(ControlError),
    Permission(ControlError),
    Jtv { channel: String, text: String },
    SpecialUser { user: String, value: String },
    UserColor { user: String, color: String },
    EmoteSet { user: String, sets: Vec<String> },
    RoomBan { channel: String, user: String },
    RoomChanged { channel: String },
    RoomDeleted { channel: String },
    RoomInvite { channel: String, by: String },
    HistoryEnd { channel: String },
    Chat { channel: String, user: UserRecord, text: String, is_self: bool },
    Action { channel: String, user: UserRecord, text: String, is_self: bool },
    TwitchNotify { channel: String, text: String },
    Subscription { channel: String, user: String },
    SubAnniversary { channel: String, user: String, months: Option<u32> },
    Command { channel: String, user: UserRecord, command: BangCommand },
    Crash { message: String, stack: String },
}

/// The closed set of event kinds observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Ping,
    Pong,
    Connecting,
    Connected,
    Disconnected,
    Reconnect,
    ConnectFail,
    Logon,
    Join,
    Part,
    Names,
    Mod,
    Unmod,
    Timeout,
    ClearChat,
    Subscriber,
    SlowMode,
    R9kBeta,
    Hosted,
    Hosting,
    Unhost,
    Mods,
    Limitation,
    Permission,
    Jtv,
    SpecialUser,
    UserColor,
    EmoteSet,
    RoomBan,
    RoomChanged,
    RoomDeleted,
    RoomInvite,
    HistoryEnd,
    Chat,
    Action,
    TwitchNotify,
    Subscription,
    SubAnniversary,
    Command,
    Crash,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Ping => EventKind::Ping,
            Event::Pong { .. } => EventKind::Pong,
            Event::Connecting { .. } => EventKind::Connecting,
            Event::Connected { .. } => EventKind::Connected,
            Event::Disconnected { .. } => EventKind::Disconnected,
            Event::Reconnect => EventKind::Reconnect,
            Event::ConnectFail => EventKind::ConnectFail,
            Event::Logon => EventKind::Logon,
            Event::Join { .. } => EventKind::Join,
            Event::Part { .. } => EventKind::Part,
            Event::Names { .. } => EventKind::Names,
            Event::Mod { .. } => EventKind::Mod,
            Event::Unmod { .. } => EventKind::Unmod,
            Event::Timeout { .. } => EventKind::Timeout,
            Event::ClearChat { .. } => EventKind::ClearChat,
            Event::Subscriber { .. } => EventKind::Subscriber,
            Event::SlowMode { .. } => EventKind::SlowMode,
            Event::R9kBeta { .. } => EventKind::R9kBeta,
            Event::Hosted { .. } => EventKind::Hosted,
            Event::Hosting { .. } => EventKind::Hosting,
            Event::Unhost { .. } => EventKind::Unhost,
            Event::Mods { .. } => EventKind::Mods,
            Event::Limitation(_) => EventKind::Limitation,
            Event::Permission(_) => EventKind::Permission,
            Event::Jtv { .. } => EventKind::Jtv,
            Event::SpecialUser { .. } => EventKind::SpecialUser,
            Event::UserColor { .. } => EventKind::UserColor,
            Event::EmoteSet { .. } => EventKind::EmoteSet,
            Event::RoomBan { .. } => EventKind::RoomBan,
            Event::RoomChanged { .. } => EventKind::RoomChanged,
            Event::RoomDeleted { .. } => EventKind::RoomDeleted,
            Event::RoomInvite { .. } => EventKind::RoomInvite,
            Event::HistoryEnd { .. } => EventKind::HistoryEnd,
            Event::Chat { .. } => EventKind::Chat,
            Event::Action { .. } => EventKind::Action,
            Event::TwitchNotify { .. } => EventKind::TwitchNotify,
            Event::Subscription { .. } => EventKind::Subscription,
            Event::SubAnniversary { .. } => EventKind::SubAnniversary,
            Event::Command { .. } => EventKind::Command,
            Event::Crash { .. } => EventKind::Crash,
        }
    }
}

pub type Observer = Box<dyn FnMut(&Event) + Send>;

/// Callbacks keyed by event kind, plus catch-all observers.
#[derive(Default)]
pub struct Observers {
    by_kind: HashMap<EventKind, Vec<Observer>>,
    any: Vec<Observer>,
}

impl Observers {
    pub fn on(&mut self, kind: EventKind, observer: impl FnMut(&Event) + Send + 'static) {
        self.by_kind.entry(kind).or_default().push(Box::new(observer));
    }

    pub fn on_any(&mut self, observer: impl FnMut(&Event) + Send + 'static) {
        self.any.push(Box::new(observer));
    }

    /// True if at least one kind-specific observer is registered for `kind`.
    pub fn has(&self, kind: EventKind) -> bool {
        self.by_kind.get(&kind).is_some_and(|list| !list.is_empty())
    }

    /// True if events of `kind` reach any observer, catch-alls included.
    pub fn receives(&self, kind: EventKind) -> bool {
        !self.any.is_empty() || self.has(kind)
    }

    pub fn dispatch(&mut self, event: &Event) {
        if let Some(list) = self.by_kind.get_mut(&event.kind()) {
            for observer in list.iter_mut() {
                observer(event);
            }
        }
        for observer in self.any.iter_mut() {
            observer(event);
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .field("any", &self.any.len())
            .finish()
    }
}
