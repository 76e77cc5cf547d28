use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::app::correlator::CommandOutcome;
use crate::error::ClientError;
use crate::irc::commands::Directive;
use crate::irc::message::ProtocolMessage;
use crate::irc::resolver::Endpoint;

pub type TransportId = u64;
pub type Reply = oneshot::Sender<CommandOutcome>;

/// Why an endpoint is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkPurpose {
    Primary,
    /// Replacement transport for a server-requested reconnect.
    Swap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    Reconnect,
    JoinNext { generation: u64 },
    GraceExpired { transport: TransportId },
    AckWindow { ticket: u64 },
}

/// Requests from a [`crate::client::ClientHandle`].
#[derive(Debug)]
pub enum ClientCommand {
    Connect,
    Disconnect { done: Reply },
    Say { channel: String, text: String, done: Reply },
    Action { channel: String, text: String, done: Reply },
    Join { channel: String, done: Reply },
    Part { channel: String, done: Reply },
    Ping { done: Reply },
    Raw { line: String, done: Reply },
    Moderate { channel: String, directive: Directive, done: Reply },
    Mods { channel: String, reply: oneshot::Sender<Vec<String>> },
    IsMod { channel: String, user: String, reply: oneshot::Sender<bool> },
    Channels { reply: oneshot::Sender<Vec<String>> },
}

/// Everything the dispatcher reacts to.
#[derive(Debug)]
pub enum AppEvent {
    /// A decoded line from a transport.
    Message {
        transport: TransportId,
        message: ProtocolMessage,
    },
    TransportReady {
        transport: TransportId,
        endpoint: Endpoint,
        peer: SocketAddr,
    },
    TransportFailed {
        transport: TransportId,
        error: ClientError,
    },
    Resolved {
        purpose: LinkPurpose,
        endpoint: Option<Endpoint>,
    },
    Command(ClientCommand),
    Timer(Timer),
    /// Periodic keepalive check.
    WatchdogTick,
}
