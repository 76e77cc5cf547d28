//! Error taxonomy shared by the protocol layer and the client.

use std::io;

use crate::irc::message::DecodeError;

/// Everything that can go wrong while talking to the chat servers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// OS-level connection failure, already mapped to a readable string.
    #[error("{0}")]
    Transport(String),
    /// A line from the server could not be parsed. Fatal to that stream.
    #[error("malformed line from server: {0}")]
    Decode(#[from] DecodeError),
    /// The server refused the credentials.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),
    /// A moderation command was refused by the server.
    #[error("command rejected: {0}")]
    CommandRejected(String),
    /// A control-identity line with a shape we do not know.
    #[error("unrecognized control payload: {0}")]
    UnrecognizedControlPayload(String),
    #[error("not connected")]
    NotConnected,
    #[error("channel {0} is not joined")]
    NotJoined(String),
    #[error("client is no longer running")]
    ClientStopped,
    #[error("internal fault: {0}")]
    Crashed(String),
}

impl ClientError {
    /// Maps an I/O error onto the transport variant with a stable message.
    pub fn from_io(err: &io::Error) -> Self {
        ClientError::Transport(describe_io_error(err))
    }

    /// True for failures the connection manager retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Decode(_))
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::from_io(&err)
    }
}

/// Human string for an I/O error, keyed by kind rather than by the
/// platform-specific message.
pub fn describe_io_error(err: &io::Error) -> String {
    let text = match err.kind() {
        io::ErrorKind::ConnectionReset => "Connection reset by peer.",
        io::ErrorKind::ConnectionRefused => "Connection refused.",
        io::ErrorKind::ConnectionAborted => "Connection aborted.",
        io::ErrorKind::NotConnected => "Socket is not connected.",
        io::ErrorKind::AddrInUse => "Address already in use.",
        io::ErrorKind::AddrNotAvailable => "Address not available.",
        io::ErrorKind::BrokenPipe => "Broken pipe.",
        io::ErrorKind::TimedOut => "Connection timed out.",
        io::ErrorKind::UnexpectedEof => "Connection closed by server.",
        io::ErrorKind::InvalidData => "Received invalid data.",
        _ => return format!("Unable to connect: {}", err),
    };
    text.to_string()
}
