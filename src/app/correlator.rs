//! Correlates moderation commands with rejection notices.
//!
//! The server never echoes which command a rejection belongs to. A rejection
//! notice is held in a single slot for a short window; each command checks
//! the slot once the window after sending has elapsed and resolves its own
//! completion. Two commands issued within one window cannot be told apart
//! and both observe the same slot.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ClientError;

pub const ACK_WINDOW: Duration = Duration::from_millis(250);

/// How a request ended from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Written to the transport; no acknowledgement is expected.
    Sent,
    /// No rejection arrived within the window.
    Accepted,
    Rejected(String),
    NotSent(ClientError),
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandOutcome::Sent | CommandOutcome::Accepted)
    }
}

#[derive(Debug)]
struct HeldRejection {
    text: String,
    expires: Instant,
}

#[derive(Debug, Default)]
pub struct CommandCorrelator {
    slot: Option<HeldRejection>,
    waiters: HashMap<u64, oneshot::Sender<CommandOutcome>>,
    next_ticket: u64,
}

impl CommandCorrelator {
    /// Park a completion until its window elapses. Returns the ticket the
    /// window timer carries.
    pub fn register(&mut self, done: oneshot::Sender<CommandOutcome>) -> u64 {
        self.next_ticket += 1;
        self.waiters.insert(self.next_ticket, done);
        self.next_ticket
    }

    /// Fill the slot. A newer rejection replaces an older one.
    pub fn hold_rejection(&mut self, text: &str, now: Instant) {
        self.slot = Some(HeldRejection {
            text: text.to_string(),
            expires: now + ACK_WINDOW,
        });
    }

    /// Resolve the completion for `ticket` from the slot's current contents.
    pub fn settle(&mut self, ticket: u64, now: Instant) {
        let Some(done) = self.waiters.remove(&ticket) else {
            return;
        };
        let outcome = match &self.slot {
            Some(held) if held.expires >= now => CommandOutcome::Rejected(held.text.clone()),
            _ => CommandOutcome::Accepted,
        };
        debug!(ticket, ?outcome, "command settled");
        let _ = done.send(outcome);
    }

    /// Fail every outstanding completion, e.g. when the transport is lost.
    pub fn fail_all(&mut self, error: ClientError) {
        for (_, done) in self.waiters.drain() {
            let _ = done.send(CommandOutcome::NotSent(error.clone()));
        }
        self.slot = None;
    }

    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}
