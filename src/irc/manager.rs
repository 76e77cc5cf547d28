//! Connection lifecycle: the reconnect state machine and the set of open
//! transports.
//!
//! [`Link`] is pure bookkeeping (phase, attempt counter, retry budget) and is
//! driven by the dispatcher. [`TransportManager`] owns the sockets and is
//! driven by the client loop.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::event::{AppEvent, TransportId};
use crate::error::ClientError;
use crate::irc::connection::{open_transport, Transport};
use crate::irc::resolver::Endpoint;

pub const BACKOFF_STEP: Duration = Duration::from_millis(5000);
pub const BACKOFF_CAP: Duration = Duration::from_millis(90_000);
/// How long a retiring transport may keep delivering during a swap.
pub const GRACE_WINDOW: Duration = Duration::from_secs(25);

/// Delay before reconnect attempt `attempt` (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_STEP.saturating_mul(attempt.max(1)).min(BACKOFF_CAP)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    GracefulSwap,
}

/// What to do after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    After(Duration),
    /// The retry budget is spent.
    Exhausted,
    /// Reconnection is switched off.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Link {
    phase: Phase,
    attempt: u32,
    reconnect: bool,
    budget: Option<u32>,
    retries_left: Option<u32>,
}

impl Link {
    pub fn new(reconnect: bool, budget: Option<u32>) -> Self {
        Self {
            phase: Phase::Disconnected,
            attempt: 1,
            reconnect,
            budget,
            retries_left: budget,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected | Phase::GracefulSwap)
    }

    pub fn begin_connect(&mut self) {
        self.phase = Phase::Connecting;
    }

    /// The server welcomed us: the attempt counter and budget start over.
    pub fn welcomed(&mut self) {
        self.phase = Phase::Connected;
        self.attempt = 1;
        self.retries_left = self.budget;
    }

    pub fn begin_swap(&mut self) {
        self.phase = Phase::GracefulSwap;
    }

    /// A swap was abandoned before the replacement came up.
    pub fn abort_swap(&mut self) {
        if self.phase == Phase::GracefulSwap {
            self.phase = Phase::Connected;
        }
    }

    pub fn stop(&mut self) {
        self.phase = Phase::Disconnected;
    }

    /// Reconnect on our own initiative (keepalive lost) without consuming
    /// an attempt.
    pub fn begin_reconnect(&mut self) {
        self.phase = Phase::Reconnecting;
    }

    /// Record a transport failure and decide whether to retry. Every
    /// failure consumes one attempt, so repeated failures back off
    /// linearly until the cap.
    pub fn failed(&mut self) -> Retry {
        if !self.reconnect {
            self.phase = Phase::Disconnected;
            return Retry::Disabled;
        }
        if self.retries_left == Some(0) {
            self.phase = Phase::Disconnected;
            return Retry::Exhausted;
        }
        let delay = backoff_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if let Some(left) = self.retries_left.as_mut() {
            *left -= 1;
        }
        self.phase = Phase::Reconnecting;
        Retry::After(delay)
    }
}

pub type OpenResult = (TransportId, Endpoint, Result<Transport, ClientError>);

/// Open transports by id. Connects run in the background and report back
/// through [`TransportManager::next_opened`].
pub struct TransportManager {
    transports: HashMap<TransportId, Transport>,
    event_tx: mpsc::UnboundedSender<AppEvent>,
    opened_tx: mpsc::UnboundedSender<OpenResult>,
    opened_rx: mpsc::UnboundedReceiver<OpenResult>,
}

impl TransportManager {
    pub fn new(event_tx: mpsc::UnboundedSender<AppEvent>) -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            transports: HashMap::new(),
            event_tx,
            opened_tx,
            opened_rx,
        }
    }

    pub fn open(&self, id: TransportId, endpoint: Endpoint) {
        info!(transport = id, %endpoint, "Connecting");
        let event_tx = self.event_tx.clone();
        let opened_tx = self.opened_tx.clone();
        tokio::spawn(async move {
            let result = open_transport(id, endpoint.clone(), event_tx).await;
            let _ = opened_tx.send((id, endpoint, result));
        });
    }

    pub async fn next_opened(&mut self) -> Option<OpenResult> {
        self.opened_rx.recv().await
    }

    pub fn adopt(&mut self, transport: Transport) {
        self.transports.insert(transport.id, transport);
    }

    pub fn send(&self, id: TransportId, line: String) {
        match self.transports.get(&id) {
            Some(transport) => {
                if let Err(e) = transport.send(line) {
                    warn!(transport = id, error = %e, "Could not queue line");
                }
            }
            None => debug!(transport = id, "Dropping line for closed transport"),
        }
    }

    pub fn close(&mut self, id: TransportId) {
        if self.transports.remove(&id).is_some() {
            debug!(transport = id, "Transport closed");
        }
    }

    pub fn close_all(&mut self) {
        self.transports.clear();
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}
