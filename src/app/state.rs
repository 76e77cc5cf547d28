use std::collections::{BTreeSet, HashMap};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::app::action::Action;
use crate::app::correlator::CommandCorrelator;
use crate::app::event::{LinkPurpose, TransportId};
use crate::app::joins::JoinScheduler;
use crate::client::events::{Event, UserRecord};
use crate::config::model::Credentials;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::irc::manager::Link;
use crate::irc::resolver::Endpoint;

/// All connection and channel state of one client. Mutated only by the
/// dispatcher, one event at a time.
pub struct Session {
    pub config: ClientConfig,
    pub credentials: Credentials,
    pub link: Link,

    /// Transport feeding the dispatcher.
    pub live: Option<TransportId>,
    /// Previous transport during a graceful swap, on the shadow path.
    pub retiring: Option<TransportId>,
    /// Transport being opened and why.
    pub opening: Option<(TransportId, LinkPurpose)>,
    pub endpoint: Option<Endpoint>,
    /// Transport that has already seen the welcome numeric.
    pub welcomed: Option<TransportId>,
    pub has_connected: bool,

    /// Joined channels, normalized (lowercase, no `#`), in join order.
    pub joined: Vec<String>,
    /// Channels to restore on the next welcome after a lost transport.
    pub rejoin: Vec<String>,
    /// Moderators per joined channel.
    pub moderators: HashMap<String, BTreeSet<String>>,
    /// Legacy attribute records waiting for the user's next chat line.
    pub pending_records: HashMap<String, UserRecord>,
    /// Our own record per channel, from USERSTATE.
    pub self_records: HashMap<String, UserRecord>,
    pub tags_enabled: bool,
    pub username: String,
    pub graceful: bool,
    pub wants_membership: bool,

    pub last_ping_sent: Option<Instant>,
    pub last_server_ping: Instant,

    pub joins: JoinScheduler,
    pub correlator: CommandCorrelator,
    pub mods_waiters: HashMap<String, Vec<oneshot::Sender<Vec<String>>>>,

    /// Why the session ended, once it has.
    pub terminal: Option<ClientError>,
    pub pending_actions: Vec<Action>,
    next_transport: TransportId,
}

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        let credentials = config.identity.credentials();
        let link = Link::new(config.connection.reconnect, config.connection.retry_budget);
        Self {
            username: credentials.nickname.clone(),
            credentials,
            link,
            live: None,
            retiring: None,
            opening: None,
            endpoint: None,
            welcomed: None,
            has_connected: false,
            joined: Vec::new(),
            rejoin: Vec::new(),
            moderators: HashMap::new(),
            pending_records: HashMap::new(),
            self_records: HashMap::new(),
            tags_enabled: false,
            graceful: false,
            wants_membership: false,
            last_ping_sent: None,
            last_server_ping: Instant::now(),
            joins: JoinScheduler::default(),
            correlator: CommandCorrelator::default(),
            mods_waiters: HashMap::new(),
            terminal: None,
            pending_actions: Vec::new(),
            next_transport: 0,
            config,
        }
    }

    pub fn allocate_transport(&mut self) -> TransportId {
        self.next_transport += 1;
        self.next_transport
    }

    pub fn emit(&mut self, event: Event) {
        self.pending_actions.push(Action::Emit(event));
    }

    pub fn send(&mut self, transport: TransportId, line: String) {
        self.pending_actions.push(Action::Send { transport, line });
    }

    /// Send on the live transport, if any.
    pub fn send_live(&mut self, line: String) -> bool {
        match self.live {
            Some(transport) => {
                self.send(transport, line);
                true
            }
            None => false,
        }
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.joined.iter().any(|c| c == channel)
    }

    pub fn is_self(&self, user: &str) -> bool {
        user.eq_ignore_ascii_case(&self.username)
    }

    pub fn mark_joined(&mut self, channel: &str) -> bool {
        self.moderators.entry(channel.to_string()).or_default();
        if self.is_joined(channel) {
            return false;
        }
        self.joined.push(channel.to_string());
        true
    }

    pub fn mark_parted(&mut self, channel: &str) {
        self.joined.retain(|c| c != channel);
        self.moderators.remove(channel);
        self.self_records.remove(channel);
    }

    pub fn is_moderator(&self, channel: &str, user: &str) -> bool {
        self.moderators
            .get(channel)
            .is_some_and(|mods| mods.contains(&user.to_lowercase()))
    }

    /// The live transport went away: remember what to rejoin and drop the
    /// per-connection state.
    pub fn forget_transport(&mut self) {
        if self.has_connected {
            let mut rejoin = std::mem::take(&mut self.joined);
            for channel in self.joins.remaining().chain(self.rejoin.iter()) {
                if !rejoin.contains(channel) {
                    rejoin.push(channel.clone());
                }
            }
            self.rejoin = rejoin;
        }
        self.live = None;
        self.welcomed = None;
        self.joined.clear();
        self.moderators.clear();
        self.pending_records.clear();
        self.self_records.clear();
        self.tags_enabled = false;
        self.graceful = false;
        self.joins.cancel();
        self.correlator.fail_all(ClientError::NotConnected);
        for (_, waiters) in self.mods_waiters.drain() {
            for reply in waiters {
                let _ = reply.send(Vec::new());
            }
        }
    }

    /// Return channel maps to a consistent empty state after an internal
    /// fault, keeping what is needed to rejoin.
    pub fn reset_after_crash(&mut self) {
        for channel in std::mem::take(&mut self.joined) {
            if !self.rejoin.contains(&channel) {
                self.rejoin.push(channel);
            }
        }
        self.moderators.clear();
        self.pending_records.clear();
        self.pending_actions.clear();
    }

    /// True once nothing is connected, opening or scheduled to reconnect.
    pub fn is_finished(&self) -> bool {
        self.terminal.is_some() && self.live.is_none() && self.opening.is_none()
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }
}
