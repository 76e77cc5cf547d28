//! Staggered channel joins.
//!
//! One JOIN leaves immediately and the rest follow at a fixed interval. Each
//! round carries a generation number so timers from an abandoned round
//! (transport lost, manual disconnect) are recognized as stale.

use std::collections::VecDeque;
use std::time::Duration;

use crate::irc::commands::normalize_channel;

pub const JOIN_INTERVAL: Duration = Duration::from_millis(3000);

#[derive(Debug, Default)]
pub struct JoinScheduler {
    queue: VecDeque<String>,
    generation: u64,
    skip_joined: bool,
    last_target: Option<String>,
    fully_joined: bool,
}

impl JoinScheduler {
    /// Start a new round over `targets`. When `skip_joined` is set, channels
    /// already in the joined set at send time are passed over. Returns the
    /// generation of the round.
    pub fn begin(&mut self, targets: &[String], skip_joined: bool) -> u64 {
        self.queue = targets.iter().map(|c| normalize_channel(c)).collect();
        self.queue.retain(|c| !c.is_empty());
        self.generation += 1;
        self.skip_joined = skip_joined;
        self.last_target = self.queue.back().cloned();
        self.fully_joined = self.queue.is_empty();
        self.generation
    }

    /// Carry the round over to a replacement transport. `rejoin` is sent
    /// first, then whatever the current round had not sent yet. The
    /// completion target is kept. Returns the new generation.
    pub fn resume(&mut self, rejoin: &[String]) -> u64 {
        let unsent: Vec<String> = self.queue.drain(..).collect();
        self.queue = rejoin.iter().cloned().collect();
        for channel in unsent {
            if !self.queue.contains(&channel) {
                self.queue.push_back(channel);
            }
        }
        self.generation += 1;
        self.skip_joined = false;
        self.generation
    }

    /// Next channel to join for round `generation`, or `None` when the round
    /// is stale or exhausted.
    pub fn next(&mut self, generation: u64, joined: &[String]) -> Option<String> {
        if generation != self.generation {
            return None;
        }
        while let Some(channel) = self.queue.pop_front() {
            if self.skip_joined && joined.contains(&channel) {
                continue;
            }
            return Some(channel);
        }
        None
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Channels of the current round that have not been sent yet.
    pub fn remaining(&self) -> impl Iterator<Item = &String> {
        self.queue.iter()
    }

    /// A JOIN echo for ourselves arrived.
    pub fn observe_join(&mut self, channel: &str) {
        if self.last_target.as_deref() == Some(channel) {
            self.fully_joined = true;
        }
    }

    pub fn is_fully_joined(&self) -> bool {
        self.fully_joined
    }

    /// Drop the current round; outstanding timers become stale.
    pub fn cancel(&mut self) {
        self.queue.clear();
        self.generation += 1;
    }
}
