//! A persistent client for the Twitch chat (TMI) service.
//!
//! [`Client`] owns the connection and all session state; observers receive
//! typed [`Event`]s and a [`ClientHandle`] issues requests.

pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod irc;
pub mod logging;

pub use client::{Ack, Client, ClientHandle, CommandOutcome, Event, EventKind, UserRecord};
pub use config::ClientConfig;
pub use error::ClientError;
