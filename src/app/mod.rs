//! Core client logic: session state, the event dispatcher and the actions
//! it asks the client loop to perform.

pub mod action;
pub mod correlator;
pub mod event;
pub mod handler;
pub mod joins;
pub mod legacy;
pub mod requests;
pub mod state;
