//! Protocol layer: line codec, message model, endpoint selection, outbound
//! line builders, and transport management.

pub mod codec;
pub mod commands;
pub mod connection;
pub mod manager;
pub mod message;
pub mod resolver;
