//! relayd - relaymesh peer daemon
//!
//! Wires the relay switchboard to TCP peer links.

pub mod config;
pub mod server;
