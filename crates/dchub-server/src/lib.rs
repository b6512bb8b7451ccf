//! Multi-protocol Direct Connect hub.
//!
//! A central rendezvous where peers register nicknames, exchange public
//! and private chat, discover each other's share metadata and initiate
//! peer-to-peer transfer connections. One TCP listener serves three wire
//! protocols concurrently — NMDC, ADC and an IRC bridge — over a single
//! shared roster.
//!
//! # Architecture
//!
//! - [`Hub`] owns the [`Roster`](roster::Roster), the rooms and the
//!   configuration; connection tasks hold an `Arc<Hub>`.
//! - Each accepted connection is sniffed ([`sniff`]) and dispatched to
//!   its protocol handler, which runs the handshake and session loop on
//!   the connection's own task.
//! - Every peer owns a bounded outbound queue drained by a writer task;
//!   broadcasts snapshot the roster, then enqueue without locks held.
//!   Slow consumers are evicted, never waited on.
//! - The user/profile database ([`UserDatabase`]) is an external
//!   collaborator; [`MemoryDatabase`] is the built-in default.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod adc;
pub mod cmd;
pub mod config;
mod conn;
pub mod db;
mod error;
pub mod hub;
mod irc;
pub mod motd;
mod nmdc;
pub mod peer;
pub mod room;
pub mod roster;
pub mod sniff;

pub use config::Config;
pub use db::{MemoryDatabase, Profile, UserDatabase, UserRecord};
pub use error::HubError;
pub use hub::{Hub, HubHooks, HubOptions, Server};
pub use peer::{ConnInfo, Peer, PeerRef, Protocol, UserInfo};
pub use room::{ChatMessage, Room};
