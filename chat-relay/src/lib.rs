//! Line-oriented chat relay over TCP.
//!
//! Clients connect, pick a unique nickname, and exchange plain text lines:
//! public chat, private `/w` messages, and `/nick` renames. The relay answers
//! with `USERS`, `DM` and `SYS` prefixed lines (see [`protocol`]).
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`server`] accepts TCP connections and spawns one session task each.
//! - [`session`] runs a connection through handshake, chat, and cleanup.
//! - [`router`] decides what each chat line means and applies it.
//! - [`registry`] is the shared nickname → session map with broadcast and
//!   unicast delivery.
//! - [`protocol`] holds the line framing and the server line prefixes.
//! - [`client`] is a terminal client for the relay.

pub mod cli;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
