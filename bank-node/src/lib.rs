//! A bank node that speaks a two-letter line protocol over TCP.
//!
//! Each node owns a table of accounts identified as `<number>/<address>`.
//! Commands naming another node's address are relayed to that node over a
//! fresh connection, so any node can serve as an entry point to the network.
//!
//! - [`protocol`] parses request lines into typed commands.
//! - [`bank`] holds the account table and persists it after every change
//!   through [`snapshot`].
//! - [`dispatcher`] decides between local execution and relaying via
//!   [`forward`], and renders every outcome as a reply line.
//! - [`server`] runs the accept loop and per-connection state machine with
//!   idle and command timeouts; [`gate`] keeps a timed-out command from
//!   mutating state afterwards.
//! - [`node`] starts and stops a server from a [`config::NodeConfig`] and
//!   reports lifecycle and account activity on an [`events`] stream.
//! - [`cli`] and [`client`] back the `bank-node` binary.
//!
//! [`wire`] holds the newline-delimited read and write helpers shared by the
//! server, the relay client and the interactive client.

pub mod bank;
pub mod cli;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod forward;
pub mod gate;
pub mod node;
pub mod protocol;
pub mod server;
pub mod snapshot;
pub mod wire;
