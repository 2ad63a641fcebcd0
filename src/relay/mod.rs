//! Rendezvous Relay
//!
//! Stateless apart from an in-memory session table: peers are located by
//! relay id, never by mesh address, and nothing here touches the registry.

pub mod client;
pub mod server;
pub mod session;
pub mod wire;

pub use client::RelayClient;
pub use server::{RelayReport, RelayServer, RelayStats};
pub use session::{Session, SessionTable};
