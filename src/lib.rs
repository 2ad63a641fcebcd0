//! WolfMesh - Control plane for a small private mesh network
//!
//! WolfMesh hands out stable mesh addresses to peers identified by their
//! public keys, and runs a rendezvous relay for peers that cannot reach each
//! other directly. Encryption and packet transport belong to an external
//! secure-tunnel engine (WireGuard) that WolfMesh only configures.
//!
//! # Architecture
//!
//! - `pool` - which addresses of the mesh range are free
//! - `registry` - durable identity to address mapping (SQLite), the only
//!   writer of the pool
//! - `relay` - UDP rendezvous keyed by a 16-byte peer id
//! - `api` - HTTP registration endpoint in front of the registry
//! - `session` - client orchestrator: register, configure, supervise
//! - `tunnel` - traits and `wg`/`ip` implementations of the external
//!   collaborators

pub mod api;
pub mod config;
pub mod error;
pub mod identity;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod session;
pub mod tunnel;

pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ClientConfig, ServerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::identity::{Identity, KeyPair, NodeId};
    pub use crate::pool::AddressPool;
    pub use crate::registry::{PeerEvent, PeerRecord, PeerRegistry, PeerStore};
    pub use crate::relay::{RelayClient, RelayServer};
    pub use crate::session::{Orchestrator, SessionState};
}
