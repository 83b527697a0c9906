//! tandem - Host-authoritative two-player session sync
//!
//! One peer (the host) owns the canonical game world; the other (the guest)
//! renders a smoothed mirror of it. This library provides the room transport,
//! typed message bus, connection lifecycle with reconnection, and the
//! host/guest sync controllers.

pub mod config;
pub mod network;
pub mod protocol;
pub mod sync;

pub use config::TandemConfig;
pub use network::{ConnectionLifecycle, ConnectionState, MessageBus, Transport};
pub use protocol::{Role, RoomCode, SyncMessage};
pub use sync::{AuthorityController, MirrorController};
