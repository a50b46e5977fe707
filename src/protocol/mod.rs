//! Control protocol
//!
//! JSON-RPC-style requests, responses and notifications exchanged with
//! control clients over a WebSocket. Text frames carry JSON; binary frames
//! carry the same documents encoded with bincode, and tap data is always
//! sent binary.

pub mod codec;
pub mod handler;
pub mod message;
pub mod permissions;

pub use codec::WireValue;
pub use handler::{ClientHandler, ConnectionInfo, Deferred};
pub use message::{Outbound, Outgoing, Request, RpcError};
pub use permissions::{EffectivePermissions, Permissions};
