//! Capture sessions
//!
//! A session pairs persisted [`SessionSettings`](crate::config::SessionSettings)
//! with a Shared Control Block and, while its devices resolve, a supervised
//! worker. The [`RootModel`] owns every session in display order through the
//! [`SessionRegistry`] and turns state changes into [`ModelChange`] events.

pub mod model;
pub mod poller;
pub mod properties;
pub mod registry;
pub mod root;

/// Process-local session id, monotonic and never reused
pub type SessionId = u32;

pub use model::Session;
pub use poller::{PollBatch, PollSet, Poller};
pub use registry::{RegistryOptions, SessionRegistry};
pub use root::{ModelChange, RootModel};
