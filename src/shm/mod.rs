//! Shared Control Block
//!
//! A fixed-layout memory region shared between the controller and one
//! capture worker process. The controller creates it once per session and
//! the worker attaches to it by name every time it is (re)started.
//!
//! ```text
//! ┌──────────────────────────── header (208 bytes) ───────────────────────────┐
//! │ magic │ version │ flags │ tap off │ tap cursor │ tap cap │ master │ ...   │
//! ├──────────────────────────────── tap ring ─────────────────────────────────┤
//! │ raw captured frames, written by the worker modulo capacity                │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod control;
pub mod layout;
pub mod region;
pub mod tap;

pub use channel::Channel;
pub use control::{ControlBlock, ControlSnapshot, Flag};
pub use tap::{TapReader, TapWriter};
