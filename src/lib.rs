//! # LAN Capture Control
//!
//! Control plane for per-session audio-capture worker processes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          CONTROL PLANE                               │
//! │                                                                      │
//! │  ┌────────────────┐   LoopEvent    ┌──────────────────────────────┐  │
//! │  │ HTTP / WS      │ ─────────────► │ Control-plane loop (app)     │  │
//! │  │ server (ui)    │ ◄───────────── │  RootModel                   │  │
//! │  └────────────────┘   Outgoing     │   └─ SessionRegistry         │  │
//! │          ▲                         │        ├─ Session + block    │  │
//! │          │ JSON / bincode          │        └─ Supervisor         │  │
//! │          ▼                         │  ClientHandler per socket    │  │
//! │     control clients                └──────────────┬───────────────┘  │
//! │                                                   │ PollBatch        │
//! │                                     ┌─────────────┴──────────────┐   │
//! │                                     │ shm-poller thread          │   │
//! │                                     └─────────────┬──────────────┘   │
//! └───────────────────────────────────────────────────┼──────────────────┘
//!                                                     │ Shared Control Blocks
//!                                                     ▼
//!                                  ┌──────────────────────────────────┐
//!                                  │ capture worker processes         │
//!                                  │ (one per valid session)          │
//!                                  └──────────────────────────────────┘
//! ```

pub mod app;
pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod shm;
pub mod ui;
pub mod worker;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default HTTP / WebSocket port
    pub const DEFAULT_HTTP_PORT: u16 = 8081;

    /// Monitor samples averaged for `MonitorVolume`
    pub const MONITOR_SLOTS: usize = 6;

    /// Smallest `MonitorVolume` movement worth a notification
    pub const MONITOR_VOLUME_STEP: f64 = 1.0 / 128.0;

    /// Largest binary protocol frame accepted or produced
    pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

    /// Header carrying a client's requested permission intents
    pub const INTENTS_HEADER: &str = "Capture-Intents";
}
