//! Worker process management
//!
//! Every valid session has one external capture worker. This module builds
//! its command line, supervises the child process, and keeps the last few
//! lines it wrote to stderr.

pub mod args;
pub mod console;
pub mod driver;
pub mod supervisor;

pub use args::{CaptureParameters, LocalSinkSpec, NetworkSinkSpec, SourceSpec};
pub use console::Console;
pub use driver::{LaunchRequest, ProcessDriver, WorkerDriver, WorkerHandle};
pub use supervisor::{StartingHook, StopMode, Supervisor, SupervisorState};
