//! HTTP front end: protocol upgrades and static files

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{AppState, WebServer};
