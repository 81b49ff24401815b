pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod signaling;
