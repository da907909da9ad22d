//! Supabase Realtime transport for Campus.
//!
//! This crate provides:
//! - Phoenix channel framing for `postgres_changes` and presence
//! - A reconnecting websocket client with per-socket heartbeats
//! - [`campus_sync::PushTransport`] and [`campus_sync::PresenceChannel`]
//!   implementations backed by that client

mod client;
mod error;
pub mod protocol;

pub use client::{DEFAULT_HEARTBEAT, RealtimeClient, RealtimeConfig};
pub use error::RealtimeError;
pub use protocol::{Frame, PresenceMap};
