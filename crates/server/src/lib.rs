//! Local HTTP/WebSocket front end for the Trellis job client.

pub mod api;
pub mod metrics;
pub mod state;
