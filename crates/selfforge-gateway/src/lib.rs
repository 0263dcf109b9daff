//! selfforge-gateway — network framing over the core's plain operations.
//!
//! The event stream goes out over a WebSocket at /ws; the control surface
//! (execute task, manage tools) is a small set of JSON routes.

pub mod server;
pub mod ws;

pub use server::{serve, GatewayState};
