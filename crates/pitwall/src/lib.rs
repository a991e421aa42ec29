//! Pitwall - remote stream control for vehicle-mounted cameras
//!
//! This is the unified library crate for Pitwall. Feature flags control
//! which modules are compiled:
//!
//! - **Core types** (always available): camera slots, quality profiles, command
//!   wire types, stream state, push events, error taxonomy, keyed store
//! - **`cloud`**: vehicle stream controller, switch request managers, command
//!   transport, event bus, control plane
//! - **`web`**: axum HTTP API and WebSocket push channels (implies `cloud`)
//! - **`edge`**: encoder supervisor, health controller, push-channel listener,
//!   edge agent

// Core modules (always compiled)
mod camera;
mod command;
mod error;
mod event;
mod profile;
mod protocol;
mod state;
mod vehicle;

pub mod store;

pub use camera::CameraSlot;
pub use command::*;
pub use error::{ControlError, StreamErrorReason};
pub use event::PushEvent;
pub use profile::QualityProfile;
pub use protocol::*;
pub use state::{Heartbeat, StreamController, StreamPhase, StreamState, StreamingStatus};
pub use vehicle::VehicleKey;

// Cloud: stream controller, switch managers, transport, control plane
#[cfg(feature = "cloud")]
pub mod cloud;

// Web: axum HTTP server and WebSocket push feeds
#[cfg(feature = "web")]
pub mod web;

// Edge: supervisor, health controller, listener, agent
#[cfg(feature = "edge")]
pub mod edge;
