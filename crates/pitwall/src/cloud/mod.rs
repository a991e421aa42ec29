//! Cloud coordinator
//!
//! - `controller`: per-vehicle stream state machine
//! - `switch`: idempotent camera/profile switch requests
//! - `transport`: outbound command feeds and the ACK ledger
//! - `events`: push-event fan-out to observers
//! - `directory`: vehicle registry and truck-token lookup
//! - `plane`: wires the above together

pub mod controller;
pub mod directory;
pub mod events;
pub mod plane;
pub mod switch;
pub mod transport;

pub use controller::VehicleStreamController;
pub use directory::{StaticDirectory, VehicleDirectory};
pub use events::EventBus;
pub use plane::{ControlPlane, Dispatched, PlaneConfig, VehicleStatus};
pub use switch::{SwitchRequest, SwitchRequestManager, SwitchStatus, SwitchTicket, SwitchValue};
pub use transport::CommandTransport;
