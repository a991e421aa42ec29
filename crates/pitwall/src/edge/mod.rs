//! Edge device runtime
//!
//! - `supervisor`: owns the encoder process, restart policy and breaker
//! - `classify`: turns an encoder exit into a failure kind
//! - `backoff`: exponential delays for restarts and reconnects
//! - `health` / `window`: throughput-driven automatic quality
//! - `listener`: WebSocket command feed from the cloud
//! - `agent`: executes commands, sends ACKs and heartbeats

pub mod agent;
pub mod backoff;
pub mod classify;
pub mod health;
pub mod listener;
pub mod supervisor;
pub mod window;

pub use agent::{AgentConfig, CloudClient, CloudLink, EdgeAgent};
pub use backoff::BackoffPolicy;
pub use classify::{classify_failure, FailureKind};
pub use health::{HealthConfig, HealthController, HealthDecision, HealthReading};
pub use listener::CommandListener;
pub use supervisor::{
    EncoderSignal, EncoderSpec, Supervisor, SupervisorError, SupervisorHandle, SupervisorPolicy,
    SupervisorState, SupervisorStatus,
};
