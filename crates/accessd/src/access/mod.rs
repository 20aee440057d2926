//! Access-bridge orchestration.
//!
//! - [`AccessFlowOrch`]: the orchestrator — event intake, the endpoint
//!   handler, the security-group-set compiler loop, drop-log and QoS
//!   handlers
//! - [`classifier`]: expansion of a single rule into flow entries
//! - [`static_flows`]: the invariant pipeline skeleton

pub mod classifier;
pub mod static_flows;

mod orch;

pub use orch::{AccessFlowOrch, AccessOrchConfig, AccessOrchError, AccessOrchStats};
