//! Policy-facing data model and external store contracts.
//!
//! The agent does not own endpoint or policy state; it consumes immutable
//! snapshots from the stores defined here:
//!
//! - [`Endpoint`]: workload attachment, addressing, and group membership
//! - [`PolicyRule`] / [`L4Classifier`]: declarative security-group rules
//! - [`EndpointStore`] / [`PolicyStore`]: the read-only lookup contracts
//! - [`DropLogConfig`] / [`DropFlowSpec`]: observer drop-logging objects

mod config;
mod endpoint;
mod rule;
mod store;

pub use config::{DropFlowSpec, DropLogConfig, DropLogMode};
pub use endpoint::{sec_group_set_from_id, sec_group_set_id, Endpoint, IpMapping};
pub use rule::{
    tcp_flags, tcp_flags_to_wire, ConnTrackMode, Direction, L4Classifier, PolicyRule, ServicePort,
};
pub use store::{EndpointStore, MemoryEndpointStore, MemoryPolicyStore, PolicyStore};
