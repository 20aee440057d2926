//! Access-bridge flow programmer.
//!
//! This crate translates declarative endpoint and security-group policy
//! into a deterministic, prioritized set of flow entries for the software
//! switch attached to workload interfaces on a compute node.
//!
//! # Architecture
//!
//! ```text
//! [endpoint / policy / port / config updates]
//!          │
//!          ▼  per-key FIFO dispatch
//!    [AccessFlowOrch] ──> [classifier expansion]
//!          │
//!          ▼  write-by-(owner, table)
//!    [FlowProgrammer] ──> [FlowSink] ──> external reconciler ──> datapath
//! ```
//!
//! The pipeline contract is a fixed sequence of ten tables (see
//! [`flow::table`]): packets are classified and conntrack-zoned in
//! GROUP_MAP, filtered by system and user security groups, optionally
//! punted in TAP, and dispatched by OUT, with EXP_DROP collecting logged
//! drops.
//!
//! # Key components
//!
//! - [`access::AccessFlowOrch`]: event intake and flow compilation
//! - [`flow::FlowBuilder`] / [`flow::FlowEntry`]: the flow value model
//! - [`switch::FlowProgrammer`]: keyed flow-set ownership over the
//!   reconciler contract
//! - [`ports::PortIndex`], [`ctzone::CtZoneAllocator`]: shared lookups and
//!   allocators
//! - [`policy`]: the external store contracts and the policy data model

pub mod access;
pub mod ctzone;
pub mod flow;
pub mod policy;
pub mod ports;
pub mod switch;

pub use access::{AccessFlowOrch, AccessOrchConfig, AccessOrchError, AccessOrchStats};
pub use ctzone::CtZoneAllocator;
pub use ports::PortIndex;
pub use switch::{FlowProgrammer, FlowSink, LoggingSink, NullSink, RecordingSink};
