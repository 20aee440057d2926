//! Flow value model for the access-bridge pipeline.
//!
//! This module defines everything a flow entry is made of:
//!
//! - [`FlowEntry`], [`MatchField`], [`FlowAction`], [`TlvEntry`]: the
//!   immutable, structurally comparable value model handed to the reconciler
//! - [`FlowBuilder`]: ordered construction of entries
//! - [`constants`]: the pipeline table layout, metadata fields, and cookies
//! - [`range`]: value/mask expansion of port ranges

mod builder;
mod entry;

pub mod constants;
pub mod range;

pub use builder::{tlv, FlowBuilder};
pub use constants::{cookie, eth, flags, ip_proto, meta, table, MAX_POLICY_RULE_PRIORITY};
pub use entry::{
    ct_flags, ct_state, CaptureReason, FlowAction, FlowEntry, MatchField, Reg, TlvEntry,
};
