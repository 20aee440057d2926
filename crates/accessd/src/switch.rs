//! Flow-set ownership and the reconciler contract.
//!
//! Every flow the agent emits is owned by an `(owner key, table id)` cell.
//! A write replaces the cell's previous contents atomically from the
//! reconciler's point of view; the reconciler diffs against the datapath
//! and converges it. The programmer never diffs itself.

use crate::flow::{FlowEntry, TlvEntry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Contract exposed to the flow reconciler.
///
/// Implementations receive the complete new flow set for a cell on every
/// write; an empty set clears the cell.
pub trait FlowSink: Send + Sync {
    /// Replace the owner's flows in a table.
    fn write_flow(&self, owner: &str, table: u8, flows: &[FlowEntry]);

    /// Replace the owner's TLV registrations.
    fn write_tlv(&self, owner: &str, tlvs: &[TlvEntry]);

    /// Begin reconciling declared state to the datapath. Called once the
    /// policy connection is ready.
    fn enable_sync(&self) {}
}

/// Owns declared flow state per `(owner, table)` cell and forwards every
/// complete set to the [`FlowSink`].
pub struct FlowProgrammer {
    sink: Box<dyn FlowSink>,
    cells: Mutex<HashMap<(String, u8), Vec<FlowEntry>>>,
    tlvs: Mutex<HashMap<String, Vec<TlvEntry>>>,
    sync_enabled: AtomicBool,
}

impl FlowProgrammer {
    pub fn new(sink: Box<dyn FlowSink>) -> Self {
        FlowProgrammer {
            sink,
            cells: Mutex::new(HashMap::new()),
            tlvs: Mutex::new(HashMap::new()),
            sync_enabled: AtomicBool::new(false),
        }
    }

    /// Replaces the flows owned by `(owner, table)`.
    pub fn write(&self, owner: &str, table: u8, flows: Vec<FlowEntry>) {
        trace!(owner, table, count = flows.len(), "writing flow set");
        {
            let mut cells = self.cells.lock().unwrap();
            if flows.is_empty() {
                cells.remove(&(owner.to_string(), table));
            } else {
                cells.insert((owner.to_string(), table), flows.clone());
            }
        }
        self.sink.write_flow(owner, table, &flows);
    }

    /// Removes all flows owned by `(owner, table)`.
    pub fn clear(&self, owner: &str, table: u8) {
        self.write(owner, table, Vec::new());
    }

    /// Replaces the TLV registrations owned by `owner`.
    pub fn write_tlv(&self, owner: &str, tlvs: Vec<TlvEntry>) {
        trace!(owner, count = tlvs.len(), "writing tlv set");
        self.tlvs
            .lock()
            .unwrap()
            .insert(owner.to_string(), tlvs.clone());
        self.sink.write_tlv(owner, &tlvs);
    }

    /// Current flows for a cell (empty when the cell is clear).
    pub fn flows(&self, owner: &str, table: u8) -> Vec<FlowEntry> {
        self.cells
            .lock()
            .unwrap()
            .get(&(owner.to_string(), table))
            .cloned()
            .unwrap_or_default()
    }

    /// Owners with at least one flow in a table, sorted for stable output.
    pub fn owners_in_table(&self, table: u8) -> Vec<String> {
        let cells = self.cells.lock().unwrap();
        let mut owners: Vec<String> = cells
            .keys()
            .filter(|(_, t)| *t == table)
            .map(|(owner, _)| owner.clone())
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }

    /// Current TLV registrations for an owner.
    pub fn tlvs(&self, owner: &str) -> Vec<TlvEntry> {
        self.tlvs
            .lock()
            .unwrap()
            .get(owner)
            .cloned()
            .unwrap_or_default()
    }

    /// Forwards the sync-enable signal to the reconciler.
    pub fn enable_sync(&self) {
        if !self.sync_enabled.swap(true, Ordering::SeqCst) {
            debug!("enabling datapath sync");
        }
        self.sink.enable_sync();
    }

    /// Whether sync has been enabled.
    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }
}

impl<T: FlowSink + ?Sized> FlowSink for std::sync::Arc<T> {
    fn write_flow(&self, owner: &str, table: u8, flows: &[FlowEntry]) {
        (**self).write_flow(owner, table, flows)
    }

    fn write_tlv(&self, owner: &str, tlvs: &[TlvEntry]) {
        (**self).write_tlv(owner, tlvs)
    }

    fn enable_sync(&self) {
        (**self).enable_sync()
    }
}

/// Sink that drops everything; placeholder wiring for tests of unrelated
/// paths.
#[derive(Debug, Default)]
pub struct NullSink;

impl FlowSink for NullSink {
    fn write_flow(&self, _owner: &str, _table: u8, _flows: &[FlowEntry]) {}
    fn write_tlv(&self, _owner: &str, _tlvs: &[TlvEntry]) {}
}

/// Sink that records every write in order; used by the test suites to
/// observe replace semantics and write ordering.
#[derive(Debug, Default)]
pub struct RecordingSink {
    writes: Mutex<Vec<(String, u8, usize)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(owner, table, flow count)` per write, in call order.
    pub fn writes(&self) -> Vec<(String, u8, usize)> {
        self.writes.lock().unwrap().clone()
    }
}

impl FlowSink for RecordingSink {
    fn write_flow(&self, owner: &str, table: u8, flows: &[FlowEntry]) {
        self.writes
            .lock()
            .unwrap()
            .push((owner.to_string(), table, flows.len()));
    }

    fn write_tlv(&self, _owner: &str, _tlvs: &[TlvEntry]) {}
}

/// Sink that logs writes; used by the standalone binary.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl FlowSink for LoggingSink {
    fn write_flow(&self, owner: &str, table: u8, flows: &[FlowEntry]) {
        debug!(owner, table, count = flows.len(), "flow set replaced");
    }

    fn write_tlv(&self, owner: &str, tlvs: &[TlvEntry]) {
        debug!(owner, count = tlvs.len(), "tlv set replaced");
    }

    fn enable_sync(&self) {
        debug!("sync enabled");
    }
}
