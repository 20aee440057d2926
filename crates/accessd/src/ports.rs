//! Interface-name to switch-port index.
//!
//! The switch layer discovers ports asynchronously; endpoints reference
//! them by interface name. `PortIndex` holds the current name-to-number
//! mapping and notifies registered listeners on every add, remove, or
//! rename so dependent flows can be re-driven.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Listener invoked with `(name, port_no, present)` on every mapping
/// change. `present` is false when the port went away.
pub type PortStatusListener = Arc<dyn Fn(&str, u32, bool) + Send + Sync>;

/// Thread-safe map of interface names to OpenFlow port numbers.
#[derive(Default)]
pub struct PortIndex {
    ports: RwLock<HashMap<String, u32>>,
    listeners: RwLock<Vec<PortStatusListener>>,
}

impl PortIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for port status changes.
    pub fn register_listener(&self, listener: PortStatusListener) {
        self.listeners.write().unwrap().push(listener);
    }

    /// Returns the port number for an interface name, if known.
    pub fn find(&self, name: &str) -> Option<u32> {
        self.ports.read().unwrap().get(name).copied()
    }

    /// Adds or updates a mapping and notifies listeners.
    pub fn set(&self, name: &str, port_no: u32) {
        {
            let mut ports = self.ports.write().unwrap();
            if ports.insert(name.to_string(), port_no) == Some(port_no) {
                return;
            }
        }
        debug!(name, port_no, "port mapped");
        self.notify(name, port_no, true);
    }

    /// Removes a mapping and notifies listeners.
    pub fn remove(&self, name: &str) {
        let removed = self.ports.write().unwrap().remove(name);
        if let Some(port_no) = removed {
            debug!(name, port_no, "port unmapped");
            self.notify(name, port_no, false);
        }
    }

    /// Renames an interface, preserving its port number.
    pub fn rename(&self, old: &str, new: &str) {
        let port_no = {
            let mut ports = self.ports.write().unwrap();
            match ports.remove(old) {
                Some(p) => {
                    ports.insert(new.to_string(), p);
                    p
                }
                None => return,
            }
        };
        debug!(old, new, port_no, "port renamed");
        self.notify(old, port_no, false);
        self.notify(new, port_no, true);
    }

    /// Number of known ports.
    pub fn len(&self) -> usize {
        self.ports.read().unwrap().len()
    }

    /// Returns true if no ports are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, name: &str, port_no: u32, present: bool) {
        let listeners = self.listeners.read().unwrap().clone();
        for listener in listeners {
            listener(name, port_no, present);
        }
    }
}

impl std::fmt::Debug for PortIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortIndex")
            .field("ports", &self.ports.read().unwrap().len())
            .field("listeners", &self.listeners.read().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[test]
    fn test_set_and_find() {
        let index = PortIndex::new();
        assert_eq!(index.find("veth0"), None);
        index.set("veth0", 5);
        assert_eq!(index.find("veth0"), Some(5));
    }

    #[test]
    fn test_remove() {
        let index = PortIndex::new();
        index.set("veth0", 5);
        index.remove("veth0");
        assert_eq!(index.find("veth0"), None);
    }

    #[test]
    fn test_rename_preserves_port() {
        let index = PortIndex::new();
        index.set("veth0", 5);
        index.rename("veth0", "veth1");
        assert_eq!(index.find("veth0"), None);
        assert_eq!(index.find("veth1"), Some(5));
    }

    #[test]
    fn test_listener_notified() {
        let index = PortIndex::new();
        let events: Arc<Mutex<Vec<(String, u32, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        index.register_listener(Arc::new(move |name, port, present| {
            sink.lock().unwrap().push((name.to_string(), port, present));
        }));

        index.set("veth0", 5);
        index.set("veth0", 5); // no-op, no event
        index.remove("veth0");

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                ("veth0".to_string(), 5, true),
                ("veth0".to_string(), 5, false),
            ]
        );
    }
}
