//! Listener registration and info-snapshot emission.
//!
//! `add_listener` gets a full node-info + port-info snapshot immediately on
//! registration (mirroring the `full=true` emission the original always
//! does for a freshly joined listener), then only incremental updates
//! (`full=false`) on subsequent state changes such as a `set_props` write.

use std::collections::HashMap;

use crate::format::AudioFormat;

/// Node-level info snapshot, analogous to `spa_node_info`.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub max_input_ports: u32,
    pub max_output_ports: u32,
    pub n_ports: u32,
    pub props: HashMap<String, String>,
}

/// Port-level info snapshot, analogous to `spa_port_info`.
#[derive(Debug, Clone, Default)]
pub struct PortInfo {
    pub direction_output: bool,
    pub format: Option<AudioFormat>,
    pub n_params: u32,
    /// `SPA_PORT_FLAG_LIVE`: data arrives in real time, not on demand.
    pub live: bool,
    /// `SPA_PORT_FLAG_TERMINAL`: nothing downstream renegotiates this port.
    pub terminal: bool,
}

/// One event delivered to a registered listener.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// `full = true` on first emission after `add_listener`, `false` after.
    Info { info: NodeInfo, full: bool },
    PortInfo { info: PortInfo, full: bool },
}

/// A callback-style listener; closures stand in for the original's vtable
/// of per-event function pointers.
pub trait NodeListener: Send {
    fn on_event(&mut self, event: &NodeEvent);
}

/// Listener registry plus the two info snapshots it emits against.
#[derive(Default)]
pub struct EventHub {
    listeners: Vec<Box<dyn NodeListener>>,
    node_info: NodeInfo,
    port_info: PortInfo,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    pub fn node_info_mut(&mut self) -> &mut NodeInfo {
        &mut self.node_info
    }

    pub fn port_info_mut(&mut self) -> &mut PortInfo {
        &mut self.port_info
    }

    /// Register a listener and immediately give it a full snapshot of both
    /// info structs, exactly as the original isolates the hook list and
    /// re-emits `full=true` before joining the listener into the live set.
    pub fn add_listener(&mut self, mut listener: Box<dyn NodeListener>) {
        listener.on_event(&NodeEvent::Info {
            info: self.node_info.clone(),
            full: true,
        });
        listener.on_event(&NodeEvent::PortInfo {
            info: self.port_info.clone(),
            full: true,
        });
        self.listeners.push(listener);
    }

    /// Broadcast an incremental node-info update to every registered
    /// listener.
    pub fn emit_node_info(&mut self) {
        let info = self.node_info.clone();
        for listener in &mut self.listeners {
            listener.on_event(&NodeEvent::Info {
                info: info.clone(),
                full: false,
            });
        }
    }

    /// Broadcast an incremental port-info update to every registered
    /// listener.
    pub fn emit_port_info(&mut self) {
        let info = self.port_info.clone();
        for listener in &mut self.listeners {
            listener.on_event(&NodeEvent::PortInfo {
                info: info.clone(),
                full: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingListener {
        events: Arc<Mutex<Vec<NodeEvent>>>,
    }

    impl NodeListener for RecordingListener {
        fn on_event(&mut self, event: &NodeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn add_listener_gets_full_snapshot_immediately() {
        let mut hub = EventHub::new();
        hub.node_info_mut().n_ports = 1;

        let events = Arc::new(Mutex::new(Vec::new()));
        hub.add_listener(Box::new(RecordingListener {
            events: events.clone(),
        }));

        let recorded = events.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(matches!(
            recorded[0],
            NodeEvent::Info { full: true, .. }
        ));
        assert!(matches!(
            recorded[1],
            NodeEvent::PortInfo { full: true, .. }
        ));
    }

    #[test]
    fn subsequent_emits_are_incremental() {
        let mut hub = EventHub::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        hub.add_listener(Box::new(RecordingListener {
            events: events.clone(),
        }));

        hub.emit_node_info();
        let recorded = events.lock().unwrap();
        assert_eq!(recorded.len(), 3);
        assert!(matches!(recorded[2], NodeEvent::Info { full: false, .. }));
    }
}
