//! `drbdsetup events2` parsing and the resource state cache

use crate::crd::{HAState, HAStateKind};
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::{debug, warn};

// disk states
pub const DISK_UP_TO_DATE: &str = "UpToDate";
pub const DISK_OUTDATED: &str = "Outdated";
pub const DISK_INCONSISTENT: &str = "Inconsistent";
pub const DISK_CONSISTENT: &str = "Consistent";
pub const DISK_DISKLESS: &str = "Diskless";
pub const DISK_NEGOTIATING: &str = "Negotiating";
pub const DISK_DETACHING: &str = "Detaching";
pub const DISK_ATTACHING: &str = "Attaching";

pub const CONNECTION_CONNECTED: &str = "Connected";

/// Object an event line reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventObject {
    Resource,
    Device,
    PeerDevice,
    Connection,
    Other,
}

impl EventObject {
    fn parse(s: &str) -> Self {
        match s {
            "resource" => EventObject::Resource,
            "device" => EventObject::Device,
            "peer-device" => EventObject::PeerDevice,
            "connection" => EventObject::Connection,
            _ => EventObject::Other,
        }
    }
}

/// One `events2` line, e.g.
/// `change device name:pvc-1 volume:0 minor:43001 disk:UpToDate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub action: String,
    pub object: EventObject,
    pub resource: String,
    pub fields: BTreeMap<String, String>,
}

impl Event {
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return None;
        }
        let resource = match parts[2].split_once(':') {
            Some(("name", name)) if !name.is_empty() => name.to_string(),
            _ => {
                warn!(event = %line, "Event without a resource name");
                return None;
            }
        };
        let fields = parts[2..]
            .iter()
            .filter_map(|p| p.split_once(':'))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some(Self {
            action: parts[0].to_string(),
            object: EventObject::parse(parts[1]),
            resource,
            fields,
        })
    }

    fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDevice {
    pub node_id: i32,
    /// Peer hostname
    pub connection_name: String,
    pub replication: String,
    pub disk_state: String,
}

/// Last observed state of one replication resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub role: String,
    pub device_state: String,
    /// Keyed by peer hostname
    pub peer_devices: BTreeMap<String, PeerDevice>,
}

impl Resource {
    /// Map the local disk state onto the replica HA state
    pub fn ha_state(&self) -> HAState {
        let kind = match self.device_state.as_str() {
            DISK_UP_TO_DATE => HAStateKind::Consistent,
            DISK_INCONSISTENT | DISK_CONSISTENT | DISK_OUTDATED => HAStateKind::Inconsistent,
            DISK_NEGOTIATING => HAStateKind::Up,
            DISK_DISKLESS | DISK_DETACHING | DISK_ATTACHING => HAStateKind::Down,
            _ => HAStateKind::Down,
        };
        HAState::new(kind, format!("device is {}", self.device_state))
    }
}

/// Resource states fed by the event stream
#[derive(Debug, Default)]
pub struct ResourceCache {
    resources: DashMap<String, Resource>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an event into the cache.
    ///
    /// Returns the resource name when its state changed.
    pub fn apply(&self, event: &Event) -> Option<String> {
        if event.object == EventObject::Other || event.object == EventObject::Connection {
            debug!(resource = %event.resource, object = ?event.object, "Ignoring event");
            return None;
        }

        let mut entry = self
            .resources
            .entry(event.resource.clone())
            .or_insert_with(|| Resource {
                name: event.resource.clone(),
                ..Default::default()
            });
        let resource = entry.value_mut();

        match event.object {
            EventObject::Device => {
                if let Some(disk) = event.field("disk") {
                    resource.device_state = disk.to_string();
                }
            }
            EventObject::PeerDevice => {
                let hostname = event.field("conn-name")?;
                let peer = resource
                    .peer_devices
                    .entry(hostname.to_string())
                    .or_insert_with(|| PeerDevice {
                        connection_name: hostname.to_string(),
                        ..Default::default()
                    });
                if let Some(id) = event.field("peer-node-id").and_then(|v| v.parse().ok()) {
                    peer.node_id = id;
                }
                if let Some(replication) = event.field("replication") {
                    peer.replication = replication.to_string();
                }
                if let Some(disk) = event.field("peer-disk") {
                    peer.disk_state = disk.to_string();
                }
            }
            EventObject::Resource => {
                if let Some(role) = event.field("role") {
                    resource.role = role.to_string();
                }
            }
            EventObject::Connection | EventObject::Other => {}
        }
        Some(event.resource.clone())
    }

    pub fn get(&self, resource: &str) -> Option<Resource> {
        self.resources.get(resource).map(|r| r.value().clone())
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.resources.contains_key(resource)
    }

    pub fn remove(&self, resource: &str) {
        self.resources.remove(resource);
    }
}
