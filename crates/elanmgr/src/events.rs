//! Event scripts replayed by `elanmgrd --events`.
//!
//! A script is JSON lines, one event per line, tagged by `op`. Blank lines
//! and lines starting with `#` are skipped.
//!
//! ```text
//! {"op":"create_domain","name":"blue","segmentation":"vxlan","segmentation_id":100}
//! {"op":"register_port","name":"p1","dpn":1000,"port_tag":1}
//! {"op":"add_interface","domain":"blue","port":"p1"}
//! ```

use crate::error::{ElanError, Result};
use crate::learning::UnknownSourceEvent;
use crate::manager::ElanManager;
use crate::memory::InMemoryCollaborators;
use crate::types::{DomainConfig, PortDescriptor};
use elan_types::{DatapathId, MacAddress};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ElanEvent {
    CreateDomain(DomainConfig),
    UpdateDomain(DomainConfig),
    DeleteDomain {
        name: String,
    },
    /// Makes a port known to the interface registry
    RegisterPort(PortDescriptor),
    UnregisterPort {
        name: String,
    },
    AddInterface {
        domain: String,
        port: String,
    },
    RemoveInterface {
        domain: String,
        port: String,
    },
    UnknownSource(UnknownSourceEvent),
    MacAged {
        domain: String,
        mac: MacAddress,
    },
    AddStaticMac {
        domain: String,
        mac: MacAddress,
        port: String,
    },
    RemoveStaticMac {
        domain: String,
        mac: MacAddress,
    },
    TunnelState {
        src: DatapathId,
        dst: DatapathId,
        up: bool,
    },
    AttachGateway {
        domain: String,
        device: String,
    },
}

pub fn parse_events(script: &str) -> Result<Vec<ElanEvent>> {
    script
        .lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| ElanError::EventParse(format!("line {}: {}", n, e)))
        })
        .collect()
}

/// Feeds one event to the manager, updating the in-memory collaborators
/// that model the outside world.
pub fn apply(manager: &ElanManager, env: &InMemoryCollaborators, event: ElanEvent) -> Result<()> {
    match event {
        ElanEvent::CreateDomain(config) => manager.create_domain(config)?,
        ElanEvent::UpdateDomain(config) => manager.update_domain(config),
        ElanEvent::DeleteDomain { name } => manager.delete_domain(&name),
        ElanEvent::RegisterPort(port) => env.interfaces.insert(port),
        ElanEvent::UnregisterPort { name } => {
            env.interfaces.remove(&name);
        }
        ElanEvent::AddInterface { domain, port } => manager.add_interface(&domain, &port),
        ElanEvent::RemoveInterface { domain, port } => manager.remove_interface(&domain, &port),
        ElanEvent::UnknownSource(event) => manager.on_unknown_source(event),
        ElanEvent::MacAged { domain, mac } => manager.on_mac_aged(&domain, mac),
        ElanEvent::AddStaticMac { domain, mac, port } => manager.add_static_mac(&domain, mac, &port),
        ElanEvent::RemoveStaticMac { domain, mac } => manager.remove_static_mac(&domain, mac),
        ElanEvent::TunnelState { src, dst, up } => {
            env.tunnels.set_link(src, dst, up);
            manager.on_tunnel_state_changed(src, dst, up);
        }
        ElanEvent::AttachGateway { domain, device } => env.gateways.attach(&domain, device),
    }
    Ok(())
}
