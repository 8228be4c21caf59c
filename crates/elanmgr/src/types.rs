//! Records owned by the ELAN manager.

use chrono::{DateTime, Utc};
use elan_types::{AdminState, DatapathId, EtreeRole, MacAddress, OperState, SegmentKind, SegmentationType};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// An ELAN instance: one logical broadcast domain spanning many switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElanDomain {
    pub name: String,
    /// Dense id used for dataplane metadata matching
    pub tag: u32,
    pub segmentation: SegmentationType,
    /// VNI for vxlan, VLAN id for vlan
    pub segmentation_id: Option<u32>,
    pub mac_timeout_secs: u64,
    /// Second tag for leaf-originated traffic; present iff the domain is etree
    pub leaf_tag: Option<u32>,
}

impl ElanDomain {
    pub fn is_etree(&self) -> bool {
        self.leaf_tag.is_some()
    }

    /// Segments every group and flow is computed for.
    pub fn segments(&self) -> Vec<SegmentKind> {
        if self.is_etree() {
            vec![SegmentKind::Base, SegmentKind::Leaf]
        } else {
            vec![SegmentKind::Base]
        }
    }

    /// Metadata tag of a segment. `Leaf` falls back to the base tag for
    /// plain domains.
    pub fn segment_tag(&self, segment: SegmentKind) -> u32 {
        match segment {
            SegmentKind::Base => self.tag,
            SegmentKind::Leaf => self.leaf_tag.unwrap_or(self.tag),
        }
    }

    /// Key carried in the tunnel header for traffic of a segment.
    ///
    /// Vxlan domains use their VNI on the base segment so that external
    /// VTEPs can interoperate; everything else is keyed by tag.
    pub fn tunnel_key(&self, segment: SegmentKind) -> u64 {
        match (segment, self.segmentation, self.segmentation_id) {
            (SegmentKind::Base, SegmentationType::Vxlan, Some(vni)) => u64::from(vni),
            _ => u64::from(self.segment_tag(segment)),
        }
    }

    /// VNI of a vxlan domain.
    pub fn vni(&self) -> Option<u32> {
        if self.segmentation.is_vxlan() {
            self.segmentation_id
        } else {
            None
        }
    }

    /// Segment the traffic of a port with `role` enters on.
    pub fn segment_for_role(&self, role: EtreeRole) -> SegmentKind {
        if self.is_etree() && role.is_leaf() {
            SegmentKind::Leaf
        } else {
            SegmentKind::Base
        }
    }
}

/// Requested configuration of a domain, as supplied by the northbound API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    #[serde(default)]
    pub segmentation: SegmentationType,
    #[serde(default)]
    pub segmentation_id: Option<u32>,
    /// Falls back to `domains.default_mac_timeout_secs` when unset
    #[serde(default)]
    pub mac_timeout_secs: Option<u64>,
    #[serde(default)]
    pub etree: bool,
}

impl DomainConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            segmentation: SegmentationType::Flat,
            segmentation_id: None,
            mac_timeout_secs: None,
            etree: false,
        }
    }

    pub fn vxlan(name: impl Into<String>, vni: u32) -> Self {
        Self {
            segmentation: SegmentationType::Vxlan,
            segmentation_id: Some(vni),
            ..Self::new(name)
        }
    }

    pub fn with_etree(mut self) -> Self {
        self.etree = true;
        self
    }

    pub fn with_mac_timeout(mut self, secs: u64) -> Self {
        self.mac_timeout_secs = Some(secs);
        self
    }
}

/// Interface as known to the port registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub name: String,
    pub dpn: DatapathId,
    /// Dataplane port number used for output actions and packet-in metadata
    pub port_tag: u32,
    /// Ports described without states are taken as up
    #[serde(default = "default_admin")]
    pub admin: AdminState,
    #[serde(default = "default_oper")]
    pub oper: OperState,
    /// Provider/trunk port; never flooded to locally and never learned on
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub etree_role: EtreeRole,
    #[serde(default)]
    pub static_macs: Vec<MacAddress>,
}

fn default_admin() -> AdminState {
    AdminState::Up
}

fn default_oper() -> OperState {
    OperState::Up
}

impl PortDescriptor {
    pub fn new(name: impl Into<String>, dpn: DatapathId, port_tag: u32) -> Self {
        Self {
            name: name.into(),
            dpn,
            port_tag,
            admin: AdminState::Up,
            oper: OperState::Up,
            external: false,
            etree_role: EtreeRole::None,
            static_macs: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: EtreeRole) -> Self {
        self.etree_role = role;
        self
    }

    pub fn with_external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    pub fn with_oper(mut self, oper: OperState) -> Self {
        self.oper = oper;
        self
    }

    pub fn with_static_mac(mut self, mac: MacAddress) -> Self {
        self.static_macs.push(mac);
        self
    }

    pub fn is_forwarding(&self) -> bool {
        self.admin.is_up() && self.oper.is_up()
    }
}

/// Ports of one domain on one switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub domain: String,
    pub dpn: DatapathId,
    /// Member ports in insertion order
    pub ports: Vec<String>,
}

impl MembershipEntry {
    pub fn new(domain: impl Into<String>, dpn: DatapathId) -> Self {
        Self {
            domain: domain.into(),
            dpn,
            ports: Vec::new(),
        }
    }

    pub fn contains(&self, port: &str) -> bool {
        self.ports.iter().any(|p| p == port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MacKind {
    Dynamic,
    Static,
}

/// Owner of a MAC address within a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacEntry {
    pub domain: String,
    pub mac: MacAddress,
    pub port: String,
    pub dpn: DatapathId,
    pub kind: MacKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ip: Option<IpAddr>,
}

impl MacEntry {
    pub fn is_static(&self) -> bool {
        self.kind == MacKind::Static
    }
}
