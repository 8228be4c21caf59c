//! Structured group and flow descriptors handed to the switch programmer.
//!
//! The core never encodes table entries itself. It describes what a switch
//! must hold (flood groups and match/action rules), and a
//! [`SwitchProgrammer`](crate::interfaces::SwitchProgrammer) turns the
//! descriptors into the wire format of the underlying controller.

use crate::types::ElanDomain;
use elan_types::{DatapathId, MacAddress, SegmentKind};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type GroupId = u64;

/// First group id reserved for ELAN flood groups.
pub const ELAN_GID_BASE: GroupId = 200_000;

pub const SMAC_PRIORITY: u16 = 20;
pub const DMAC_PRIORITY: u16 = 20;
pub const DMAC_DROP_PRIORITY: u16 = 30;
pub const UNKNOWN_DMAC_PRIORITY: u16 = 10;
pub const TERMINATING_SERVICE_PRIORITY: u16 = 5;
pub const EXTERNAL_TUNNEL_PRIORITY: u16 = 5;

/// Id of the group flooding to the local ports of a segment.
pub fn local_group_id(segment_tag: u32) -> GroupId {
    ELAN_GID_BASE + (u64::from(segment_tag) % ELAN_GID_BASE) * 2
}

/// Id of the group flooding to the local group and all remote switches.
pub fn remote_group_id(segment_tag: u32) -> GroupId {
    local_group_id(segment_tag) + 1
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Output to a local port
    Output { port_tag: u32 },
    /// Continue processing in a group
    Group { id: GroupId },
    SetTunnelId { key: u64 },
    /// Output on the overlay tunnel toward another switch
    OutputTunnel { remote: DatapathId },
    /// Output toward a hardware gateway device
    OutputGateway { device: String },
    SetSegmentTag { tag: u32 },
    Drop,
}

/// One action list of a flood group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bucket {
    pub actions: Vec<Action>,
}

impl Bucket {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn output(port_tag: u32) -> Self {
        Self::new(vec![Action::Output { port_tag }])
    }

    pub fn to_group(id: GroupId) -> Self {
        Self::new(vec![Action::Group { id }])
    }

    /// Remote switch this bucket tunnels to, if any.
    pub fn tunnel_remote(&self) -> Option<DatapathId> {
        self.actions.iter().find_map(|action| match action {
            Action::OutputTunnel { remote } => Some(*remote),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Local,
    Remote,
}

/// A flood group of one domain segment on one switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub id: GroupId,
    pub domain: String,
    pub segment: SegmentKind,
    pub role: GroupRole,
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowTable {
    /// Source MAC "known" table; a miss punts the packet to the controller
    Smac,
    Dmac,
    /// Flood rules for destinations missing from `Dmac`
    UnknownDmac,
    /// Maps the tunnel key of overlay traffic to a segment tag
    TerminatingService,
    /// Maps the VNI of traffic from external VTEPs to a segment tag
    ExternalTunnel,
}

impl fmt::Display for FlowTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowTable::Smac => write!(f, "smac"),
            FlowTable::Dmac => write!(f, "dmac"),
            FlowTable::UnknownDmac => write!(f, "unknown-dmac"),
            FlowTable::TerminatingService => write!(f, "term-svc"),
            FlowTable::ExternalTunnel => write!(f, "ext-tunnel"),
        }
    }
}

/// Stable reference of a flow; installing a flow with an existing id
/// replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    pub fn smac(dpn: DatapathId, tag: u32, mac: &MacAddress) -> Self {
        Self(format!("{}:{}:{}:{}", FlowTable::Smac, dpn, tag, mac))
    }

    pub fn dmac(dpn: DatapathId, tag: u32, mac: &MacAddress) -> Self {
        Self(format!("{}:{}:{}:{}", FlowTable::Dmac, dpn, tag, mac))
    }

    pub fn unknown_dmac(dpn: DatapathId, tag: u32, from_tunnel: bool) -> Self {
        let origin = if from_tunnel { "tunnel" } else { "local" };
        Self(format!("{}:{}:{}:{}", FlowTable::UnknownDmac, dpn, tag, origin))
    }

    pub fn terminating_service(dpn: DatapathId, tunnel_key: u64) -> Self {
        Self(format!("{}:{}:{}", FlowTable::TerminatingService, dpn, tunnel_key))
    }

    pub fn external_tunnel(dpn: DatapathId, vni: u32) -> Self {
        Self(format!("{}:{}:{}", FlowTable::ExternalTunnel, dpn, vni))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowMatch {
    SegmentTag { tag: u32 },
    InPort { port_tag: u32 },
    SourceMac { mac: MacAddress },
    DestinationMac { mac: MacAddress },
    TunnelId { key: u64 },
    /// Packet arrived over an internal overlay tunnel
    FromTunnel,
    /// Packet arrived from an external VTEP
    FromExternalTunnel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDescriptor {
    pub id: FlowId,
    pub table: FlowTable,
    pub priority: u16,
    /// Zero means the flow never idles out
    pub idle_timeout_secs: u64,
    pub matches: Vec<FlowMatch>,
    pub actions: Vec<Action>,
}

/// Flows a switch holds for as long as it is a member of `domain`.
///
/// Per segment: two unknown-destination flood rules (local origin floods to
/// the remote group, tunnel origin to the local group) and a terminating
/// service rule. Vxlan domains with a VNI add an external tunnel rule.
pub fn switch_default_flows(domain: &ElanDomain, dpn: DatapathId) -> Vec<FlowDescriptor> {
    let mut flows = Vec::new();

    for segment in domain.segments() {
        let tag = domain.segment_tag(segment);
        flows.push(FlowDescriptor {
            id: FlowId::unknown_dmac(dpn, tag, false),
            table: FlowTable::UnknownDmac,
            priority: UNKNOWN_DMAC_PRIORITY,
            idle_timeout_secs: 0,
            matches: vec![FlowMatch::SegmentTag { tag }],
            actions: vec![Action::Group {
                id: remote_group_id(tag),
            }],
        });
        flows.push(FlowDescriptor {
            id: FlowId::unknown_dmac(dpn, tag, true),
            table: FlowTable::UnknownDmac,
            priority: UNKNOWN_DMAC_PRIORITY + 1,
            idle_timeout_secs: 0,
            matches: vec![FlowMatch::SegmentTag { tag }, FlowMatch::FromTunnel],
            actions: vec![Action::Group {
                id: local_group_id(tag),
            }],
        });

        let key = domain.tunnel_key(segment);
        flows.push(FlowDescriptor {
            id: FlowId::terminating_service(dpn, key),
            table: FlowTable::TerminatingService,
            priority: TERMINATING_SERVICE_PRIORITY,
            idle_timeout_secs: 0,
            matches: vec![FlowMatch::TunnelId { key }, FlowMatch::FromTunnel],
            actions: vec![Action::SetSegmentTag { tag }],
        });
    }

    if let Some(vni) = domain.vni() {
        flows.push(FlowDescriptor {
            id: FlowId::external_tunnel(dpn, vni),
            table: FlowTable::ExternalTunnel,
            priority: EXTERNAL_TUNNEL_PRIORITY,
            idle_timeout_secs: 0,
            matches: vec![
                FlowMatch::TunnelId {
                    key: u64::from(vni),
                },
                FlowMatch::FromExternalTunnel,
            ],
            actions: vec![Action::SetSegmentTag { tag: domain.tag }],
        });
    }

    flows
}

/// Ids of the flood groups a member switch holds for `domain`.
pub fn switch_group_ids(domain: &ElanDomain) -> Vec<GroupId> {
    domain
        .segments()
        .into_iter()
        .flat_map(|segment| {
            let tag = domain.segment_tag(segment);
            [local_group_id(tag), remote_group_id(tag)]
        })
        .collect()
}
