//! Forwarding rules derived from MAC ownership.

use crate::error::Result;
use crate::interfaces::{InterfaceRegistry, SwitchProgrammer, TunnelResolver};
use crate::mac::{MacTable, MacTransition};
use crate::membership::MembershipStore;
use crate::programming::{
    Action, FlowDescriptor, FlowId, FlowMatch, FlowTable, DMAC_DROP_PRIORITY, DMAC_PRIORITY,
    SMAC_PRIORITY,
};
use crate::types::{ElanDomain, MacEntry, PortDescriptor};
use crate::keys::mac_switch_key;
use elan_orch_common::{JobCoordinator, JobError};
use elan_types::{DatapathId, EtreeRole, MacAddress, SegmentKind};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// What a switch was left holding for one MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchMacState {
    /// Source rule and local destination rules (owning switch)
    Local,
    /// Remote destination rules toward the owning switch
    Remote,
    /// No rule for the MAC
    Removed,
}

/// Source MAC "known" rule on the owning switch. Dynamic entries idle out
/// after the domain aging timeout.
pub fn smac_flow(domain: &ElanDomain, entry: &MacEntry, port: &PortDescriptor) -> FlowDescriptor {
    let segment = domain.segment_for_role(port.etree_role);
    FlowDescriptor {
        id: FlowId::smac(entry.dpn, domain.tag, &entry.mac),
        table: FlowTable::Smac,
        priority: SMAC_PRIORITY,
        idle_timeout_secs: if entry.is_static() {
            0
        } else {
            domain.mac_timeout_secs
        },
        matches: vec![
            FlowMatch::SegmentTag {
                tag: domain.segment_tag(segment),
            },
            FlowMatch::InPort {
                port_tag: port.port_tag,
            },
            FlowMatch::SourceMac { mac: entry.mac },
        ],
        actions: Vec::new(),
    }
}

fn dmac_flow(
    domain: &ElanDomain,
    dpn: DatapathId,
    segment: SegmentKind,
    mac: &MacAddress,
    actions: Vec<Action>,
) -> FlowDescriptor {
    let tag = domain.segment_tag(segment);
    let priority = if actions == [Action::Drop] {
        DMAC_DROP_PRIORITY
    } else {
        DMAC_PRIORITY
    };
    FlowDescriptor {
        id: FlowId::dmac(dpn, tag, mac),
        table: FlowTable::Dmac,
        priority,
        idle_timeout_secs: 0,
        matches: vec![
            FlowMatch::SegmentTag { tag },
            FlowMatch::DestinationMac { mac: *mac },
        ],
        actions,
    }
}

/// Leaf-to-leaf traffic is dropped: a leaf-owned MAC is unreachable from
/// the leaf segment.
fn blocked(segment: SegmentKind, owner_role: EtreeRole) -> bool {
    segment == SegmentKind::Leaf && owner_role.is_leaf()
}

/// Destination rules on the owning switch, one per segment.
pub fn local_dmac_flows(domain: &ElanDomain, entry: &MacEntry, port: &PortDescriptor) -> Vec<FlowDescriptor> {
    domain
        .segments()
        .into_iter()
        .map(|segment| {
            let actions = if blocked(segment, port.etree_role) {
                vec![Action::Drop]
            } else {
                vec![Action::Output {
                    port_tag: port.port_tag,
                }]
            };
            dmac_flow(domain, entry.dpn, segment, &entry.mac, actions)
        })
        .collect()
}

/// Applies MAC ownership to individual switches.
pub struct MacFlowProgrammer {
    table: Arc<MacTable>,
    membership: Arc<MembershipStore>,
    registry: Arc<dyn InterfaceRegistry>,
    tunnels: Arc<dyn TunnelResolver>,
    switch: Arc<dyn SwitchProgrammer>,
}

impl MacFlowProgrammer {
    pub fn new(
        table: Arc<MacTable>,
        membership: Arc<MembershipStore>,
        registry: Arc<dyn InterfaceRegistry>,
        tunnels: Arc<dyn TunnelResolver>,
        switch: Arc<dyn SwitchProgrammer>,
    ) -> Self {
        Self {
            table,
            membership,
            registry,
            tunnels,
            switch,
        }
    }

    /// Brings `dpn` in line with the current owner of `mac`.
    ///
    /// The owning switch gets the source rule and local destination rules,
    /// other member switches get remote destination rules, and every other
    /// switch is cleared. The decision is made from stored state, so a late
    /// or repeated call converges instead of undoing newer work.
    pub async fn program_switch(
        &self,
        domain: &ElanDomain,
        mac: MacAddress,
        dpn: DatapathId,
    ) -> Result<SwitchMacState> {
        let entry = self.table.lookup(&domain.name, &mac).await?;

        let Some(entry) = entry else {
            self.remove_on(domain, mac, dpn).await?;
            return Ok(SwitchMacState::Removed);
        };

        let Some(owner) = self.registry.port(&entry.port) else {
            debug!(domain = %domain.name, %mac, port = %entry.port, "Owning port unknown, clearing rules");
            self.remove_on(domain, mac, dpn).await?;
            return Ok(SwitchMacState::Removed);
        };

        if entry.dpn == dpn {
            self.switch.install_flow(dpn, smac_flow(domain, &entry, &owner)).await?;
            for flow in local_dmac_flows(domain, &entry, &owner) {
                self.switch.install_flow(dpn, flow).await?;
            }
            return Ok(SwitchMacState::Local);
        }

        if !self.membership.is_member_switch(&domain.name, dpn).await? {
            self.remove_on(domain, mac, dpn).await?;
            return Ok(SwitchMacState::Removed);
        }

        self.switch
            .remove_flow(dpn, FlowId::smac(dpn, domain.tag, &mac))
            .await?;
        for segment in domain.segments() {
            let actions = if blocked(segment, owner.etree_role) {
                Some(vec![Action::Drop])
            } else {
                self.tunnels
                    .egress_actions(dpn, entry.dpn, domain.tunnel_key(segment))
            };
            match actions {
                Some(actions) => {
                    self.switch
                        .install_flow(dpn, dmac_flow(domain, dpn, segment, &mac, actions))
                        .await?
                }
                None => {
                    debug!(domain = %domain.name, %mac, %dpn, owner = %entry.dpn, "Owning switch unreachable");
                    self.switch
                        .remove_flow(dpn, FlowId::dmac(dpn, domain.segment_tag(segment), &mac))
                        .await?
                }
            }
        }
        Ok(SwitchMacState::Remote)
    }

    /// Queues [`program_switch`](Self::program_switch) for each switch in
    /// `dpns`, keyed per (domain, mac, switch).
    pub fn schedule(
        self: &Arc<Self>,
        jobs: &JobCoordinator,
        domain: &ElanDomain,
        mac: MacAddress,
        dpns: impl IntoIterator<Item = DatapathId>,
    ) {
        let dpns: BTreeSet<DatapathId> = dpns.into_iter().collect();
        for dpn in dpns {
            let programmer = Arc::clone(self);
            let domain = domain.clone();
            jobs.enqueue(mac_switch_key(&domain.name, &mac, dpn), "program-mac", move || {
                let programmer = Arc::clone(&programmer);
                let domain = domain.clone();
                async move {
                    programmer
                        .program_switch(&domain, mac, dpn)
                        .await
                        .map(|_| ())
                        .map_err(JobError::from)
                }
            });
        }
    }

    /// Schedules programming on every switch a table change affects: the
    /// member switches plus the new and the displaced owner.
    pub async fn schedule_transition(
        self: &Arc<Self>,
        jobs: &JobCoordinator,
        domain: &ElanDomain,
        mac: MacAddress,
        transition: &MacTransition,
    ) -> Result<()> {
        if !transition.is_change() {
            return Ok(());
        }
        let mut dpns = self.membership.member_switches(&domain.name).await?;
        dpns.extend(transition.current().map(|entry| entry.dpn));
        dpns.extend(transition.displaced().map(|entry| entry.dpn));
        self.schedule(jobs, domain, mac, dpns);
        Ok(())
    }

    /// Removes every rule for `mac` from `dpn`.
    pub async fn remove_on(&self, domain: &ElanDomain, mac: MacAddress, dpn: DatapathId) -> Result<()> {
        self.switch
            .remove_flow(dpn, FlowId::smac(dpn, domain.tag, &mac))
            .await?;
        for segment in domain.segments() {
            self.switch
                .remove_flow(dpn, FlowId::dmac(dpn, domain.segment_tag(segment), &mac))
                .await?;
        }
        Ok(())
    }
}
