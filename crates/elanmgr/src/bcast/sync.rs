//! Local and remote flood group computation.

use crate::error::Result;
use crate::interfaces::{GatewayBucketSupplier, InterfaceRegistry, SwitchProgrammer, TunnelResolver};
use crate::membership::MembershipStore;
use crate::programming::{
    local_group_id, remote_group_id, switch_group_ids, Bucket, GroupDescriptor, GroupRole,
};
use crate::types::{ElanDomain, PortDescriptor};
use elan_types::{DatapathId, EtreeRole, SegmentKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Local flood buckets of a segment: one per forwarding, non-external port
/// in membership order. The leaf segment floods to root ports only.
pub fn local_buckets(segment: SegmentKind, ports: &[PortDescriptor]) -> Vec<Bucket> {
    ports
        .iter()
        .filter(|port| !port.external && port.is_forwarding())
        .filter(|port| segment == SegmentKind::Base || port.etree_role == EtreeRole::Root)
        .map(|port| Bucket::output(port.port_tag))
        .collect()
}

/// Rebuilds flood groups from the current membership snapshot.
///
/// Every computation starts from stored state, so repeating a sync with no
/// membership change in between yields identical groups.
pub struct BroadcastGroupSync {
    membership: Arc<MembershipStore>,
    registry: Arc<dyn InterfaceRegistry>,
    tunnels: Arc<dyn TunnelResolver>,
    gateways: Arc<dyn GatewayBucketSupplier>,
    switch: Arc<dyn SwitchProgrammer>,
    settle_delay: Duration,
}

impl BroadcastGroupSync {
    pub fn new(
        membership: Arc<MembershipStore>,
        registry: Arc<dyn InterfaceRegistry>,
        tunnels: Arc<dyn TunnelResolver>,
        gateways: Arc<dyn GatewayBucketSupplier>,
        switch: Arc<dyn SwitchProgrammer>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            membership,
            registry,
            tunnels,
            gateways,
            switch,
            settle_delay,
        }
    }

    /// Pause letting group-to-group references land in order on the switch.
    pub async fn settle(&self) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    /// Descriptors of the real member ports of `domain` on `dpn`.
    ///
    /// Ports missing from the registry, or registered on another switch,
    /// are skipped; they are expected while topology churns.
    async fn member_ports(&self, domain: &ElanDomain, dpn: DatapathId) -> Result<Vec<PortDescriptor>> {
        let Some(entry) = self.membership.entry(&domain.name, dpn).await? else {
            return Ok(Vec::new());
        };

        let mut ports = Vec::with_capacity(entry.ports.len());
        for name in &entry.ports {
            if self.membership.is_placeholder(&domain.name, name) {
                continue;
            }
            match self.registry.port(name) {
                Some(port) if port.dpn == dpn => ports.push(port),
                Some(port) => {
                    debug!(domain = %domain.name, port = %name, registered = %port.dpn, %dpn,
                        "Member port registered on another switch, skipping");
                }
                None => debug!(domain = %domain.name, port = %name, "Member port unknown, skipping"),
            }
        }
        Ok(ports)
    }

    pub async fn compute_local_group(
        &self,
        domain: &ElanDomain,
        dpn: DatapathId,
        segment: SegmentKind,
    ) -> Result<GroupDescriptor> {
        let ports = self.member_ports(domain, dpn).await?;
        Ok(GroupDescriptor {
            id: local_group_id(domain.segment_tag(segment)),
            domain: domain.name.clone(),
            segment,
            role: GroupRole::Local,
            buckets: local_buckets(segment, &ports),
        })
    }

    pub async fn compute_remote_group(
        &self,
        domain: &ElanDomain,
        dpn: DatapathId,
        segment: SegmentKind,
    ) -> Result<GroupDescriptor> {
        let tag = domain.segment_tag(segment);
        let mut buckets = Vec::new();

        let local = self.compute_local_group(domain, dpn, segment).await?;
        if !local.buckets.is_empty() {
            buckets.push(Bucket::to_group(local.id));
        }

        let key = domain.tunnel_key(segment);
        for other in self.membership.member_switches(&domain.name).await? {
            if other == dpn {
                continue;
            }
            match self.tunnels.egress_actions(dpn, other, key) {
                Some(actions) => buckets.push(Bucket::new(actions)),
                None => debug!(domain = %domain.name, %dpn, remote = %other, "No tunnel to member switch"),
            }
        }

        buckets.extend(self.gateways.gateway_buckets(domain, segment));

        Ok(GroupDescriptor {
            id: remote_group_id(tag),
            domain: domain.name.clone(),
            segment,
            role: GroupRole::Remote,
            buckets,
        })
    }

    /// Installs `group`, or withdraws it from the switch when it has no
    /// buckets left.
    async fn install_or_withdraw(&self, dpn: DatapathId, group: GroupDescriptor) -> Result<Option<GroupDescriptor>> {
        if group.buckets.is_empty() {
            debug!(domain = %group.domain, %dpn, group = group.id, "Group has no buckets, withdrawing");
            self.switch.remove_group(dpn, group.id).await?;
            return Ok(None);
        }
        self.switch.install_group(dpn, group.clone()).await?;
        Ok(Some(group))
    }

    /// Rebuilds the local flood group of every segment on `dpn`.
    ///
    /// Returns the groups installed.
    pub async fn sync_local_group(&self, domain: &ElanDomain, dpn: DatapathId) -> Result<Vec<GroupDescriptor>> {
        let mut installed = Vec::new();
        for segment in domain.segments() {
            let group = self.compute_local_group(domain, dpn, segment).await?;
            installed.extend(self.install_or_withdraw(dpn, group).await?);
        }
        Ok(installed)
    }

    /// Rebuilds the remote flood group of every segment on `dpn`.
    pub async fn sync_remote_group(&self, domain: &ElanDomain, dpn: DatapathId) -> Result<Vec<GroupDescriptor>> {
        let mut installed = Vec::new();
        for segment in domain.segments() {
            let group = self.compute_remote_group(domain, dpn, segment).await?;
            installed.extend(self.install_or_withdraw(dpn, group).await?);
        }
        Ok(installed)
    }

    /// Rebuilds both groups of `dpn` after its port set changed.
    ///
    /// Non-empty local groups land before the remote groups that reference
    /// them; emptied local groups are withdrawn only after the remote groups
    /// have dropped them.
    pub async fn resync_switch(&self, domain: &ElanDomain, dpn: DatapathId) -> Result<()> {
        let mut emptied = Vec::new();
        for segment in domain.segments() {
            let group = self.compute_local_group(domain, dpn, segment).await?;
            if group.buckets.is_empty() {
                emptied.push(group);
            } else {
                self.switch.install_group(dpn, group).await?;
            }
        }
        self.sync_remote_group(domain, dpn).await?;
        for group in emptied {
            self.install_or_withdraw(dpn, group).await?;
        }
        Ok(())
    }

    /// Recomputes the remote groups of every member switch except `exclude`.
    ///
    /// Returns the number of switches re-synced.
    pub async fn sync_all_other_switches(&self, domain: &ElanDomain, exclude: DatapathId) -> Result<usize> {
        let mut synced = 0;
        for dpn in self.membership.member_switches(&domain.name).await? {
            if dpn == exclude {
                continue;
            }
            self.sync_remote_group(domain, dpn).await?;
            synced += 1;
        }
        info!(domain = %domain.name, %exclude, synced, "Re-synced remote groups of other member switches");
        Ok(synced)
    }

    /// Removes every flood group of `domain` from `dpn`.
    pub async fn remove_groups(&self, domain: &ElanDomain, dpn: DatapathId) -> Result<()> {
        for id in switch_group_ids(domain) {
            self.switch.remove_group(dpn, id).await?;
        }
        Ok(())
    }
}
