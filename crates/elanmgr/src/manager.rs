//! ELAN manager: wires the components together and owns the job flows.
//!
//! Every public entry point submits a keyed job and returns immediately.
//! Domain lifecycle, switch join and switch leave run under the domain key;
//! interface add/remove under the port key; MAC ownership decisions under
//! the (domain, mac) key; per-switch MAC rule programming under the
//! (domain, mac, switch) key.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::bcast::BroadcastGroupSync;
use crate::config::ElanConfig;
use crate::domain::{Admission, DomainRegistry, InterfaceOp, PendingInterface};
use crate::error::{ElanError, Result};
use crate::interfaces::{
    Clock, ElanStore, GatewayBucketSupplier, InterfaceRegistry, StoreOp, SwitchProgrammer,
    TagAllocator, TunnelResolver,
};
use crate::keys::{domain_key, mac_key, port_key};
use crate::learning::{LearningStatsSnapshot, PacketLearner, UnknownSourceEvent};
use crate::mac::{MacFlowProgrammer, MacTable};
use crate::membership::MembershipStore;
use crate::programming::switch_default_flows;
use crate::types::{DomainConfig, ElanDomain};
use elan_orch_common::{JobCoordinator, JobError, JobStatsSnapshot};
use elan_types::{DatapathId, MacAddress};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// External systems the manager talks to.
#[derive(Clone)]
pub struct ElanCollaborators {
    pub store: Arc<dyn ElanStore>,
    pub switch: Arc<dyn SwitchProgrammer>,
    pub tunnels: Arc<dyn TunnelResolver>,
    pub interfaces: Arc<dyn InterfaceRegistry>,
    pub gateways: Arc<dyn GatewayBucketSupplier>,
    pub tags: Arc<dyn TagAllocator>,
    pub clock: Arc<dyn Clock>,
}

/// Allocator key of the leaf tag of an etree domain.
pub fn leaf_tag_key(domain: &str) -> String {
    format!("{}_leaves", domain)
}

struct Inner {
    config: ElanConfig,
    store: Arc<dyn ElanStore>,
    switch: Arc<dyn SwitchProgrammer>,
    interfaces: Arc<dyn InterfaceRegistry>,
    tags: Arc<dyn TagAllocator>,
    domains: Arc<DomainRegistry>,
    membership: Arc<MembershipStore>,
    groups: BroadcastGroupSync,
    table: Arc<MacTable>,
    flows: Arc<MacFlowProgrammer>,
    learner: Arc<PacketLearner>,
    jobs: JobCoordinator,
}

/// Control-plane core of the ELAN service.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct ElanManager {
    inner: Arc<Inner>,
}

impl ElanManager {
    /// Builds the manager. Must be called from within a tokio runtime.
    pub fn new(config: ElanConfig, collaborators: ElanCollaborators) -> Self {
        let ElanCollaborators {
            store,
            switch,
            tunnels,
            interfaces,
            gateways,
            tags,
            clock,
        } = collaborators;

        let jobs = JobCoordinator::new(config.job_config());
        let domains = Arc::new(DomainRegistry::new(config.domains.max_pending_interfaces));
        let membership = Arc::new(MembershipStore::new(
            store.clone(),
            config.membership.placeholder_ports.clone(),
        ));
        let groups = BroadcastGroupSync::new(
            membership.clone(),
            interfaces.clone(),
            tunnels.clone(),
            gateways,
            switch.clone(),
            config.settle_delay(),
        );
        let table = Arc::new(MacTable::new(store.clone(), clock.clone()));
        let flows = Arc::new(MacFlowProgrammer::new(
            table.clone(),
            membership.clone(),
            interfaces.clone(),
            tunnels,
            switch.clone(),
        ));
        let learner = Arc::new(PacketLearner::new(
            domains.clone(),
            interfaces.clone(),
            membership.clone(),
            table.clone(),
            flows.clone(),
            clock,
            jobs.clone(),
            config.anti_churn_window(),
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                switch,
                interfaces,
                tags,
                domains,
                membership,
                groups,
                table,
                flows,
                learner,
                jobs,
            }),
        }
    }

    /// Reactivates the domains persisted in the store.
    ///
    /// Returns the number of domains restored.
    pub async fn restore(&self) -> Result<usize> {
        let domains = self.inner.store.domains().await?;
        for domain in &domains {
            let pending = self.inner.domains.activate(domain.clone());
            for event in pending {
                self.inner.submit_interface(&domain.name, event);
            }
        }
        info!(domains = domains.len(), "Restored domains from store");
        Ok(domains.len())
    }

    /// Creates a domain. Tag allocation and persistence run as a job;
    /// interface events arriving meanwhile are parked.
    pub fn create_domain(&self, config: DomainConfig) -> Result<()> {
        if config.name.is_empty() {
            return Err(ElanError::InvalidDomain("empty domain name".to_string()));
        }
        if config.segmentation.is_vxlan() && config.segmentation_id.is_none() {
            return Err(ElanError::InvalidDomain(format!(
                "vxlan domain {} has no VNI",
                config.name
            )));
        }

        if self.inner.domains.begin(&config.name).is_some() {
            debug!(domain = %config.name, "Domain already active");
            return Ok(());
        }

        self.inner
            .submit(domain_key(&config.name), "create-domain", move |inner| {
                let config = config.clone();
                async move { inner.activate_domain(&config).await }
            });
        Ok(())
    }

    /// Applies a configuration update. Only the MAC aging timeout may
    /// change after creation.
    pub fn update_domain(&self, config: DomainConfig) {
        self.inner
            .submit(domain_key(&config.name), "update-domain", move |inner| {
                let config = config.clone();
                async move { inner.update_domain(&config).await }
            });
    }

    /// Tears a domain down: members, MAC entries, tags and the record.
    pub fn delete_domain(&self, name: &str) {
        let name = name.to_string();
        self.inner
            .submit(domain_key(&name), "delete-domain", move |inner| {
                let name = name.clone();
                async move { inner.delete_domain(&name).await }
            });
    }

    pub fn add_interface(&self, domain: &str, port: &str) {
        self.inner
            .admit_interface(domain, PendingInterface::add(port));
    }

    pub fn remove_interface(&self, domain: &str, port: &str) {
        self.inner
            .admit_interface(domain, PendingInterface::remove(port));
    }

    pub fn add_static_mac(&self, domain: &str, mac: MacAddress, port: &str) {
        let (domain, port) = (domain.to_string(), port.to_string());
        self.inner
            .submit(mac_key(&domain, &mac), "add-static-mac", move |inner| {
                let (domain, port) = (domain.clone(), port.clone());
                async move { inner.static_mac_added(&domain, mac, &port).await }
            });
    }

    pub fn remove_static_mac(&self, domain: &str, mac: MacAddress) {
        let domain = domain.to_string();
        self.inner
            .submit(mac_key(&domain, &mac), "remove-static-mac", move |inner| {
                let domain = domain.clone();
                async move { inner.static_mac_removed(&domain, mac).await }
            });
    }

    /// Handles a switch report that the source rule of `mac` idled out.
    pub fn on_mac_aged(&self, domain: &str, mac: MacAddress) {
        let domain = domain.to_string();
        self.inner
            .submit(mac_key(&domain, &mac), "age-mac", move |inner| {
                let domain = domain.clone();
                async move { inner.mac_aged(&domain, mac).await }
            });
    }

    pub fn on_unknown_source(&self, event: UnknownSourceEvent) {
        self.inner.learner.on_unknown_source(event);
    }

    /// Repairs remote groups and MAC rules of every domain spanning both
    /// ends of a tunnel whose state changed.
    pub fn on_tunnel_state_changed(&self, src: DatapathId, dst: DatapathId, up: bool) {
        info!(%src, %dst, up, "Tunnel state changed");
        for domain in self.inner.domains.active_domains() {
            let name = domain.name;
            self.inner
                .submit(domain_key(&name), "tunnel-state", move |inner| {
                    let name = name.clone();
                    async move { inner.tunnel_changed(&name, src, dst).await }
                });
        }
    }

    /// Resolves once every submitted job, including cascades, has finished.
    pub async fn wait_idle(&self) {
        self.inner.jobs.wait_idle().await;
    }

    pub fn job_stats(&self) -> JobStatsSnapshot {
        self.inner.jobs.stats()
    }

    pub fn learning_stats(&self) -> LearningStatsSnapshot {
        self.inner.learner.stats()
    }

    pub fn domain(&self, name: &str) -> Option<ElanDomain> {
        self.inner.domains.active(name)
    }

    pub fn domains(&self) -> &DomainRegistry {
        &self.inner.domains
    }

    pub fn membership(&self) -> &MembershipStore {
        &self.inner.membership
    }

    pub fn mac_table(&self) -> &MacTable {
        &self.inner.table
    }

    pub fn config(&self) -> &ElanConfig {
        &self.inner.config
    }
}

impl Inner {
    /// Enqueues `job` under `key`. The job receives the manager state and
    /// its errors are classified for the retry layer.
    fn submit<F, Fut>(self: &Arc<Self>, key: String, name: &'static str, job: F)
    where
        F: Fn(Arc<Inner>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let inner = Arc::clone(self);
        self.jobs.enqueue(key, name, move || {
            let run = job(Arc::clone(&inner));
            async move { run.await.map_err(JobError::from) }
        });
    }

    fn admit_interface(self: &Arc<Self>, domain: &str, event: PendingInterface) {
        match self.domains.admit(domain, event.clone()) {
            Admission::Active(_) => self.submit_interface(domain, event),
            Admission::Deferred => {
                debug!(domain, port = %event.port, op = ?event.op, "Domain has no tag yet, interface event parked");
            }
        }
    }

    fn submit_interface(self: &Arc<Self>, domain: &str, event: PendingInterface) {
        let domain = domain.to_string();
        let port = event.port;
        let key = port_key(&port);
        match event.op {
            InterfaceOp::Add => self.submit(key, "add-interface", move |inner| {
                let (domain, port) = (domain.clone(), port.clone());
                async move { inner.port_added(&domain, &port).await }
            }),
            InterfaceOp::Remove => self.submit(key, "remove-interface", move |inner| {
                let (domain, port) = (domain.clone(), port.clone());
                async move { inner.port_removed(&domain, &port).await }
            }),
        }
    }

    async fn activate_domain(self: &Arc<Self>, config: &DomainConfig) -> Result<()> {
        if self.domains.active(&config.name).is_some() {
            return Ok(());
        }

        let pool = &self.config.domains.tag_pool_name;
        let tag = self.tags.allocate(pool, &config.name)?;
        let leaf_tag = if config.etree {
            Some(self.tags.allocate(pool, &leaf_tag_key(&config.name))?)
        } else {
            None
        };

        let domain = ElanDomain {
            name: config.name.clone(),
            tag,
            segmentation: config.segmentation,
            segmentation_id: config.segmentation_id,
            mac_timeout_secs: config
                .mac_timeout_secs
                .unwrap_or(self.config.domains.default_mac_timeout_secs),
            leaf_tag,
        };
        self.store
            .commit(vec![StoreOp::PutDomain(domain.clone())])
            .await?;

        let pending = self.domains.activate(domain.clone());
        info!(domain = %domain.name, tag, ?leaf_tag, pending = pending.len(), "Domain active");
        audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "ElanManager", "create_domain")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(domain.name.clone())
            .with_object_type("elan_domain")
            .with_details(serde_json::json!({
                "tag": tag,
                "leaf_tag": leaf_tag,
                "segmentation": domain.segmentation.to_string(),
                "segmentation_id": domain.segmentation_id,
            })));

        for event in pending {
            self.submit_interface(&domain.name, event);
        }
        Ok(())
    }

    async fn update_domain(self: &Arc<Self>, config: &DomainConfig) -> Result<()> {
        let Some(current) = self.domains.active(&config.name) else {
            warn!(domain = %config.name, "Update for inactive domain ignored");
            return Ok(());
        };

        if config.segmentation != current.segmentation
            || config.segmentation_id != current.segmentation_id
            || config.etree != current.is_etree()
        {
            warn!(domain = %config.name, "Segmentation and etree mode are immutable, ignoring change");
            audit_log!(AuditRecord::new(AuditCategory::ResourceModify, "ElanManager", "update_domain")
                .with_outcome(AuditOutcome::Denied)
                .with_object_id(config.name.clone())
                .with_object_type("elan_domain")
                .with_error("immutable attribute change"));
        }

        let timeout = config
            .mac_timeout_secs
            .unwrap_or(self.config.domains.default_mac_timeout_secs);
        if timeout == current.mac_timeout_secs {
            return Ok(());
        }

        let updated = ElanDomain {
            mac_timeout_secs: timeout,
            ..current.clone()
        };
        self.store
            .commit(vec![StoreOp::PutDomain(updated.clone())])
            .await?;
        self.domains.update(updated.clone());

        // Source rules carry the idle timeout; reinstall them on the owners
        for entry in self.table.entries(&updated.name).await? {
            if !entry.is_static() {
                self.flows
                    .schedule(&self.jobs, &updated, entry.mac, [entry.dpn]);
            }
        }

        audit_log!(AuditRecord::new(AuditCategory::ResourceModify, "ElanManager", "update_domain")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(updated.name.clone())
            .with_object_type("elan_domain")
            .with_details(serde_json::json!({
                "mac_timeout_secs": {"from": current.mac_timeout_secs, "to": timeout},
            })));
        Ok(())
    }

    async fn delete_domain(self: &Arc<Self>, name: &str) -> Result<()> {
        let Some(domain) = self.domains.active(name) else {
            if self.domains.remove(name).is_some() {
                info!(domain = name, "Dropped domain awaiting its tag");
            }
            return Ok(());
        };

        let holders = self.membership.member_switches(name).await?;

        for entry in self.membership.entries(name).await? {
            for port in &entry.ports {
                self.membership.remove_member(name, entry.dpn, port).await?;
            }
            if holders.contains(&entry.dpn) {
                self.clear_switch(&domain, entry.dpn).await?;
            }
        }

        for entry in self.table.entries(name).await? {
            self.table.delete(name, entry.mac).await?;
            for dpn in holders.iter().copied().chain([entry.dpn]) {
                self.flows.remove_on(&domain, entry.mac, dpn).await?;
            }
        }

        let pool = &self.config.domains.tag_pool_name;
        self.tags.release(pool, name)?;
        if domain.leaf_tag.is_some() {
            self.tags.release(pool, &leaf_tag_key(name))?;
        }

        self.store
            .commit(vec![StoreOp::DeleteDomain(name.to_string())])
            .await?;
        self.domains.remove(name);
        self.membership.forget(name);

        info!(domain = name, switches = holders.len(), "Domain deleted");
        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "ElanManager", "delete_domain")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(name.to_string())
            .with_object_type("elan_domain"));
        Ok(())
    }

    async fn port_added(self: &Arc<Self>, domain: &str, port: &str) -> Result<()> {
        let Some(domain) = self.domains.active(domain) else {
            debug!(domain, port, "Domain gone, skipping interface add");
            return Ok(());
        };
        let Some(port) = self.interfaces.port(port) else {
            debug!(domain = %domain.name, port, "Port not registered, skipping interface add");
            return Ok(());
        };

        let first = self
            .membership
            .add_member(&domain.name, port.dpn, &port.name)
            .await?;

        if first {
            let (name, dpn) = (domain.name.clone(), port.dpn);
            self.submit(domain_key(&name), "switch-join", move |inner| {
                let name = name.clone();
                async move { inner.switch_join(&name, dpn).await }
            });
        } else if self.membership.is_member_switch(&domain.name, port.dpn).await? {
            self.groups.resync_switch(&domain, port.dpn).await?;
        }

        for mac in port.static_macs.iter().copied() {
            let (name, port) = (domain.name.clone(), port.name.clone());
            self.submit(mac_key(&name, &mac), "add-static-mac", move |inner| {
                let (name, port) = (name.clone(), port.clone());
                async move { inner.static_mac_added(&name, mac, &port).await }
            });
        }
        Ok(())
    }

    async fn port_removed(self: &Arc<Self>, domain: &str, port: &str) -> Result<()> {
        let Some(domain) = self.domains.active(domain) else {
            debug!(domain, port, "Domain gone, skipping interface remove");
            return Ok(());
        };
        let Some(dpn) = self.membership.locate(&domain.name, port).await? else {
            debug!(domain = %domain.name, port, "Port is not a member, skipping interface remove");
            return Ok(());
        };

        // Ownership changes belong to the MAC key; the port job only enumerates
        for entry in self.table.owned_by_port(&domain.name, port).await? {
            let (name, port) = (domain.name.clone(), entry.port.clone());
            let mac = entry.mac;
            self.submit(mac_key(&name, &mac), "unlearn-port-mac", move |inner| {
                let (name, port) = (name.clone(), port.clone());
                async move { inner.port_mac_removed(&name, mac, &port).await }
            });
        }

        let last = self.membership.remove_member(&domain.name, dpn, port).await?;
        if last {
            let name = domain.name.clone();
            self.submit(domain_key(&name), "switch-leave", move |inner| {
                let name = name.clone();
                async move { inner.switch_leave(&name, dpn).await }
            });
        } else if self.membership.is_member_switch(&domain.name, dpn).await? {
            self.groups.resync_switch(&domain, dpn).await?;
        }
        Ok(())
    }

    /// Programs a switch that just became a member: own groups, the flood
    /// rules pointing at them, then the other members' remote groups and the
    /// rules for MACs owned elsewhere.
    async fn switch_join(self: &Arc<Self>, name: &str, dpn: DatapathId) -> Result<()> {
        let Some(domain) = self.domains.active(name) else {
            return Ok(());
        };
        if !self.membership.is_member_switch(name, dpn).await? {
            debug!(domain = name, %dpn, "Switch left before join completed");
            return Ok(());
        }

        self.groups.sync_local_group(&domain, dpn).await?;
        self.groups.settle().await;
        self.groups.sync_remote_group(&domain, dpn).await?;
        self.groups.settle().await;
        // Flood rules reference the groups installed above
        for flow in switch_default_flows(&domain, dpn) {
            self.switch.install_flow(dpn, flow).await?;
        }
        self.groups.sync_all_other_switches(&domain, dpn).await?;

        let mut catch_up = 0;
        for entry in self.table.entries(name).await? {
            if entry.dpn != dpn {
                self.flows.schedule(&self.jobs, &domain, entry.mac, [dpn]);
                catch_up += 1;
            }
        }

        info!(domain = name, %dpn, catch_up, "Switch joined domain");
        audit_log!(AuditRecord::new(AuditCategory::NetworkConfig, "ElanManager", "switch_join")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(format!("{}/{}", name, dpn))
            .with_object_type("elan_dpn"));
        Ok(())
    }

    /// Removes a switch's default rules and groups, then re-syncs the
    /// remaining members.
    async fn switch_leave(self: &Arc<Self>, name: &str, dpn: DatapathId) -> Result<()> {
        let Some(domain) = self.domains.active(name) else {
            return Ok(());
        };
        if self.membership.is_member_switch(name, dpn).await? {
            debug!(domain = name, %dpn, "Switch rejoined before leave ran");
            return Ok(());
        }

        self.clear_switch(&domain, dpn).await?;
        self.groups.sync_all_other_switches(&domain, dpn).await?;

        for entry in self.table.entries(name).await? {
            self.flows.schedule(&self.jobs, &domain, entry.mac, [dpn]);
        }

        info!(domain = name, %dpn, "Switch left domain");
        audit_log!(AuditRecord::new(AuditCategory::NetworkConfig, "ElanManager", "switch_leave")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(format!("{}/{}", name, dpn))
            .with_object_type("elan_dpn"));
        Ok(())
    }

    async fn clear_switch(&self, domain: &ElanDomain, dpn: DatapathId) -> Result<()> {
        for flow in switch_default_flows(domain, dpn) {
            self.switch.remove_flow(dpn, flow.id).await?;
        }
        self.groups.remove_groups(domain, dpn).await
    }

    async fn static_mac_added(self: &Arc<Self>, domain: &str, mac: MacAddress, port: &str) -> Result<()> {
        let Some(domain) = self.domains.active(domain) else {
            debug!(domain, %mac, "Domain not active, skipping static MAC");
            return Ok(());
        };
        let Some(port) = self.interfaces.port(port) else {
            debug!(domain = %domain.name, %mac, port, "Port not registered, skipping static MAC");
            return Ok(());
        };

        let transition = self.table.add_static(&domain.name, mac, &port, None).await?;
        self.flows
            .schedule_transition(&self.jobs, &domain, mac, &transition)
            .await?;
        if transition.is_change() {
            audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "ElanManager", "add_static_mac")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(mac.to_string())
                .with_object_type("mac_entry")
                .with_details(serde_json::json!({"domain": domain.name, "port": port.name})));
        }
        Ok(())
    }

    async fn static_mac_removed(self: &Arc<Self>, domain: &str, mac: MacAddress) -> Result<()> {
        let Some(domain) = self.domains.active(domain) else {
            return Ok(());
        };
        let transition = self.table.remove_static(&domain.name, mac).await?;
        self.flows
            .schedule_transition(&self.jobs, &domain, mac, &transition)
            .await?;
        if transition.is_change() {
            audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "ElanManager", "remove_static_mac")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(mac.to_string())
                .with_object_type("mac_entry")
                .with_details(serde_json::json!({"domain": domain.name})));
        }
        Ok(())
    }

    async fn port_mac_removed(self: &Arc<Self>, domain: &str, mac: MacAddress, port: &str) -> Result<()> {
        let Some(domain) = self.domains.active(domain) else {
            return Ok(());
        };
        let transition = self.table.unlearn(&domain.name, mac, port).await?;
        self.flows
            .schedule_transition(&self.jobs, &domain, mac, &transition)
            .await
    }

    async fn mac_aged(self: &Arc<Self>, domain: &str, mac: MacAddress) -> Result<()> {
        let Some(domain) = self.domains.active(domain) else {
            return Ok(());
        };
        let transition = self.table.age_out(&domain.name, mac).await?;
        debug!(domain = %domain.name, %mac, removed = transition.is_change(), "MAC aged");
        self.flows
            .schedule_transition(&self.jobs, &domain, mac, &transition)
            .await
    }

    async fn tunnel_changed(self: &Arc<Self>, name: &str, src: DatapathId, dst: DatapathId) -> Result<()> {
        let Some(domain) = self.domains.active(name) else {
            return Ok(());
        };
        let members = self.membership.member_switches(name).await?;
        if !members.contains(&src) || !members.contains(&dst) {
            return Ok(());
        }

        for dpn in [src, dst] {
            self.groups.sync_remote_group(&domain, dpn).await?;
        }
        for entry in self.table.entries(name).await? {
            if entry.dpn == src || entry.dpn == dst {
                self.flows
                    .schedule(&self.jobs, &domain, entry.mac, [src, dst]);
            }
        }
        Ok(())
    }
}
