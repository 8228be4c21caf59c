//! Unknown-source packet-in handling.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::domain::DomainRegistry;
use crate::error::Result;
use crate::interfaces::{Clock, InterfaceRegistry};
use crate::keys::mac_key;
use crate::mac::{MacFlowProgrammer, MacTable, MacTransition};
use crate::membership::MembershipStore;
use crate::types::{ElanDomain, PortDescriptor};
use elan_orch_common::{JobCoordinator, JobError};
use elan_types::{DatapathId, MacAddress};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Domain named by a packet-in, either directly or through its metadata tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainRef {
    Tag(u32),
    Name(String),
}

/// Data-plane notification that a source MAC missed the SMAC table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownSourceEvent {
    pub domain: DomainRef,
    pub mac: MacAddress,
    pub dpn: DatapathId,
    pub port_tag: u32,
    #[serde(default)]
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnDecision {
    Learned,
    /// The port already owns the MAC
    Relearned,
    Migrated { from: String },
    /// Another port took the MAC less than the anti-churn window ago
    IgnoredChurn,
    IgnoredStatic,
    IgnoredExternal,
    /// Multicast or zero source address
    IgnoredUnlearnable,
    /// The port is not (or no longer) a member of the domain
    IgnoredNotMember,
}

#[derive(Debug, Default)]
pub struct LearningStats {
    pub learned: AtomicU64,
    pub relearned: AtomicU64,
    pub migrated: AtomicU64,
    pub ignored: AtomicU64,
    /// Events whose domain or member port could not be resolved
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LearningStatsSnapshot {
    pub learned: u64,
    pub relearned: u64,
    pub migrated: u64,
    pub ignored: u64,
    pub dropped: u64,
}

impl LearningStats {
    fn record(&self, decision: &LearnDecision) {
        let counter = match decision {
            LearnDecision::Learned => &self.learned,
            LearnDecision::Relearned => &self.relearned,
            LearnDecision::Migrated { .. } => &self.migrated,
            LearnDecision::IgnoredNotMember => &self.dropped,
            _ => &self.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LearningStatsSnapshot {
        LearningStatsSnapshot {
            learned: self.learned.load(Ordering::Relaxed),
            relearned: self.relearned.load(Ordering::Relaxed),
            migrated: self.migrated.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Decides what an unknown-source event means for MAC ownership.
///
/// Decisions for one (domain, mac) are serialized on its MAC job key; the
/// resulting rule programming runs under per-switch keys.
pub struct PacketLearner {
    domains: Arc<DomainRegistry>,
    registry: Arc<dyn InterfaceRegistry>,
    membership: Arc<MembershipStore>,
    table: Arc<MacTable>,
    flows: Arc<MacFlowProgrammer>,
    clock: Arc<dyn Clock>,
    jobs: JobCoordinator,
    anti_churn_window: Duration,
    stats: LearningStats,
}

impl PacketLearner {
    pub fn new(
        domains: Arc<DomainRegistry>,
        registry: Arc<dyn InterfaceRegistry>,
        membership: Arc<MembershipStore>,
        table: Arc<MacTable>,
        flows: Arc<MacFlowProgrammer>,
        clock: Arc<dyn Clock>,
        jobs: JobCoordinator,
        anti_churn_window: Duration,
    ) -> Self {
        Self {
            domains,
            registry,
            membership,
            table,
            flows,
            clock,
            jobs,
            anti_churn_window,
            stats: LearningStats::default(),
        }
    }

    pub fn stats(&self) -> LearningStatsSnapshot {
        self.stats.snapshot()
    }

    fn resolve_domain(&self, domain: &DomainRef) -> Option<ElanDomain> {
        match domain {
            DomainRef::Name(name) => self.domains.active(name),
            DomainRef::Tag(tag) => self.domains.resolve_tag(*tag),
        }
    }

    /// Resolves the event and queues the ownership decision.
    ///
    /// Events naming an unknown domain or port are dropped.
    pub fn on_unknown_source(self: &Arc<Self>, event: UnknownSourceEvent) {
        let Some(domain) = self.resolve_domain(&event.domain) else {
            debug!(domain = ?event.domain, mac = %event.mac, "Unknown domain in packet-in, dropping");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let port = self
            .registry
            .port_by_tag(event.dpn, event.port_tag)
            .and_then(|name| self.registry.port(&name));
        let Some(port) = port else {
            debug!(domain = %domain.name, mac = %event.mac, dpn = %event.dpn, port_tag = event.port_tag,
                "Unresolvable port in packet-in, dropping");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let learner = Arc::clone(self);
        let (mac, ip) = (event.mac, event.ip);
        self.jobs.enqueue(mac_key(&domain.name, &mac), "learn-mac", move || {
            let learner = Arc::clone(&learner);
            let domain = domain.clone();
            let port = port.clone();
            async move {
                learner
                    .learn_and_program(&domain, mac, &port, ip)
                    .await
                    .map(|_| ())
                    .map_err(JobError::from)
            }
        });
    }

    /// Applies the decision and schedules rule programming on every switch
    /// affected by it.
    pub async fn learn_and_program(
        &self,
        domain: &ElanDomain,
        mac: MacAddress,
        port: &PortDescriptor,
        ip: Option<IpAddr>,
    ) -> Result<LearnDecision> {
        let (decision, transition) = self.decide(domain, mac, port, ip).await?;
        self.stats.record(&decision);

        if let Some(transition) = transition {
            self.flows
                .schedule_transition(&self.jobs, domain, mac, &transition)
                .await?;
        }
        Ok(decision)
    }

    /// Decides and applies the ownership change for one packet-in.
    pub async fn decide(
        &self,
        domain: &ElanDomain,
        mac: MacAddress,
        port: &PortDescriptor,
        ip: Option<IpAddr>,
    ) -> Result<(LearnDecision, Option<MacTransition>)> {
        if port.external {
            return Ok((LearnDecision::IgnoredExternal, None));
        }
        if !mac.is_learnable() {
            return Ok((LearnDecision::IgnoredUnlearnable, None));
        }
        // Packet-ins still in flight when a port leaves must not resurrect it
        if self.membership.locate(&domain.name, &port.name).await? != Some(port.dpn) {
            debug!(domain = %domain.name, %mac, port = %port.name, dpn = %port.dpn,
                "Packet-in on a port outside the domain, dropping");
            return Ok((LearnDecision::IgnoredNotMember, None));
        }

        let Some(existing) = self.table.lookup(&domain.name, &mac).await? else {
            let transition = self.table.learn(&domain.name, mac, port, ip).await?;
            debug!(domain = %domain.name, %mac, port = %port.name, "Learned MAC");
            return Ok((LearnDecision::Learned, Some(transition)));
        };

        if existing.is_static() {
            return Ok((LearnDecision::IgnoredStatic, None));
        }
        if existing.port == port.name {
            return Ok((LearnDecision::Relearned, None));
        }

        let age = self.clock.now().signed_duration_since(existing.created_at);
        let young = age
            .to_std()
            .map_or(true, |age| age < self.anti_churn_window);
        if young {
            debug!(domain = %domain.name, %mac, owner = %existing.port, port = %port.name,
                age_ms = age.num_milliseconds(), "Ignoring packet-in inside anti-churn window");
            return Ok((LearnDecision::IgnoredChurn, None));
        }

        let transition = self
            .table
            .migrate(&domain.name, mac, &existing.port, port)
            .await?;
        info!(domain = %domain.name, %mac, from = %existing.port, to = %port.name, "MAC moved");
        audit_log!(AuditRecord::new(AuditCategory::MacLearning, "PacketLearner", "migrate_mac")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(mac.to_string())
            .with_object_type("mac_entry")
            .with_details(serde_json::json!({
                "domain": domain.name,
                "from_port": existing.port,
                "from_dpn": existing.dpn.as_u64(),
                "to_port": port.name,
                "to_dpn": port.dpn.as_u64(),
            })));

        Ok((
            LearnDecision::Migrated {
                from: existing.port,
            },
            Some(transition),
        ))
    }
}
