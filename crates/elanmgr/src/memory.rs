//! In-memory collaborators.
//!
//! These back the tests and the `elanmgrd --events` replay mode. The store
//! and the switch can be told to fail upcoming calls, which exercises the
//! job retry path.

use crate::config::ElanConfig;
use crate::error::{AllocError, StoreError, SwitchError};
use crate::interfaces::{
    Clock, ElanStore, GatewayBucketSupplier, InterfaceRegistry, StoreOp, StoreResult,
    SwitchProgrammer, SwitchResult, TagAllocator, TunnelResolver,
};
use crate::manager::ElanCollaborators;
use crate::programming::{
    Action, Bucket, FlowDescriptor, FlowId, FlowTable, GroupDescriptor, GroupId,
};
use crate::types::{ElanDomain, MacEntry, MembershipEntry, PortDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use elan_types::{DatapathId, MacAddress, OperState, SegmentKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Decrements `counter` if positive; returns true when a failure should be
/// injected.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
struct Tables {
    domains: BTreeMap<String, ElanDomain>,
    memberships: BTreeMap<(String, DatapathId), MembershipEntry>,
    macs: BTreeMap<(String, MacAddress), MacEntry>,
    port_macs: BTreeMap<(String, MacAddress), MacEntry>,
}

/// Transactional map-backed store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    failing_commits: AtomicUsize,
    commits: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` commits fail with a conflict.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn membership_count(&self) -> usize {
        self.tables.lock().memberships.len()
    }

    pub fn mac_count(&self) -> usize {
        self.tables.lock().macs.len()
    }
}

#[async_trait]
impl ElanStore for InMemoryStore {
    async fn domain(&self, name: &str) -> StoreResult<Option<ElanDomain>> {
        Ok(self.tables.lock().domains.get(name).cloned())
    }

    async fn domains(&self) -> StoreResult<Vec<ElanDomain>> {
        Ok(self.tables.lock().domains.values().cloned().collect())
    }

    async fn membership(
        &self,
        domain: &str,
        dpn: DatapathId,
    ) -> StoreResult<Option<MembershipEntry>> {
        Ok(self
            .tables
            .lock()
            .memberships
            .get(&(domain.to_string(), dpn))
            .cloned())
    }

    async fn memberships(&self, domain: &str) -> StoreResult<Vec<MembershipEntry>> {
        Ok(self
            .tables
            .lock()
            .memberships
            .iter()
            .filter(|((d, _), _)| d == domain)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn mac(&self, domain: &str, mac: &MacAddress) -> StoreResult<Option<MacEntry>> {
        Ok(self
            .tables
            .lock()
            .macs
            .get(&(domain.to_string(), *mac))
            .cloned())
    }

    async fn domain_macs(&self, domain: &str) -> StoreResult<Vec<MacEntry>> {
        Ok(self
            .tables
            .lock()
            .macs
            .iter()
            .filter(|((d, _), _)| d == domain)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn port_macs(&self, port: &str) -> StoreResult<Vec<MacEntry>> {
        Ok(self
            .tables
            .lock()
            .port_macs
            .iter()
            .filter(|((p, _), _)| p == port)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn commit(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        if take_failure(&self.failing_commits) {
            return Err(StoreError::Conflict("injected commit failure".to_string()));
        }

        let mut tables = self.tables.lock();
        for op in ops {
            match op {
                StoreOp::PutDomain(domain) => {
                    tables.domains.insert(domain.name.clone(), domain);
                }
                StoreOp::DeleteDomain(name) => {
                    tables.domains.remove(&name);
                }
                StoreOp::PutMembership(entry) => {
                    tables
                        .memberships
                        .insert((entry.domain.clone(), entry.dpn), entry);
                }
                StoreOp::DeleteMembership { domain, dpn } => {
                    tables.memberships.remove(&(domain, dpn));
                }
                StoreOp::PutMac(entry) => {
                    tables.macs.insert((entry.domain.clone(), entry.mac), entry);
                }
                StoreOp::DeleteMac { domain, mac } => {
                    tables.macs.remove(&(domain, mac));
                }
                StoreOp::PutPortMac(entry) => {
                    tables.port_macs.insert((entry.port.clone(), entry.mac), entry);
                }
                StoreOp::DeletePortMac { port, mac } => {
                    tables.port_macs.remove(&(port, mac));
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct SwitchTables {
    groups: BTreeMap<(DatapathId, GroupId), GroupDescriptor>,
    flows: BTreeMap<(DatapathId, FlowId), FlowDescriptor>,
    journal: Vec<(DatapathId, SwitchCall)>,
}

/// One successful programming call, as journaled by [`RecordingSwitch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchCall {
    InstallGroup(GroupId),
    RemoveGroup(GroupId),
    InstallFlow(FlowId),
    RemoveFlow(FlowId),
}

/// Everything programmed on one switch.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchDump {
    pub dpn: DatapathId,
    pub groups: Vec<GroupDescriptor>,
    pub flows: Vec<FlowDescriptor>,
}

/// Switch programmer that records the resulting switch state.
#[derive(Default)]
pub struct RecordingSwitch {
    tables: Mutex<SwitchTables>,
    failing_calls: AtomicUsize,
    group_installs: AtomicU64,
}

impl RecordingSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` programming calls fail.
    pub fn fail_next_calls(&self, n: usize) {
        self.failing_calls.store(n, Ordering::SeqCst);
    }

    fn check(&self, dpn: DatapathId, object: &str) -> SwitchResult<()> {
        if take_failure(&self.failing_calls) {
            return Err(SwitchError::Rejected {
                dpn: dpn.to_string(),
                object: object.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    pub fn group(&self, dpn: DatapathId, id: GroupId) -> Option<GroupDescriptor> {
        self.tables.lock().groups.get(&(dpn, id)).cloned()
    }

    pub fn groups_on(&self, dpn: DatapathId) -> Vec<GroupDescriptor> {
        self.tables
            .lock()
            .groups
            .iter()
            .filter(|((d, _), _)| *d == dpn)
            .map(|(_, group)| group.clone())
            .collect()
    }

    pub fn flow(&self, dpn: DatapathId, id: &FlowId) -> Option<FlowDescriptor> {
        self.tables.lock().flows.get(&(dpn, id.clone())).cloned()
    }

    pub fn flows_on(&self, dpn: DatapathId) -> Vec<FlowDescriptor> {
        self.tables
            .lock()
            .flows
            .iter()
            .filter(|((d, _), _)| *d == dpn)
            .map(|(_, flow)| flow.clone())
            .collect()
    }

    pub fn flows_in_table(&self, dpn: DatapathId, table: FlowTable) -> Vec<FlowDescriptor> {
        self.flows_on(dpn)
            .into_iter()
            .filter(|flow| flow.table == table)
            .collect()
    }

    /// Successful calls made against `dpn`, oldest first.
    pub fn calls_on(&self, dpn: DatapathId) -> Vec<SwitchCall> {
        self.tables
            .lock()
            .journal
            .iter()
            .filter(|(d, _)| *d == dpn)
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Number of successful group installs, replacements included.
    pub fn group_install_count(&self) -> u64 {
        self.group_installs.load(Ordering::SeqCst)
    }

    /// State of every switch that holds anything, ordered by switch id.
    pub fn dump(&self) -> Vec<SwitchDump> {
        let tables = self.tables.lock();
        let dpns: BTreeSet<DatapathId> = tables
            .groups
            .keys()
            .map(|(dpn, _)| *dpn)
            .chain(tables.flows.keys().map(|(dpn, _)| *dpn))
            .collect();

        dpns.into_iter()
            .map(|dpn| SwitchDump {
                dpn,
                groups: tables
                    .groups
                    .iter()
                    .filter(|((d, _), _)| *d == dpn)
                    .map(|(_, g)| g.clone())
                    .collect(),
                flows: tables
                    .flows
                    .iter()
                    .filter(|((d, _), _)| *d == dpn)
                    .map(|(_, f)| f.clone())
                    .collect(),
            })
            .collect()
    }
}

#[async_trait]
impl SwitchProgrammer for RecordingSwitch {
    async fn install_group(&self, dpn: DatapathId, group: GroupDescriptor) -> SwitchResult<()> {
        self.check(dpn, "group")?;
        let mut tables = self.tables.lock();
        tables.journal.push((dpn, SwitchCall::InstallGroup(group.id)));
        tables.groups.insert((dpn, group.id), group);
        self.group_installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_group(&self, dpn: DatapathId, id: GroupId) -> SwitchResult<()> {
        self.check(dpn, "group")?;
        let mut tables = self.tables.lock();
        tables.journal.push((dpn, SwitchCall::RemoveGroup(id)));
        tables.groups.remove(&(dpn, id));
        Ok(())
    }

    async fn install_flow(&self, dpn: DatapathId, flow: FlowDescriptor) -> SwitchResult<()> {
        self.check(dpn, "flow")?;
        let mut tables = self.tables.lock();
        tables.journal.push((dpn, SwitchCall::InstallFlow(flow.id.clone())));
        tables.flows.insert((dpn, flow.id.clone()), flow);
        Ok(())
    }

    async fn remove_flow(&self, dpn: DatapathId, id: FlowId) -> SwitchResult<()> {
        self.check(dpn, "flow")?;
        let mut tables = self.tables.lock();
        tables.flows.remove(&(dpn, id.clone()));
        tables.journal.push((dpn, SwitchCall::RemoveFlow(id)));
        Ok(())
    }
}

/// Full mesh of tunnels between all switches, minus links marked down.
#[derive(Default)]
pub struct MeshTunnelResolver {
    down: Mutex<HashSet<(DatapathId, DatapathId)>>,
}

impl MeshTunnelResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(a: DatapathId, b: DatapathId) -> (DatapathId, DatapathId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn set_link(&self, a: DatapathId, b: DatapathId, up: bool) {
        let mut down = self.down.lock();
        if up {
            down.remove(&Self::link(a, b));
        } else {
            down.insert(Self::link(a, b));
        }
    }
}

impl TunnelResolver for MeshTunnelResolver {
    fn egress_actions(
        &self,
        src: DatapathId,
        dst: DatapathId,
        tunnel_key: u64,
    ) -> Option<Vec<Action>> {
        if src == dst || self.down.lock().contains(&Self::link(src, dst)) {
            return None;
        }
        Some(vec![
            Action::SetTunnelId { key: tunnel_key },
            Action::OutputTunnel { remote: dst },
        ])
    }
}

/// Port inventory fed by the caller.
#[derive(Default)]
pub struct StaticInterfaceRegistry {
    ports: DashMap<String, PortDescriptor>,
}

impl StaticInterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, port: PortDescriptor) {
        self.ports.insert(port.name.clone(), port);
    }

    pub fn remove(&self, name: &str) -> Option<PortDescriptor> {
        self.ports.remove(name).map(|(_, port)| port)
    }

    pub fn set_oper(&self, name: &str, oper: OperState) {
        if let Some(mut port) = self.ports.get_mut(name) {
            port.oper = oper;
        }
    }
}

impl InterfaceRegistry for StaticInterfaceRegistry {
    fn port(&self, name: &str) -> Option<PortDescriptor> {
        self.ports.get(name).map(|port| port.clone())
    }

    fn port_by_tag(&self, dpn: DatapathId, port_tag: u32) -> Option<String> {
        self.ports
            .iter()
            .find(|port| port.dpn == dpn && port.port_tag == port_tag)
            .map(|port| port.name.clone())
    }
}

/// Gateway devices attached per domain.
#[derive(Default)]
pub struct StaticGateways {
    devices: DashMap<String, Vec<String>>,
}

impl StaticGateways {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, domain: &str, device: impl Into<String>) {
        self.devices
            .entry(domain.to_string())
            .or_default()
            .push(device.into());
    }
}

impl GatewayBucketSupplier for StaticGateways {
    fn gateway_buckets(&self, domain: &ElanDomain, segment: SegmentKind) -> Vec<Bucket> {
        let Some(devices) = self.devices.get(&domain.name) else {
            return Vec::new();
        };
        devices
            .iter()
            .map(|device| {
                Bucket::new(vec![
                    Action::SetTunnelId {
                        key: domain.tunnel_key(segment),
                    },
                    Action::OutputGateway {
                        device: device.clone(),
                    },
                ])
            })
            .collect()
    }
}

#[derive(Default)]
struct Pool {
    next: u32,
    released: BTreeSet<u32>,
    by_key: HashMap<String, u32>,
}

/// Dense id allocator handing out ids from a fixed range per pool.
pub struct PoolTagAllocator {
    low: u32,
    high: u32,
    pools: Mutex<HashMap<String, Pool>>,
}

impl PoolTagAllocator {
    pub fn new(low: u32, high: u32) -> Self {
        Self {
            low,
            high,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn allocated(&self, pool: &str) -> usize {
        self.pools
            .lock()
            .get(pool)
            .map_or(0, |p| p.by_key.len())
    }
}

impl TagAllocator for PoolTagAllocator {
    fn allocate(&self, pool: &str, key: &str) -> Result<u32, AllocError> {
        let mut pools = self.pools.lock();
        let entry = pools.entry(pool.to_string()).or_insert_with(|| Pool {
            next: self.low,
            ..Pool::default()
        });

        if let Some(id) = entry.by_key.get(key) {
            return Ok(*id);
        }

        let id = if let Some(id) = entry.released.pop_first() {
            id
        } else if entry.next <= self.high {
            let id = entry.next;
            entry.next += 1;
            id
        } else {
            return Err(AllocError::Exhausted(pool.to_string()));
        };

        entry.by_key.insert(key.to_string(), id);
        Ok(id)
    }

    fn release(&self, pool: &str, key: &str) -> Result<(), AllocError> {
        let mut pools = self.pools.lock();
        if let Some(entry) = pools.get_mut(pool) {
            if let Some(id) = entry.by_key.remove(key) {
                entry.released.insert(id);
            }
        }
        Ok(())
    }
}

/// Clock advanced explicitly by tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// One in-memory instance of every collaborator, with typed handles kept
/// for inspection.
#[derive(Clone)]
pub struct InMemoryCollaborators {
    pub store: Arc<InMemoryStore>,
    pub switch: Arc<RecordingSwitch>,
    pub tunnels: Arc<MeshTunnelResolver>,
    pub interfaces: Arc<StaticInterfaceRegistry>,
    pub gateways: Arc<StaticGateways>,
    pub tags: Arc<PoolTagAllocator>,
    pub clock: Arc<dyn Clock>,
}

impl InMemoryCollaborators {
    /// Collaborators with the tag range from `config`.
    pub fn new(config: &ElanConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            switch: Arc::new(RecordingSwitch::new()),
            tunnels: Arc::new(MeshTunnelResolver::new()),
            interfaces: Arc::new(StaticInterfaceRegistry::new()),
            gateways: Arc::new(StaticGateways::new()),
            tags: Arc::new(PoolTagAllocator::new(
                config.domains.tag_pool_low,
                config.domains.tag_pool_high,
            )),
            clock,
        }
    }

    pub fn collaborators(&self) -> ElanCollaborators {
        ElanCollaborators {
            store: self.store.clone(),
            switch: self.switch.clone(),
            tunnels: self.tunnels.clone(),
            interfaces: self.interfaces.clone(),
            gateways: self.gateways.clone(),
            tags: self.tags.clone(),
            clock: self.clock.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_store_commit_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let entry = MembershipEntry {
            domain: "blue".into(),
            dpn: DatapathId::new(1),
            ports: vec!["p1".into()],
        };

        store.fail_next_commits(1);
        assert!(store
            .commit(vec![StoreOp::PutMembership(entry.clone())])
            .await
            .is_err());
        assert_eq!(store.membership_count(), 0);

        store.commit(vec![StoreOp::PutMembership(entry.clone())]).await.unwrap();
        assert_eq!(
            store.membership("blue", DatapathId::new(1)).await.unwrap(),
            Some(entry)
        );
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn test_pool_allocator_reuses_ids() {
        let pool = PoolTagAllocator::new(5000, 5001);
        assert_eq!(pool.allocate("ids", "a").unwrap(), 5000);
        assert_eq!(pool.allocate("ids", "a").unwrap(), 5000);
        assert_eq!(pool.allocate("ids", "b").unwrap(), 5001);
        assert!(matches!(
            pool.allocate("ids", "c"),
            Err(AllocError::Exhausted(_))
        ));

        pool.release("ids", "a").unwrap();
        assert_eq!(pool.allocate("ids", "c").unwrap(), 5000);
        assert_eq!(pool.allocated("ids"), 2);
    }

    #[test]
    fn test_mesh_resolver_links() {
        let mesh = MeshTunnelResolver::new();
        let (a, b) = (DatapathId::new(1), DatapathId::new(2));

        assert!(mesh.egress_actions(a, a, 1).is_none());
        assert_eq!(
            mesh.egress_actions(a, b, 7).unwrap(),
            vec![
                Action::SetTunnelId { key: 7 },
                Action::OutputTunnel { remote: b }
            ]
        );

        mesh.set_link(b, a, false);
        assert!(mesh.egress_actions(a, b, 7).is_none());
        mesh.set_link(a, b, true);
        assert!(mesh.egress_actions(a, b, 7).is_some());
    }

    #[test]
    fn test_registry_reverse_lookup() {
        let registry = StaticInterfaceRegistry::new();
        registry.insert(PortDescriptor::new("p1", DatapathId::new(1), 3));
        registry.insert(PortDescriptor::new("p2", DatapathId::new(2), 3));

        assert_eq!(registry.port_by_tag(DatapathId::new(2), 3), Some("p2".to_string()));
        assert_eq!(registry.port_by_tag(DatapathId::new(3), 3), None);

        registry.set_oper("p1", OperState::Down);
        assert!(!registry.port("p1").unwrap().is_forwarding());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::default();
        let start = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!((clock.now() - start).num_milliseconds(), 1500);
    }
}
