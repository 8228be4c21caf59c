//! Boundary contracts to the collaborators outside the core.
//!
//! Every external system is reached through one of these traits so the
//! manager can run against real infrastructure or the in-memory
//! implementations in [`crate::memory`].

use crate::error::{AllocError, StoreError, SwitchError};
use crate::programming::{Action, Bucket, FlowDescriptor, FlowId, GroupDescriptor, GroupId};
use crate::types::{ElanDomain, MacEntry, MembershipEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elan_types::{DatapathId, MacAddress, SegmentKind};

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type SwitchResult<T> = std::result::Result<T, SwitchError>;

/// One write of a transactional store commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    PutDomain(ElanDomain),
    DeleteDomain(String),
    PutMembership(MembershipEntry),
    DeleteMembership { domain: String, dpn: DatapathId },
    /// Writes the (domain, mac) record
    PutMac(MacEntry),
    DeleteMac { domain: String, mac: MacAddress },
    /// Writes the (port, mac) index record
    PutPortMac(MacEntry),
    DeletePortMac { port: String, mac: MacAddress },
}

/// Persistent datastore holding domains, memberships and MAC entries.
#[async_trait]
pub trait ElanStore: Send + Sync {
    async fn domain(&self, name: &str) -> StoreResult<Option<ElanDomain>>;

    async fn domains(&self) -> StoreResult<Vec<ElanDomain>>;

    async fn membership(&self, domain: &str, dpn: DatapathId)
        -> StoreResult<Option<MembershipEntry>>;

    /// All membership entries of a domain, ordered by switch id.
    async fn memberships(&self, domain: &str) -> StoreResult<Vec<MembershipEntry>>;

    async fn mac(&self, domain: &str, mac: &MacAddress) -> StoreResult<Option<MacEntry>>;

    async fn domain_macs(&self, domain: &str) -> StoreResult<Vec<MacEntry>>;

    /// Entries of the (port, mac) index for `port`.
    async fn port_macs(&self, port: &str) -> StoreResult<Vec<MacEntry>>;

    /// Applies all writes atomically, or none of them.
    async fn commit(&self, ops: Vec<StoreOp>) -> StoreResult<()>;
}

/// Programs flood groups and match/action rules on switches.
///
/// Installs are install-or-replace; removing something absent succeeds.
#[async_trait]
pub trait SwitchProgrammer: Send + Sync {
    async fn install_group(&self, dpn: DatapathId, group: GroupDescriptor) -> SwitchResult<()>;

    async fn remove_group(&self, dpn: DatapathId, id: GroupId) -> SwitchResult<()>;

    async fn install_flow(&self, dpn: DatapathId, flow: FlowDescriptor) -> SwitchResult<()>;

    async fn remove_flow(&self, dpn: DatapathId, id: FlowId) -> SwitchResult<()>;
}

/// Resolves overlay reachability between switches.
pub trait TunnelResolver: Send + Sync {
    /// Actions sending a packet carrying `tunnel_key` from `src` to `dst`,
    /// or `None` when no tunnel is up between them.
    fn egress_actions(&self, src: DatapathId, dst: DatapathId, tunnel_key: u64)
        -> Option<Vec<Action>>;
}

/// Port inventory.
pub trait InterfaceRegistry: Send + Sync {
    fn port(&self, name: &str) -> Option<crate::types::PortDescriptor>;

    /// Reverse lookup used to resolve packet-in metadata.
    fn port_by_tag(&self, dpn: DatapathId, port_tag: u32) -> Option<String>;
}

/// Hardware gateway (VTEP) devices attached to a domain.
pub trait GatewayBucketSupplier: Send + Sync {
    fn gateway_buckets(&self, domain: &ElanDomain, segment: SegmentKind) -> Vec<Bucket>;
}

/// Dense id pool. Allocation is idempotent per key.
pub trait TagAllocator: Send + Sync {
    fn allocate(&self, pool: &str, key: &str) -> std::result::Result<u32, AllocError>;

    fn release(&self, pool: &str, key: &str) -> std::result::Result<(), AllocError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
