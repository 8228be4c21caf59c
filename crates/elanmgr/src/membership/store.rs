//! Membership store and first/last member transition detection.

use crate::error::Result;
use crate::interfaces::{ElanStore, StoreOp};
use crate::types::MembershipEntry;
use dashmap::DashMap;
use elan_types::DatapathId;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Tracks which ports of each domain live on each switch.
///
/// Each domain has one owner lock; every read-modify-write of the domain's
/// membership entries happens while holding it, whichever job stream issued
/// the mutation.
pub struct MembershipStore {
    store: Arc<dyn ElanStore>,
    placeholder_ports: HashSet<String>,
    owners: DashMap<String, Arc<Mutex<()>>>,
}

impl MembershipStore {
    pub fn new(store: Arc<dyn ElanStore>, placeholder_ports: Vec<String>) -> Self {
        Self {
            store,
            placeholder_ports: placeholder_ports.into_iter().collect(),
            owners: DashMap::new(),
        }
    }

    fn owner(&self, domain: &str) -> Arc<Mutex<()>> {
        self.owners
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Placeholder ports exist only to keep provider topologies wired and
    /// never count as members.
    pub fn is_placeholder(&self, domain: &str, port: &str) -> bool {
        port == domain || self.placeholder_ports.contains(port)
    }

    fn real_port_count(&self, entry: &MembershipEntry) -> usize {
        entry
            .ports
            .iter()
            .filter(|p| !self.is_placeholder(&entry.domain, p))
            .count()
    }

    /// Adds `port` to the member set of (domain, dpn).
    ///
    /// Returns true when this made the switch a member of the domain, i.e.
    /// no real port was present before and `port` is a real port.
    pub async fn add_member(&self, domain: &str, dpn: DatapathId, port: &str) -> Result<bool> {
        let owner = self.owner(domain);
        let _guard = owner.lock().await;

        let mut entry = self
            .store
            .membership(domain, dpn)
            .await?
            .unwrap_or_else(|| MembershipEntry::new(domain, dpn));

        if entry.contains(port) {
            return Ok(false);
        }

        let was_empty = self.real_port_count(&entry) == 0;
        entry.ports.push(port.to_string());
        self.store.commit(vec![StoreOp::PutMembership(entry)]).await?;

        let first = was_empty && !self.is_placeholder(domain, port);
        debug!(domain, %dpn, port, first, "Added member");
        Ok(first)
    }

    /// Removes `port` from the member set of (domain, dpn).
    ///
    /// Returns true when the last real port left the switch. An entry left
    /// with no port at all is deleted.
    pub async fn remove_member(&self, domain: &str, dpn: DatapathId, port: &str) -> Result<bool> {
        let owner = self.owner(domain);
        let _guard = owner.lock().await;

        let Some(mut entry) = self.store.membership(domain, dpn).await? else {
            return Ok(false);
        };
        if !entry.contains(port) {
            return Ok(false);
        }

        let had_members = self.real_port_count(&entry) > 0;
        entry.ports.retain(|p| p != port);
        let last = had_members && self.real_port_count(&entry) == 0;

        let op = if entry.ports.is_empty() {
            StoreOp::DeleteMembership {
                domain: domain.to_string(),
                dpn,
            }
        } else {
            StoreOp::PutMembership(entry)
        };
        self.store.commit(vec![op]).await?;

        debug!(domain, %dpn, port, last, "Removed member");
        Ok(last)
    }

    pub async fn entry(&self, domain: &str, dpn: DatapathId) -> Result<Option<MembershipEntry>> {
        Ok(self.store.membership(domain, dpn).await?)
    }

    pub async fn entries(&self, domain: &str) -> Result<Vec<MembershipEntry>> {
        Ok(self.store.memberships(domain).await?)
    }

    /// Switches holding at least one real member port, ordered by id.
    pub async fn member_switches(&self, domain: &str) -> Result<Vec<DatapathId>> {
        let mut dpns: Vec<DatapathId> = self
            .entries(domain)
            .await?
            .iter()
            .filter(|entry| self.real_port_count(entry) > 0)
            .map(|entry| entry.dpn)
            .collect();
        dpns.sort();
        Ok(dpns)
    }

    pub async fn is_member_switch(&self, domain: &str, dpn: DatapathId) -> Result<bool> {
        Ok(self
            .entry(domain, dpn)
            .await?
            .is_some_and(|entry| self.real_port_count(&entry) > 0))
    }

    /// Switch currently holding `port` in `domain`.
    pub async fn locate(&self, domain: &str, port: &str) -> Result<Option<DatapathId>> {
        Ok(self
            .entries(domain)
            .await?
            .into_iter()
            .find(|entry| entry.contains(port))
            .map(|entry| entry.dpn))
    }

    /// Drops the owner lock of a deleted domain.
    pub fn forget(&self, domain: &str) {
        self.owners.remove(domain);
    }
}
