//! MAC ownership state.
//!
//! Every (domain, mac) has at most one owner. Each mutation rewrites the
//! domain record and the per-port index record in one store commit, so an
//! ownership change is an atomic replace.

use crate::error::Result;
use crate::interfaces::{Clock, ElanStore, StoreOp};
use crate::types::{MacEntry, MacKind, PortDescriptor};
use elan_types::MacAddress;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Result of a MAC table mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacTransition {
    /// No entry existed; `0` is the new owner
    Created(MacEntry),
    /// Nothing changed; `0` is the current owner
    Unchanged(MacEntry),
    /// Ownership moved from `previous` to `current`
    Replaced {
        previous: MacEntry,
        current: MacEntry,
    },
    Removed(MacEntry),
    /// Nothing changed and no entry exists
    Absent,
}

impl MacTransition {
    /// Entry after the mutation.
    pub fn current(&self) -> Option<&MacEntry> {
        match self {
            MacTransition::Created(e) | MacTransition::Unchanged(e) => Some(e),
            MacTransition::Replaced { current, .. } => Some(current),
            MacTransition::Removed(_) | MacTransition::Absent => None,
        }
    }

    /// Entry displaced by the mutation.
    pub fn displaced(&self) -> Option<&MacEntry> {
        match self {
            MacTransition::Replaced { previous, .. } => Some(previous),
            MacTransition::Removed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, MacTransition::Unchanged(_) | MacTransition::Absent)
    }
}

fn put_ops(entry: &MacEntry) -> Vec<StoreOp> {
    vec![
        StoreOp::PutMac(entry.clone()),
        StoreOp::PutPortMac(entry.clone()),
    ]
}

fn delete_ops(entry: &MacEntry) -> Vec<StoreOp> {
    vec![
        StoreOp::DeleteMac {
            domain: entry.domain.clone(),
            mac: entry.mac,
        },
        StoreOp::DeletePortMac {
            port: entry.port.clone(),
            mac: entry.mac,
        },
    ]
}

/// Per-domain and per-port MAC entries.
pub struct MacTable {
    store: Arc<dyn ElanStore>,
    clock: Arc<dyn Clock>,
}

impl MacTable {
    pub fn new(store: Arc<dyn ElanStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn new_entry(
        &self,
        domain: &str,
        mac: MacAddress,
        port: &PortDescriptor,
        kind: MacKind,
        ip: Option<IpAddr>,
    ) -> MacEntry {
        MacEntry {
            domain: domain.to_string(),
            mac,
            port: port.name.clone(),
            dpn: port.dpn,
            kind,
            created_at: self.clock.now(),
            ip,
        }
    }

    pub async fn lookup(&self, domain: &str, mac: &MacAddress) -> Result<Option<MacEntry>> {
        Ok(self.store.mac(domain, mac).await?)
    }

    pub async fn entries(&self, domain: &str) -> Result<Vec<MacEntry>> {
        Ok(self.store.domain_macs(domain).await?)
    }

    async fn create(&self, entry: MacEntry) -> Result<MacTransition> {
        self.store.commit(put_ops(&entry)).await?;
        Ok(MacTransition::Created(entry))
    }

    async fn replace(&self, previous: MacEntry, current: MacEntry) -> Result<MacTransition> {
        let mut ops = vec![StoreOp::DeletePortMac {
            port: previous.port.clone(),
            mac: previous.mac,
        }];
        ops.extend(put_ops(&current));
        self.store.commit(ops).await?;
        Ok(MacTransition::Replaced { previous, current })
    }

    async fn remove(&self, entry: MacEntry) -> Result<MacTransition> {
        self.store.commit(delete_ops(&entry)).await?;
        Ok(MacTransition::Removed(entry))
    }

    /// Records `port` as the dynamic owner of `mac`.
    ///
    /// Relearning on the owning port changes nothing. A dynamic entry on
    /// another port is replaced; a static entry is left alone.
    pub async fn learn(
        &self,
        domain: &str,
        mac: MacAddress,
        port: &PortDescriptor,
        ip: Option<IpAddr>,
    ) -> Result<MacTransition> {
        match self.lookup(domain, &mac).await? {
            None => {
                self.create(self.new_entry(domain, mac, port, MacKind::Dynamic, ip))
                    .await
            }
            Some(existing) if existing.port == port.name || existing.is_static() => {
                Ok(MacTransition::Unchanged(existing))
            }
            Some(existing) => {
                let current = self.new_entry(domain, mac, port, MacKind::Dynamic, ip);
                self.replace(existing, current).await
            }
        }
    }

    /// Removes the entry for `mac` if `port` owns it.
    pub async fn unlearn(&self, domain: &str, mac: MacAddress, port: &str) -> Result<MacTransition> {
        match self.lookup(domain, &mac).await? {
            Some(existing) if existing.port == port => self.remove(existing).await,
            Some(existing) => Ok(MacTransition::Unchanged(existing)),
            None => Ok(MacTransition::Absent),
        }
    }

    /// Moves a dynamic entry from `from` to `to`.
    ///
    /// Stale requests (the entry moved on, or became static) change nothing.
    pub async fn migrate(
        &self,
        domain: &str,
        mac: MacAddress,
        from: &str,
        to: &PortDescriptor,
    ) -> Result<MacTransition> {
        match self.lookup(domain, &mac).await? {
            Some(existing) if existing.port == from && !existing.is_static() => {
                let current = self.new_entry(domain, mac, to, MacKind::Dynamic, existing.ip);
                self.replace(existing, current).await
            }
            Some(existing) => Ok(MacTransition::Unchanged(existing)),
            None => Ok(MacTransition::Absent),
        }
    }

    /// Entries of `domain` currently owned by `port`, found through the
    /// per-port index.
    ///
    /// Read-only: removal goes through [`unlearn`](Self::unlearn) under
    /// each MAC's own job key, so a concurrent move to another port wins.
    pub async fn owned_by_port(&self, domain: &str, port: &str) -> Result<Vec<MacEntry>> {
        let mut owned = Vec::new();
        for indexed in self.store.port_macs(port).await? {
            if indexed.domain != domain {
                continue;
            }
            match self.lookup(domain, &indexed.mac).await? {
                Some(current) if current.port == port => owned.push(current),
                _ => debug!(domain, port, mac = %indexed.mac, "Index record outlived its entry"),
            }
        }
        Ok(owned)
    }

    /// Installs a static entry, displacing whatever owned `mac` before.
    pub async fn add_static(
        &self,
        domain: &str,
        mac: MacAddress,
        port: &PortDescriptor,
        ip: Option<IpAddr>,
    ) -> Result<MacTransition> {
        let current = self.new_entry(domain, mac, port, MacKind::Static, ip);
        match self.lookup(domain, &mac).await? {
            None => self.create(current).await,
            Some(existing) if existing.is_static() && existing.port == port.name => {
                Ok(MacTransition::Unchanged(existing))
            }
            Some(existing) => self.replace(existing, current).await,
        }
    }

    pub async fn remove_static(&self, domain: &str, mac: MacAddress) -> Result<MacTransition> {
        match self.lookup(domain, &mac).await? {
            Some(existing) if existing.is_static() => self.remove(existing).await,
            Some(existing) => Ok(MacTransition::Unchanged(existing)),
            None => Ok(MacTransition::Absent),
        }
    }

    /// Removes a dynamic entry whose source rule idled out.
    pub async fn age_out(&self, domain: &str, mac: MacAddress) -> Result<MacTransition> {
        match self.lookup(domain, &mac).await? {
            Some(existing) if !existing.is_static() => self.remove(existing).await,
            Some(existing) => Ok(MacTransition::Unchanged(existing)),
            None => Ok(MacTransition::Absent),
        }
    }

    /// Removes the entry whatever its kind.
    pub async fn delete(&self, domain: &str, mac: MacAddress) -> Result<MacTransition> {
        match self.lookup(domain, &mac).await? {
            Some(existing) => self.remove(existing).await,
            None => Ok(MacTransition::Absent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStore, ManualClock};
    use elan_types::DatapathId;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        table: MacTable,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let table = MacTable::new(store.clone(), clock.clone());
        Fixture { store, clock, table }
    }

    fn mac() -> MacAddress {
        "00:00:00:00:00:0a".parse().unwrap()
    }

    fn port(name: &str, dpn: u64) -> PortDescriptor {
        PortDescriptor::new(name, DatapathId::new(dpn), 1)
    }

    #[tokio::test]
    async fn test_learn_creates_dynamic_entry() {
        let f = fixture();
        let t = f.table.learn("blue", mac(), &port("a", 1), None).await.unwrap();
        let entry = t.current().unwrap();
        assert_eq!(entry.kind, MacKind::Dynamic);
        assert_eq!(entry.port, "a");
        assert_eq!(entry.dpn, DatapathId::new(1));
        assert_eq!(f.store.port_macs("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_relearn_same_port_is_noop() {
        let f = fixture();
        f.table.learn("blue", mac(), &port("a", 1), None).await.unwrap();
        f.clock.advance(Duration::from_secs(5));
        let t = f.table.learn("blue", mac(), &port("a", 1), None).await.unwrap();
        assert!(!t.is_change());
        // Creation time is not refreshed
        assert_eq!(t.current().unwrap().created_at, chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_migrate_replaces_both_indexes() {
        let f = fixture();
        f.table.learn("blue", mac(), &port("a", 1), None).await.unwrap();

        let t = f.table.migrate("blue", mac(), "a", &port("b", 2)).await.unwrap();
        assert_eq!(t.displaced().unwrap().port, "a");
        assert_eq!(t.current().unwrap().port, "b");

        assert!(f.store.port_macs("a").await.unwrap().is_empty());
        assert_eq!(f.store.port_macs("b").await.unwrap().len(), 1);
        assert_eq!(f.store.mac_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_migrate_is_ignored() {
        let f = fixture();
        f.table.learn("blue", mac(), &port("a", 1), None).await.unwrap();

        let t = f.table.migrate("blue", mac(), "x", &port("b", 2)).await.unwrap();
        assert_eq!(t, MacTransition::Unchanged(f.table.lookup("blue", &mac()).await.unwrap().unwrap()));
    }

    #[tokio::test]
    async fn test_static_entry_protected_from_learning_and_aging() {
        let f = fixture();
        f.table.add_static("blue", mac(), &port("a", 1), None).await.unwrap();

        assert!(!f.table.learn("blue", mac(), &port("b", 2), None).await.unwrap().is_change());
        assert!(!f.table.migrate("blue", mac(), "a", &port("b", 2)).await.unwrap().is_change());
        assert!(!f.table.age_out("blue", mac()).await.unwrap().is_change());

        let t = f.table.remove_static("blue", mac()).await.unwrap();
        assert!(matches!(t, MacTransition::Removed(_)));
        assert_eq!(f.store.mac_count(), 0);
    }

    #[tokio::test]
    async fn test_static_replaces_dynamic() {
        let f = fixture();
        f.table.learn("blue", mac(), &port("a", 1), None).await.unwrap();
        let t = f.table.add_static("blue", mac(), &port("b", 2), None).await.unwrap();
        assert_eq!(t.current().unwrap().kind, MacKind::Static);
        assert_eq!(t.displaced().unwrap().kind, MacKind::Dynamic);
    }

    #[tokio::test]
    async fn test_owned_by_port() {
        let f = fixture();
        let other: MacAddress = "00:00:00:00:00:0b".parse().unwrap();
        f.table.learn("blue", mac(), &port("a", 1), None).await.unwrap();
        f.table.learn("blue", other, &port("a", 1), None).await.unwrap();
        f.table.learn("red", mac(), &port("c", 1), None).await.unwrap();

        let owned = f.table.owned_by_port("blue", "a").await.unwrap();
        assert_eq!(owned.iter().map(|e| e.mac).collect::<Vec<_>>(), vec![mac(), other]);
        // Enumeration leaves the table alone
        assert_eq!(f.store.mac_count(), 3);
    }

    #[tokio::test]
    async fn test_unlearn_after_move_keeps_new_owner() {
        let f = fixture();
        f.table.learn("blue", mac(), &port("a", 1), None).await.unwrap();
        let owned = f.table.owned_by_port("blue", "a").await.unwrap();
        assert_eq!(owned.len(), 1);

        // The entry moves before the removal of port a gets to it
        f.table.migrate("blue", mac(), "a", &port("b", 2)).await.unwrap();
        let t = f.table.unlearn("blue", mac(), "a").await.unwrap();

        assert!(!t.is_change());
        assert_eq!(f.table.lookup("blue", &mac()).await.unwrap().unwrap().port, "b");
        assert_eq!(f.store.port_macs("b").await.unwrap().len(), 1);
        assert!(f.store.port_macs("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlearn_only_by_owner() {
        let f = fixture();
        f.table.learn("blue", mac(), &port("a", 1), None).await.unwrap();
        assert!(!f.table.unlearn("blue", mac(), "b").await.unwrap().is_change());
        assert!(f.table.unlearn("blue", mac(), "a").await.unwrap().is_change());
        assert_eq!(f.table.unlearn("blue", mac(), "a").await.unwrap(), MacTransition::Absent);
    }
}
