//! Domain tag state machine.
//!
//! A domain is usable once its tag is allocated. Until then, interface
//! events naming it are parked in a bounded FIFO queue that is handed back
//! when the domain becomes active.

use crate::types::ElanDomain;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceOp {
    Add,
    Remove,
}

/// Interface event waiting for its domain's tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInterface {
    pub port: String,
    pub op: InterfaceOp,
}

impl PendingInterface {
    pub fn add(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            op: InterfaceOp::Add,
        }
    }

    pub fn remove(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            op: InterfaceOp::Remove,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DomainState {
    /// Tag allocation has not completed
    TagPending(VecDeque<PendingInterface>),
    Active(ElanDomain),
}

/// Outcome of submitting an interface event for a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Domain is active; process the event now
    Active(ElanDomain),
    /// Event queued until the domain is active
    Deferred,
}

pub struct DomainRegistry {
    states: DashMap<String, DomainState>,
    /// Base and leaf tags of active domains
    tags: DashMap<u32, String>,
    max_pending: usize,
}

impl DomainRegistry {
    pub fn new(max_pending: usize) -> Self {
        Self {
            states: DashMap::new(),
            tags: DashMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    fn push_bounded(&self, name: &str, queue: &mut VecDeque<PendingInterface>, event: PendingInterface) {
        if queue.len() >= self.max_pending {
            if let Some(dropped) = queue.pop_front() {
                warn!(domain = name, port = %dropped.port, op = ?dropped.op,
                    "Pending interface queue full, dropping oldest event");
            }
        }
        queue.push_back(event);
    }

    /// Returns the active domain, or parks `event` until it activates.
    ///
    /// Events for domains not created yet are parked as well.
    pub fn admit(&self, name: &str, event: PendingInterface) -> Admission {
        match self.states.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                DomainState::Active(domain) => Admission::Active(domain.clone()),
                DomainState::TagPending(queue) => {
                    self.push_bounded(name, queue, event);
                    Admission::Deferred
                }
            },
            Entry::Vacant(vacant) => {
                let mut queue = VecDeque::new();
                self.push_bounded(name, &mut queue, event);
                vacant.insert(DomainState::TagPending(queue));
                Admission::Deferred
            }
        }
    }

    /// Marks `name` as awaiting its tag unless it is already active.
    pub fn begin(&self, name: &str) -> Option<ElanDomain> {
        match self
            .states
            .entry(name.to_string())
            .or_insert_with(|| DomainState::TagPending(VecDeque::new()))
            .value()
        {
            DomainState::Active(domain) => Some(domain.clone()),
            DomainState::TagPending(_) => None,
        }
    }

    /// Activates `domain` and returns the parked events in arrival order.
    pub fn activate(&self, domain: ElanDomain) -> Vec<PendingInterface> {
        self.tags.insert(domain.tag, domain.name.clone());
        if let Some(leaf_tag) = domain.leaf_tag {
            self.tags.insert(leaf_tag, domain.name.clone());
        }

        match self
            .states
            .insert(domain.name.clone(), DomainState::Active(domain))
        {
            Some(DomainState::TagPending(queue)) => queue.into(),
            _ => Vec::new(),
        }
    }

    /// Replaces the record of an active domain.
    pub fn update(&self, domain: ElanDomain) {
        if let Some(mut state) = self.states.get_mut(&domain.name) {
            if let DomainState::Active(current) = state.value_mut() {
                *current = domain;
            }
        }
    }

    pub fn active(&self, name: &str) -> Option<ElanDomain> {
        match self.states.get(name)?.value() {
            DomainState::Active(domain) => Some(domain.clone()),
            DomainState::TagPending(_) => None,
        }
    }

    /// Active domain owning a base or leaf tag.
    pub fn resolve_tag(&self, tag: u32) -> Option<ElanDomain> {
        let name = self.tags.get(&tag)?.value().clone();
        self.active(&name)
    }

    pub fn active_domains(&self) -> Vec<ElanDomain> {
        let mut domains: Vec<ElanDomain> = self
            .states
            .iter()
            .filter_map(|state| match state.value() {
                DomainState::Active(domain) => Some(domain.clone()),
                DomainState::TagPending(_) => None,
            })
            .collect();
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        domains
    }

    pub fn pending_len(&self, name: &str) -> usize {
        match self.states.get(name).as_deref() {
            Some(DomainState::TagPending(queue)) => queue.len(),
            _ => 0,
        }
    }

    pub fn is_pending(&self, name: &str) -> bool {
        matches!(self.states.get(name).as_deref(), Some(DomainState::TagPending(_)))
    }

    /// Forgets a domain, dropping any parked events.
    pub fn remove(&self, name: &str) -> Option<DomainState> {
        let (_, state) = self.states.remove(name)?;
        if let DomainState::Active(domain) = &state {
            self.tags.remove(&domain.tag);
            if let Some(leaf_tag) = domain.leaf_tag {
                self.tags.remove(&leaf_tag);
            }
        }
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elan_types::SegmentationType;
    use pretty_assertions::assert_eq;

    fn domain(name: &str, tag: u32) -> ElanDomain {
        ElanDomain {
            name: name.into(),
            tag,
            segmentation: SegmentationType::Flat,
            segmentation_id: None,
            mac_timeout_secs: 300,
            leaf_tag: None,
        }
    }

    #[test]
    fn test_events_parked_until_active() {
        let registry = DomainRegistry::new(16);

        assert_eq!(registry.admit("blue", PendingInterface::add("p1")), Admission::Deferred);
        assert_eq!(registry.admit("blue", PendingInterface::remove("p1")), Admission::Deferred);
        assert!(registry.is_pending("blue"));
        assert_eq!(registry.pending_len("blue"), 2);

        let drained = registry.activate(domain("blue", 5000));
        assert_eq!(
            drained,
            vec![PendingInterface::add("p1"), PendingInterface::remove("p1")]
        );

        assert_eq!(
            registry.admit("blue", PendingInterface::add("p2")),
            Admission::Active(domain("blue", 5000))
        );
        assert_eq!(registry.pending_len("blue"), 0);
    }

    #[test]
    fn test_queue_drops_oldest_on_overflow() {
        let registry = DomainRegistry::new(2);
        registry.admit("blue", PendingInterface::add("p1"));
        registry.admit("blue", PendingInterface::add("p2"));
        registry.admit("blue", PendingInterface::add("p3"));

        let drained = registry.activate(domain("blue", 5000));
        assert_eq!(drained, vec![PendingInterface::add("p2"), PendingInterface::add("p3")]);
    }

    #[test]
    fn test_begin_keeps_queue() {
        let registry = DomainRegistry::new(16);
        registry.admit("blue", PendingInterface::add("p1"));
        assert!(registry.begin("blue").is_none());
        assert_eq!(registry.pending_len("blue"), 1);

        registry.activate(domain("blue", 5000));
        assert!(registry.begin("blue").is_some());
    }

    #[test]
    fn test_resolve_tags() {
        let registry = DomainRegistry::new(16);
        let mut etree = domain("red", 5001);
        etree.leaf_tag = Some(5002);
        registry.activate(domain("blue", 5000));
        registry.activate(etree.clone());

        assert_eq!(registry.resolve_tag(5002), Some(etree));
        assert_eq!(registry.resolve_tag(5000).unwrap().name, "blue");
        assert!(registry.resolve_tag(9999).is_none());

        registry.remove("red");
        assert!(registry.resolve_tag(5002).is_none());
        assert_eq!(registry.active_domains().len(), 1);
    }

    #[test]
    fn test_update_active_domain() {
        let registry = DomainRegistry::new(16);
        registry.activate(domain("blue", 5000));

        let mut updated = domain("blue", 5000);
        updated.mac_timeout_secs = 60;
        registry.update(updated);
        assert_eq!(registry.active("blue").unwrap().mac_timeout_secs, 60);
    }
}
