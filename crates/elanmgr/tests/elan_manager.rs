//! End-to-end tests of the ELAN manager against the in-memory collaborators.

use elan_types::{DatapathId, EtreeRole, MacAddress};
use elanmgr::learning::{DomainRef, UnknownSourceEvent};
use elanmgr::memory::{InMemoryCollaborators, ManualClock, SwitchCall};
use elanmgr::programming::{
    local_group_id, remote_group_id, Action, Bucket, FlowId, FlowTable,
};
use elanmgr::types::{DomainConfig, PortDescriptor};
use elanmgr::{ElanConfig, ElanManager};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const S1: DatapathId = DatapathId::new(1000);
const S2: DatapathId = DatapathId::new(2000);
const S3: DatapathId = DatapathId::new(3000);

struct Harness {
    env: InMemoryCollaborators,
    clock: Arc<ManualClock>,
    manager: ElanManager,
}

impl Harness {
    fn new() -> Self {
        let mut config = ElanConfig::default();
        config.groups.settle_delay_ms = 0;
        config.jobs.retry_backoff_ms = 1;

        let clock = Arc::new(ManualClock::default());
        let env = InMemoryCollaborators::new(&config, clock.clone());
        let manager = ElanManager::new(config, env.collaborators());
        Self {
            env,
            clock,
            manager,
        }
    }

    async fn create(&self, config: DomainConfig) -> u32 {
        let name = config.name.clone();
        self.manager.create_domain(config).unwrap();
        self.manager.wait_idle().await;
        self.manager.domain(&name).unwrap().tag
    }

    async fn join(&self, domain: &str, port: PortDescriptor) {
        let name = port.name.clone();
        self.env.interfaces.insert(port);
        self.manager.add_interface(domain, &name);
        self.manager.wait_idle().await;
    }

    async fn leave(&self, domain: &str, port: &str) {
        self.manager.remove_interface(domain, port);
        self.manager.wait_idle().await;
    }

    async fn packet_in(&self, domain: &str, mac: MacAddress, dpn: DatapathId, port_tag: u32) {
        self.manager.on_unknown_source(UnknownSourceEvent {
            domain: DomainRef::Name(domain.to_string()),
            mac,
            dpn,
            port_tag,
            ip: None,
        });
        self.manager.wait_idle().await;
    }

    fn buckets(&self, dpn: DatapathId, id: u64) -> Vec<Bucket> {
        self.env
            .switch
            .group(dpn, id)
            .map(|group| group.buckets)
            .unwrap_or_default()
    }

    fn tunnel_remotes(&self, dpn: DatapathId, id: u64) -> Vec<DatapathId> {
        self.buckets(dpn, id)
            .iter()
            .filter_map(Bucket::tunnel_remote)
            .collect()
    }
}

fn mac(last: u8) -> MacAddress {
    MacAddress::new([0, 0, 0, 0, 0, last])
}

fn tunnel_bucket(key: u64, remote: DatapathId) -> Bucket {
    Bucket::new(vec![
        Action::SetTunnelId { key },
        Action::OutputTunnel { remote },
    ])
}

#[tokio::test]
async fn test_two_switch_scenario() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::vxlan("D", 100)).await;
    assert_eq!(tag, 5000);

    h.join("D", PortDescriptor::new("p1", S1, 1)).await;
    h.join("D", PortDescriptor::new("p2", S2, 2)).await;

    let membership = h.manager.membership();
    assert_eq!(membership.entry("D", S1).await.unwrap().unwrap().ports, vec!["p1"]);
    assert_eq!(membership.entry("D", S2).await.unwrap().unwrap().ports, vec!["p2"]);

    let (local, remote) = (local_group_id(tag), remote_group_id(tag));
    assert_eq!(h.buckets(S1, local), vec![Bucket::output(1)]);
    assert_eq!(
        h.buckets(S1, remote),
        vec![Bucket::to_group(local), tunnel_bucket(100, S2)]
    );
    assert_eq!(h.buckets(S2, local), vec![Bucket::output(2)]);
    assert_eq!(
        h.buckets(S2, remote),
        vec![Bucket::to_group(local), tunnel_bucket(100, S1)]
    );
    assert_eq!(h.env.switch.flows_in_table(S2, FlowTable::ExternalTunnel).len(), 1);

    h.leave("D", "p2").await;

    assert!(membership.entry("D", S2).await.unwrap().is_none());
    assert!(h.env.switch.groups_on(S2).is_empty());
    assert!(h.env.switch.flows_on(S2).is_empty());
    assert_eq!(h.buckets(S1, remote), vec![Bucket::to_group(local)]);
    assert_eq!(h.buckets(S1, local), vec![Bucket::output(1)]);
}

#[tokio::test]
async fn test_third_switch_fans_out() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    let remote = remote_group_id(tag);

    h.join("blue", PortDescriptor::new("a", S1, 1)).await;
    h.join("blue", PortDescriptor::new("b", S2, 1)).await;
    assert_eq!(h.tunnel_remotes(S1, remote), vec![S2]);
    assert_eq!(h.tunnel_remotes(S2, remote), vec![S1]);

    h.join("blue", PortDescriptor::new("c", S3, 1)).await;

    assert_eq!(h.tunnel_remotes(S1, remote), vec![S2, S3]);
    assert_eq!(h.tunnel_remotes(S2, remote), vec![S1, S3]);
    assert_eq!(h.tunnel_remotes(S3, remote), vec![S1, S2]);
    assert_eq!(h.buckets(S3, remote).len(), 3);
}

#[tokio::test]
async fn test_second_port_on_switch_only_updates_local_group() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;

    h.join("blue", PortDescriptor::new("a", S1, 1)).await;
    h.join("blue", PortDescriptor::new("b", S2, 1)).await;
    h.join("blue", PortDescriptor::new("a2", S1, 2)).await;

    assert_eq!(
        h.buckets(S1, local_group_id(tag)),
        vec![Bucket::output(1), Bucket::output(2)]
    );
    assert_eq!(h.tunnel_remotes(S2, remote_group_id(tag)), vec![S1]);

    // Removing one of two ports keeps the switch a member
    h.leave("blue", "a").await;
    assert!(h.manager.membership().is_member_switch("blue", S1).await.unwrap());
    assert_eq!(h.buckets(S1, local_group_id(tag)), vec![Bucket::output(2)]);
    assert_eq!(h.tunnel_remotes(S2, remote_group_id(tag)), vec![S1]);
}

#[tokio::test]
async fn test_local_group_withdrawn_when_only_external_port_left() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    h.join("blue", PortDescriptor::new("p1", S1, 1)).await;
    h.join("blue", PortDescriptor::new("trunk", S1, 9).with_external(true)).await;
    h.join("blue", PortDescriptor::new("p2", S2, 2)).await;

    h.leave("blue", "p1").await;

    assert!(h.manager.membership().is_member_switch("blue", S1).await.unwrap());
    assert!(h.env.switch.group(S1, local_group_id(tag)).is_none());
    assert_eq!(h.buckets(S1, remote_group_id(tag)), vec![tunnel_bucket(u64::from(tag), S2)]);
}

#[tokio::test]
async fn test_leaf_group_withdrawn_when_last_root_leaves() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("tree").with_etree()).await;
    let leaf_tag = h.manager.domain("tree").unwrap().leaf_tag.unwrap();
    h.join("tree", PortDescriptor::new("r1", S1, 1).with_role(EtreeRole::Root)).await;
    h.join("tree", PortDescriptor::new("l1", S1, 2).with_role(EtreeRole::Leaf)).await;
    assert_eq!(h.buckets(S1, local_group_id(leaf_tag)), vec![Bucket::output(1)]);

    h.leave("tree", "r1").await;

    assert!(h.env.switch.group(S1, local_group_id(leaf_tag)).is_none());
    assert!(h.env.switch.group(S1, remote_group_id(leaf_tag)).is_none());
    assert_eq!(h.buckets(S1, local_group_id(tag)), vec![Bucket::output(2)]);
}

#[tokio::test]
async fn test_join_installs_groups_before_flood_rules() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    h.join("blue", PortDescriptor::new("a", S1, 1)).await;

    let calls = h.env.switch.calls_on(S1);
    let at = |call: SwitchCall| calls.iter().position(|c| *c == call).unwrap();
    let remote_group = at(SwitchCall::InstallGroup(remote_group_id(tag)));
    let local_group = at(SwitchCall::InstallGroup(local_group_id(tag)));
    assert!(local_group < remote_group);
    assert!(remote_group < at(SwitchCall::InstallFlow(FlowId::unknown_dmac(S1, tag, false))));
    assert!(remote_group < at(SwitchCall::InstallFlow(FlowId::unknown_dmac(S1, tag, true))));
}

#[tokio::test]
async fn test_packet_in_on_departed_port_not_learned() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    h.join("blue", PortDescriptor::new("a", S1, 4)).await;
    h.join("blue", PortDescriptor::new("b", S2, 7)).await;
    h.leave("blue", "a").await;

    let m = mac(0x20);
    h.packet_in("blue", m, S1, 4).await;

    assert!(h.manager.mac_table().lookup("blue", &m).await.unwrap().is_none());
    assert!(h.env.switch.flows_on(S1).is_empty());
    assert!(h.env.switch.flow(S2, &FlowId::dmac(S2, tag, &m)).is_none());
    let stats = h.manager.learning_stats();
    assert_eq!((stats.learned, stats.dropped), (0, 1));
}

#[tokio::test]
async fn test_port_removal_spares_mac_that_moved_away() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    h.join("blue", PortDescriptor::new("a", S1, 4)).await;
    h.join("blue", PortDescriptor::new("a2", S1, 5)).await;
    h.join("blue", PortDescriptor::new("b", S2, 7)).await;
    let m = mac(0x21);

    h.packet_in("blue", m, S1, 4).await;
    h.clock.advance(Duration::from_secs(2));
    h.packet_in("blue", m, S2, 7).await;
    h.leave("blue", "a").await;

    let entry = h.manager.mac_table().lookup("blue", &m).await.unwrap().unwrap();
    assert_eq!(entry.port, "b");
    assert!(h.env.switch.flow(S2, &FlowId::smac(S2, tag, &m)).is_some());
    assert_eq!(
        h.env.switch.flow(S1, &FlowId::dmac(S1, tag, &m)).unwrap().actions,
        vec![Action::SetTunnelId { key: u64::from(tag) }, Action::OutputTunnel { remote: S2 }]
    );
    assert_eq!(h.env.store.mac_count(), 1);
}

#[tokio::test]
async fn test_anti_churn_window_then_migration() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    h.join("blue", PortDescriptor::new("a", S1, 4)).await;
    h.join("blue", PortDescriptor::new("b", S2, 7)).await;
    let m = mac(0x0a);

    h.packet_in("blue", m, S1, 4).await;
    assert_eq!(h.manager.mac_table().lookup("blue", &m).await.unwrap().unwrap().port, "a");
    assert!(h.env.switch.flow(S1, &FlowId::smac(S1, tag, &m)).is_some());
    assert_eq!(
        h.env.switch.flow(S2, &FlowId::dmac(S2, tag, &m)).unwrap().actions,
        vec![Action::SetTunnelId { key: u64::from(tag) }, Action::OutputTunnel { remote: S1 }]
    );

    h.clock.advance(Duration::from_millis(500));
    h.packet_in("blue", m, S2, 7).await;
    assert_eq!(h.manager.mac_table().lookup("blue", &m).await.unwrap().unwrap().port, "a");

    h.clock.advance(Duration::from_millis(1000));
    h.packet_in("blue", m, S2, 7).await;
    assert_eq!(h.manager.mac_table().lookup("blue", &m).await.unwrap().unwrap().port, "b");

    assert!(h.env.switch.flow(S1, &FlowId::smac(S1, tag, &m)).is_none());
    assert!(h.env.switch.flow(S2, &FlowId::smac(S2, tag, &m)).is_some());
    assert_eq!(
        h.env.switch.flow(S1, &FlowId::dmac(S1, tag, &m)).unwrap().actions,
        vec![Action::SetTunnelId { key: u64::from(tag) }, Action::OutputTunnel { remote: S2 }]
    );
    assert_eq!(
        h.env.switch.flow(S2, &FlowId::dmac(S2, tag, &m)).unwrap().actions,
        vec![Action::Output { port_tag: 7 }]
    );

    let stats = h.manager.learning_stats();
    assert_eq!((stats.learned, stats.migrated, stats.ignored), (1, 1, 1));
}

#[tokio::test]
async fn test_port_removal_clears_mac_rules_everywhere() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    h.join("blue", PortDescriptor::new("a", S1, 4)).await;
    h.join("blue", PortDescriptor::new("b", S2, 7)).await;
    h.join("blue", PortDescriptor::new("c", S3, 1)).await;
    let m = mac(0x0b);

    h.packet_in("blue", m, S1, 4).await;
    for dpn in [S2, S3] {
        assert!(h.env.switch.flow(dpn, &FlowId::dmac(dpn, tag, &m)).is_some());
    }

    h.leave("blue", "a").await;

    assert!(h.manager.mac_table().lookup("blue", &m).await.unwrap().is_none());
    for dpn in [S1, S2, S3] {
        assert!(h.env.switch.flow(dpn, &FlowId::dmac(dpn, tag, &m)).is_none());
        assert!(h.env.switch.flow(dpn, &FlowId::smac(dpn, tag, &m)).is_none());
    }
    assert_eq!(h.tunnel_remotes(S2, remote_group_id(tag)), vec![S3]);
}

#[tokio::test]
async fn test_new_switch_catches_up_on_known_macs() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    h.join("blue", PortDescriptor::new("a", S1, 4)).await;
    let m = mac(0x0c);
    h.packet_in("blue", m, S1, 4).await;

    h.join("blue", PortDescriptor::new("b", S2, 7)).await;

    assert_eq!(
        h.env.switch.flow(S2, &FlowId::dmac(S2, tag, &m)).unwrap().actions,
        vec![Action::SetTunnelId { key: u64::from(tag) }, Action::OutputTunnel { remote: S1 }]
    );
}

#[tokio::test]
async fn test_interfaces_wait_for_domain_tag() {
    let h = Harness::new();
    h.env.interfaces.insert(PortDescriptor::new("p1", S1, 1));
    h.env.interfaces.insert(PortDescriptor::new("p2", S2, 2));

    h.manager.add_interface("late", "p1");
    h.manager.add_interface("late", "p2");
    h.manager.wait_idle().await;
    assert!(h.manager.domains().is_pending("late"));
    assert_eq!(h.manager.domains().pending_len("late"), 2);
    assert!(h.env.switch.dump().is_empty());

    let tag = h.create(DomainConfig::new("late")).await;

    let membership = h.manager.membership();
    assert_eq!(membership.entry("late", S1).await.unwrap().unwrap().ports, vec!["p1"]);
    assert_eq!(membership.entry("late", S2).await.unwrap().unwrap().ports, vec!["p2"]);
    assert_eq!(h.buckets(S1, local_group_id(tag)), vec![Bucket::output(1)]);
    assert_eq!(h.tunnel_remotes(S1, remote_group_id(tag)), vec![S2]);
    assert_eq!(h.tunnel_remotes(S2, remote_group_id(tag)), vec![S1]);
}

#[tokio::test]
async fn test_etree_domain_groups() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("tree").with_etree()).await;
    let leaf_tag = h.manager.domain("tree").unwrap().leaf_tag.unwrap();
    assert_eq!((tag, leaf_tag), (5000, 5001));

    h.join("tree", PortDescriptor::new("r1", S1, 1).with_role(EtreeRole::Root)).await;
    h.join("tree", PortDescriptor::new("l1", S1, 2).with_role(EtreeRole::Leaf)).await;
    h.join("tree", PortDescriptor::new("l2", S2, 3).with_role(EtreeRole::Leaf)).await;

    assert_eq!(
        h.buckets(S1, local_group_id(tag)),
        vec![Bucket::output(1), Bucket::output(2)]
    );
    assert_eq!(h.buckets(S1, local_group_id(leaf_tag)), vec![Bucket::output(1)]);

    // S2 has only leaves: no leaf-segment local group to install
    assert_eq!(h.buckets(S2, local_group_id(tag)), vec![Bucket::output(3)]);
    assert!(h.env.switch.group(S2, local_group_id(leaf_tag)).is_none());
    assert_eq!(
        h.buckets(S2, remote_group_id(leaf_tag)),
        vec![tunnel_bucket(u64::from(leaf_tag), S1)]
    );

    // Leaf-to-leaf unicast is dropped on the leaf segment
    let m = mac(0x0d);
    h.packet_in("tree", m, S2, 3).await;
    for dpn in [S1, S2] {
        assert_eq!(
            h.env.switch.flow(dpn, &FlowId::dmac(dpn, leaf_tag, &m)).unwrap().actions,
            vec![Action::Drop]
        );
    }
}

#[tokio::test]
async fn test_static_mac_lifecycle() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    let m = mac(0x0e);
    h.join("blue", PortDescriptor::new("a", S1, 4).with_static_mac(m)).await;
    h.join("blue", PortDescriptor::new("b", S2, 7)).await;

    let entry = h.manager.mac_table().lookup("blue", &m).await.unwrap().unwrap();
    assert!(entry.is_static());
    assert_eq!(h.env.switch.flow(S1, &FlowId::smac(S1, tag, &m)).unwrap().idle_timeout_secs, 0);
    assert!(h.env.switch.flow(S2, &FlowId::dmac(S2, tag, &m)).is_some());

    // Neither learning nor aging moves a static entry
    h.clock.advance(Duration::from_secs(10));
    h.packet_in("blue", m, S2, 7).await;
    h.manager.on_mac_aged("blue", m);
    h.manager.wait_idle().await;
    assert_eq!(h.manager.mac_table().lookup("blue", &m).await.unwrap().unwrap().port, "a");

    h.manager.remove_static_mac("blue", m);
    h.manager.wait_idle().await;
    assert!(h.manager.mac_table().lookup("blue", &m).await.unwrap().is_none());
    assert!(h.env.switch.flow(S1, &FlowId::smac(S1, tag, &m)).is_none());
    assert!(h.env.switch.flow(S2, &FlowId::dmac(S2, tag, &m)).is_none());
}

#[tokio::test]
async fn test_aged_dynamic_mac_removed() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    h.join("blue", PortDescriptor::new("a", S1, 4)).await;
    h.join("blue", PortDescriptor::new("b", S2, 7)).await;
    let m = mac(0x0f);
    h.packet_in("blue", m, S1, 4).await;

    h.manager.on_mac_aged("blue", m);
    h.manager.wait_idle().await;

    assert!(h.manager.mac_table().lookup("blue", &m).await.unwrap().is_none());
    assert!(h.env.switch.flow(S1, &FlowId::smac(S1, tag, &m)).is_none());
    assert!(h.env.switch.flow(S2, &FlowId::dmac(S2, tag, &m)).is_none());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = Harness::new();
    h.env.store.fail_next_commits(1);
    let tag = h.create(DomainConfig::new("blue")).await;

    h.env.switch.fail_next_calls(2);
    h.join("blue", PortDescriptor::new("a", S1, 1)).await;

    assert_eq!(h.buckets(S1, local_group_id(tag)), vec![Bucket::output(1)]);
    let stats = h.manager.job_stats();
    assert_eq!(stats.retried, 3);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_update_changes_mac_timeout_only() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    h.join("blue", PortDescriptor::new("a", S1, 4)).await;
    let m = mac(0x10);
    h.packet_in("blue", m, S1, 4).await;
    assert_eq!(h.env.switch.flow(S1, &FlowId::smac(S1, tag, &m)).unwrap().idle_timeout_secs, 300);

    h.manager
        .update_domain(DomainConfig::vxlan("blue", 55).with_mac_timeout(60));
    h.manager.wait_idle().await;

    let domain = h.manager.domain("blue").unwrap();
    assert_eq!(domain.mac_timeout_secs, 60);
    assert_eq!(domain.segmentation_id, None);
    assert_eq!(h.env.switch.flow(S1, &FlowId::smac(S1, tag, &m)).unwrap().idle_timeout_secs, 60);
}

#[tokio::test]
async fn test_tunnel_down_and_up_repairs_groups() {
    let h = Harness::new();
    let tag = h.create(DomainConfig::new("blue")).await;
    let remote = remote_group_id(tag);
    h.join("blue", PortDescriptor::new("a", S1, 4)).await;
    h.join("blue", PortDescriptor::new("b", S2, 7)).await;
    let m = mac(0x11);
    h.packet_in("blue", m, S1, 4).await;

    h.env.tunnels.set_link(S1, S2, false);
    h.manager.on_tunnel_state_changed(S1, S2, false);
    h.manager.wait_idle().await;
    assert_eq!(h.tunnel_remotes(S1, remote), Vec::<DatapathId>::new());
    assert_eq!(h.tunnel_remotes(S2, remote), Vec::<DatapathId>::new());
    assert!(h.env.switch.flow(S2, &FlowId::dmac(S2, tag, &m)).is_none());

    h.env.tunnels.set_link(S1, S2, true);
    h.manager.on_tunnel_state_changed(S1, S2, true);
    h.manager.wait_idle().await;
    assert_eq!(h.tunnel_remotes(S1, remote), vec![S2]);
    assert_eq!(h.tunnel_remotes(S2, remote), vec![S1]);
    assert!(h.env.switch.flow(S2, &FlowId::dmac(S2, tag, &m)).is_some());
}

#[tokio::test]
async fn test_delete_domain_cleans_everything() {
    let h = Harness::new();
    h.create(DomainConfig::new("blue").with_etree()).await;
    h.join("blue", PortDescriptor::new("a", S1, 4).with_role(EtreeRole::Root)).await;
    h.join("blue", PortDescriptor::new("b", S2, 7).with_role(EtreeRole::Leaf)).await;
    h.packet_in("blue", mac(0x12), S1, 4).await;
    assert_eq!(h.env.tags.allocated("elan.ids.pool"), 2);

    h.manager.delete_domain("blue");
    h.manager.wait_idle().await;

    assert!(h.manager.domain("blue").is_none());
    assert!(h.env.switch.dump().is_empty());
    assert_eq!(h.env.store.membership_count(), 0);
    assert_eq!(h.env.store.mac_count(), 0);
    assert_eq!(h.env.tags.allocated("elan.ids.pool"), 0);

    // The released tag is handed out again
    assert_eq!(h.create(DomainConfig::new("red")).await, 5000);
}

#[tokio::test]
async fn test_invalid_domain_rejected() {
    let h = Harness::new();
    let mut config = DomainConfig::vxlan("bad", 1);
    config.segmentation_id = None;
    assert!(h.manager.create_domain(config).is_err());
    assert!(h.manager.create_domain(DomainConfig::new("")).is_err());
}
