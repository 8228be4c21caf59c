//! Event script replay through the manager.

use elan_types::DatapathId;
use elanmgr::events::{apply, parse_events};
use elanmgr::memory::{InMemoryCollaborators, ManualClock};
use elanmgr::programming::{local_group_id, remote_group_id, Action, FlowTable};
use elanmgr::{ElanConfig, ElanManager};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const SCRIPT: &str = r#"
# two switches, one vxlan domain, one gateway
{"op":"create_domain","name":"blue","segmentation":"vxlan","segmentation_id":7000}
{"op":"register_port","name":"p1","dpn":1000,"port_tag":1}
{"op":"register_port","name":"p2","dpn":2000,"port_tag":2}
{"op":"attach_gateway","domain":"blue","device":"hwvtep0"}
{"op":"add_interface","domain":"blue","port":"p1"}
{"op":"add_interface","domain":"blue","port":"p2"}
{"op":"unknown_source","domain":5000,"mac":"00:00:00:00:00:aa","dpn":1000,"port_tag":1}
"#;

async fn replay(script: &str) -> (InMemoryCollaborators, ElanManager) {
    let mut config = ElanConfig::default();
    config.groups.settle_delay_ms = 0;
    let env = InMemoryCollaborators::new(&config, Arc::new(ManualClock::default()));
    let manager = ElanManager::new(config, env.collaborators());

    for event in parse_events(script).unwrap() {
        apply(&manager, &env, event).unwrap();
        manager.wait_idle().await;
    }
    (env, manager)
}

#[tokio::test]
async fn test_replay_programs_both_switches() {
    let (env, manager) = replay(SCRIPT).await;
    let s1 = DatapathId::new(1000);
    let s2 = DatapathId::new(2000);

    let dump = env.switch.dump();
    assert_eq!(dump.iter().map(|d| d.dpn).collect::<Vec<_>>(), vec![s1, s2]);

    let remote = env.switch.group(s1, remote_group_id(5000)).unwrap();
    assert_eq!(remote.buckets.len(), 3);
    assert_eq!(remote.buckets[1].tunnel_remote(), Some(s2));
    assert_eq!(
        remote.buckets[2].actions,
        vec![
            Action::SetTunnelId { key: 7000 },
            Action::OutputGateway {
                device: "hwvtep0".to_string()
            }
        ]
    );
    assert!(env.switch.group(s2, local_group_id(5000)).is_some());

    assert_eq!(env.switch.flows_in_table(s1, FlowTable::Smac).len(), 1);
    assert_eq!(env.switch.flows_in_table(s2, FlowTable::Dmac).len(), 1);
    assert_eq!(manager.learning_stats().learned, 1);
    assert_eq!(manager.job_stats().failed, 0);

    let json = serde_json::to_string(&dump).unwrap();
    assert!(json.contains(r#""type":"output_gateway""#));
}

#[tokio::test]
async fn test_replay_teardown() {
    let script = format!(
        "{}\n{}\n{}",
        SCRIPT,
        r#"{"op":"remove_interface","domain":"blue","port":"p2"}"#,
        r#"{"op":"delete_domain","name":"blue"}"#
    );
    let (env, manager) = replay(&script).await;

    assert!(env.switch.dump().is_empty());
    assert!(manager.domain("blue").is_none());
}
