use lakegrid::{
    start_in_memory_member, InMemoryHub, Member, MemberConfig, NodeCapacity, NodeId, Options,
    PartitionId, PartitionStore, RoleSnapshot,
};
use bytes::Bytes;
use slog::Drain;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::time::{Duration, Instant};

#[tokio::test]
async fn leader_election_converges() {
    let hub = InMemoryHub::new(test_root_logger("hub".to_string()));
    let members = start_members(&hub, 3, "elect");

    let leader_id = discover_leader(&members, Duration::from_secs(10)).await;

    // Every member eventually agrees on who leads.
    let deadline = Instant::now() + Duration::from_secs(10);
    'outer: loop {
        assert!(Instant::now() < deadline, "Members never agreed on the leader");

        for member in members.values() {
            let status = member.consensus.status().await.expect("Engine exited");
            if status.leader.as_ref().map(|l| l.as_str().to_string()) != Some(leader_id.clone()) {
                sleep_ms(50).await;
                continue 'outer;
            }
        }
        break;
    }
}

#[tokio::test]
async fn at_most_one_leader_per_term_across_a_partition() {
    let hub = InMemoryHub::new(test_root_logger("hub".to_string()));
    let members = start_members(&hub, 5, "quorum");

    let first_leader = discover_leader(&members, Duration::from_secs(10)).await;

    // Cut the leader off and let the rest elect a replacement.
    hub.disconnect(&NodeId::new(first_leader.as_str()));
    let second_leader = discover_leader_excluding(
        &members,
        Some(first_leader.clone()),
        Duration::from_secs(10),
    )
    .await;
    assert_ne!(first_leader, second_leader);

    // Heal the partition and keep sampling: no two members may ever claim
    // leadership of the same term.
    hub.reconnect(&NodeId::new(first_leader.as_str()));
    for _ in 0..20 {
        assert_single_leader_per_term(&members).await;
        sleep_ms(100).await;
    }
}

#[tokio::test]
async fn isolated_minority_never_elects_a_leader() {
    let hub = InMemoryHub::new(test_root_logger("hub".to_string()));
    let members = start_members(&hub, 3, "minority");

    let leader_id = discover_leader(&members, Duration::from_secs(10)).await;

    // Isolate both followers. Each is now a minority of one and may campaign
    // forever without ever winning.
    let follower_ids: Vec<String> = members
        .keys()
        .filter(|id| **id != leader_id)
        .cloned()
        .collect();
    for follower_id in &follower_ids {
        hub.disconnect(&NodeId::new(follower_id.as_str()));
    }

    let watch_until = Instant::now() + Duration::from_secs(2);
    while Instant::now() < watch_until {
        for follower_id in &follower_ids {
            let status = members[follower_id].consensus.status().await.expect("Engine exited");
            assert_ne!(
                status.role,
                RoleSnapshot::Leader,
                "Isolated member {} elected itself",
                follower_id,
            );
        }
        sleep_ms(100).await;
    }
}

#[tokio::test]
async fn end_to_end_assign_fail_and_recover() {
    let hub = InMemoryHub::new(test_root_logger("hub".to_string()));
    let members = start_members(&hub, 1, "endtoend");
    let core = members.values().next().unwrap();

    // A single-member core elects itself once the first timeout fires.
    discover_leader(&members, Duration::from_secs(10)).await;

    let dm = &core.distribution;
    assert!(dm.register_node(NodeId::new("n1"), capacity_on_rack("r1")).await);
    assert!(dm.register_node(NodeId::new("n2"), capacity_on_rack("r2")).await);
    assert!(dm.register_node(NodeId::new("n3"), capacity_on_rack("r3")).await);

    // One seed node; the other two are auto-selected by lowest load.
    let p1 = PartitionId::new("p1");
    assert!(
        dm.assign_partition(p1.clone(), vec![NodeId::new("n1")], Some(3))
            .await
    );
    assert_eq!(
        dm.get_partition_locations(&p1),
        vec![NodeId::new("n1"), NodeId::new("n2"), NodeId::new("n3")]
    );

    // The data path fills in real bytes and the replicas catch up.
    let store = dm.replication().store().clone();
    for node in ["n1", "n2", "n3"].iter() {
        store
            .write_all(&NodeId::new(*node), &p1, Bytes::from_static(b"answer-42"))
            .unwrap();
    }
    dm.replication().mark_synced(&p1, &NodeId::new("n2"));
    dm.replication().mark_synced(&p1, &NodeId::new("n3"));

    // A fourth node joins, then the primary dies.
    assert!(dm.register_node(NodeId::new("n4"), capacity_on_rack("r4")).await);
    dm.handle_node_failure(&NodeId::new("n1")).await.unwrap();

    assert_eq!(
        dm.get_partition_locations(&p1),
        vec![NodeId::new("n2"), NodeId::new("n3"), NodeId::new("n4")]
    );
    // The restored copy carries the replica's bytes.
    assert_eq!(
        store.read_all(&NodeId::new("n4"), &p1).unwrap().unwrap(),
        Bytes::from_static(b"answer-42")
    );

    // Every mutation traveled through the consensus log.
    let status = core.consensus.status().await.expect("Engine exited");
    assert!(status.commit_index.is_some());
    assert!(status.commit_index.unwrap().as_u64() >= 4);
}

fn start_members(hub: &std::sync::Arc<InMemoryHub>, count: usize, tag: &str) -> HashMap<String, Member> {
    let member_ids: Vec<String> = (0..count).map(member_id).collect();

    let mut members = HashMap::with_capacity(count);
    for id in &member_ids {
        let config = MemberConfig {
            my_node_id: id.clone(),
            members: member_ids.clone(),
            backup_directory: temp_dir(tag, id),
            consensus_log_directory: None,
            logger: test_root_logger(id.clone()),
            options: Options::default(),
        };
        let member = start_in_memory_member(hub, config).expect("Member failed to start");
        members.insert(id.clone(), member);
    }

    members
}

fn member_id(id: usize) -> String {
    format!("member-{}", id + 1)
}

fn capacity_on_rack(rack: &str) -> NodeCapacity {
    NodeCapacity {
        storage_bytes: 10_000_000_000,
        memory_bytes: 8_000_000_000,
        cpu_cores: 4,
        network_bandwidth_mbps: 1_000,
        max_partitions: 64,
        rack_id: rack.to_string(),
        datacenter_id: "dc1".to_string(),
        zone: "z1".to_string(),
    }
}

fn temp_dir(tag: &str, member: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "lakegrid-test-{}-{}-{:016x}",
        tag,
        member,
        rand::random::<u64>()
    ));
    dir
}

async fn discover_leader(members: &HashMap<String, Member>, timeout: Duration) -> String {
    discover_leader_excluding(members, None, timeout).await
}

async fn discover_leader_excluding(
    members: &HashMap<String, Member>,
    excluded: Option<String>,
    timeout: Duration,
) -> String {
    let deadline = Instant::now() + timeout;
    loop {
        assert!(Instant::now() < deadline, "Timeout waiting for leader election");

        for (id, member) in members {
            if Some(id) == excluded.as_ref() {
                continue;
            }
            let status = member.consensus.status().await.expect("Engine exited");
            if status.role == RoleSnapshot::Leader {
                return id.clone();
            }
        }
        sleep_ms(50).await;
    }
}

async fn assert_single_leader_per_term(members: &HashMap<String, Member>) {
    let mut leaders_by_term: HashMap<u64, Vec<String>> = HashMap::new();
    for (id, member) in members {
        let status = member.consensus.status().await.expect("Engine exited");
        if status.role == RoleSnapshot::Leader {
            leaders_by_term
                .entry(status.term.as_u64())
                .or_default()
                .push(id.clone());
        }
    }

    for (term, leaders) in leaders_by_term {
        assert!(
            leaders.len() <= 1,
            "Term {} has multiple leaders: {:?}",
            term,
            leaders,
        );
    }
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn test_root_logger(member_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("Member" => member_id))
}
