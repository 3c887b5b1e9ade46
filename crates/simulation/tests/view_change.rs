//! Primary failure and view change.

use palisade_bft::{BftConfig, ViewChangePhase};
use palisade_node::ReplicaConfig;
use palisade_simulation::{NetworkConfig, SimulationConfig, SimulationRunner};
use palisade_types::{BatchId, ClientId, ClientRequest, Operation, ReplicaId, SeqNum, ShardId, View};
use std::time::Duration;
use tracing_test::traced_test;

const LIMIT: Duration = Duration::from_secs(10);

fn config() -> SimulationConfig {
    SimulationConfig {
        network: NetworkConfig::default(),
        replica: ReplicaConfig {
            bft: BftConfig {
                batch_size: 2,
                window_size: 8,
                checkpoint_interval: 4,
                view_change_enabled: true,
                view_change_timeout: Duration::from_secs(1),
                view_change_tick: Duration::from_millis(100),
                ..BftConfig::default()
            },
            ..ReplicaConfig::default()
        },
        client_timeout: Duration::from_millis(300),
        genesis_balances: Vec::new(),
    }
}

fn batch(index: u64) -> Vec<ClientRequest> {
    (0..2)
        .map(|i| {
            ClientRequest::new(
                ClientId(1),
                index * 2 + i,
                Operation::Put {
                    key: format!("key-{index}-{i}"),
                    value: vec![i as u8],
                },
            )
        })
        .collect()
}

fn submit_and_wait(runner: &mut SimulationRunner, index: u64) -> BatchId {
    let id = runner.submit(ClientId(1), batch(index)).unwrap();
    assert!(runner.run_until_replied(ClientId(1), id, LIMIT), "batch {index} not accepted");
    id
}

fn live() -> [ReplicaId; 3] {
    [ReplicaId(1), ReplicaId(2), ReplicaId(3)]
}

#[traced_test]
#[test]
fn test_no_view_change_while_the_primary_is_healthy() {
    let mut runner = SimulationRunner::new(config(), 11).unwrap();
    runner.add_client(ClientId(1), ShardId(0));
    for index in 0..4 {
        submit_and_wait(&mut runner, index);
    }
    runner.run_for(Duration::from_secs(5));

    for replica in runner.replicas() {
        let stats = replica.stats();
        assert_eq!(stats.view, 0);
        assert_eq!(stats.view_change_votes, 0);
        assert_eq!(replica.bft().view_change_phase(), ViewChangePhase::Normal);
    }
}

#[traced_test]
#[test]
fn test_primary_crash_elects_next_primary() {
    let mut runner = SimulationRunner::new(config(), 12).unwrap();
    runner.add_client(ClientId(1), ShardId(0));
    submit_and_wait(&mut runner, 0);
    submit_and_wait(&mut runner, 1);
    runner.run_for(Duration::from_millis(100));

    runner.crash(ReplicaId(0));
    let stalled = submit_and_wait(&mut runner, 2);

    let reply = &runner.reply(ClientId(1), stalled).unwrap()[0];
    assert_eq!(reply.view, View(1));
    // Executed positions are not proposed again: the new view resumes at 4.
    assert_eq!(reply.range.start, SeqNum(4));
    assert!(!reply.replicas.contains(&ReplicaId(0)));
    assert_eq!(runner.client(ClientId(1)).unwrap().view(), View(1));

    runner.run_for(Duration::from_millis(100));
    for id in live() {
        let replica = runner.replica(id).unwrap();
        let stats = replica.stats();
        assert_eq!(replica.ledger().view(), View(1));
        assert_eq!(replica.ledger().executed_through(), SeqNum(6));
        assert_eq!(stats.views_adopted, 1);
        assert_eq!(stats.executed, 3);
        assert!(stats.view_change_votes >= 1);
    }
    assert!(runner.replica(ReplicaId(1)).unwrap().bft().is_primary());
    assert!(runner.stats().messages_dropped_crashed > 0);
    assert_eq!(runner.stats().fatal, 0);

    let digests = runner.state_digests(ShardId(0));
    assert_eq!(digests.len(), 3);
    assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));

    let heads: Vec<_> = live()
        .into_iter()
        .map(|id| runner.summary(id).unwrap().chain_head)
        .collect();
    assert!(heads[0].is_some());
    assert!(heads.windows(2).all(|pair| pair[0] == pair[1]));
}

#[traced_test]
#[test]
fn test_client_follows_the_new_primary() {
    let mut runner = SimulationRunner::new(config(), 13).unwrap();
    runner.add_client(ClientId(1), ShardId(0));
    runner.crash(ReplicaId(0));
    submit_and_wait(&mut runner, 0);
    assert_eq!(runner.client(ClientId(1)).unwrap().view(), View(1));

    // The next batch goes straight to replica 1 and needs no retry.
    let before = runner.stats().client_attempts;
    submit_and_wait(&mut runner, 1);
    assert_eq!(runner.stats().client_attempts, before + 1);

    runner.run_for(Duration::from_millis(100));
    for id in live() {
        let replica = runner.replica(id).unwrap();
        assert_eq!(replica.ledger().executed_through(), SeqNum(4));
        assert_eq!(replica.stats().views_adopted, 1);
    }
}
