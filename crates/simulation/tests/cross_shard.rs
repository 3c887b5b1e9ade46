//! Batches ordered by more than one shard.

use palisade_bft::{BftConfig, ProtocolVariant};
use palisade_node::ReplicaConfig;
use palisade_simulation::{NetworkConfig, SimulationConfig, SimulationRunner};
use palisade_types::{ClientId, ClientRequest, Operation, OperationResult, ShardId};
use std::time::Duration;
use tracing_test::traced_test;

const LIMIT: Duration = Duration::from_secs(5);

fn config(protocol: ProtocolVariant) -> SimulationConfig {
    SimulationConfig {
        network: NetworkConfig {
            shards: 2,
            replicas_per_shard: 4,
            ..NetworkConfig::default()
        },
        replica: ReplicaConfig {
            bft: BftConfig {
                batch_size: 2,
                window_size: 8,
                checkpoint_interval: 4,
                view_change_enabled: false,
                protocol,
                ..BftConfig::default()
            },
            ..ReplicaConfig::default()
        },
        ..SimulationConfig::default()
    }
}

fn puts(client: u64, index: u64) -> Vec<ClientRequest> {
    (0..2)
        .map(|i| {
            ClientRequest::new(
                ClientId(client),
                index * 2 + i,
                Operation::Put {
                    key: format!("shared-{index}-{i}"),
                    value: vec![index as u8, i as u8],
                },
            )
        })
        .collect()
}

fn assert_shard_converged(runner: &SimulationRunner, shard: ShardId) {
    let digests = runner.state_digests(shard);
    assert_eq!(digests.len(), 4);
    assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));
}

fn run_cross_shard(protocol: ProtocolVariant, seed: u64) {
    let mut runner = SimulationRunner::new(config(protocol), seed).unwrap();
    runner.add_client(ClientId(1), ShardId(0));

    for index in 0..3 {
        let batch = runner
            .submit_to_shards(ClientId(1), vec![ShardId(0), ShardId(1)], puts(1, index))
            .unwrap();
        assert!(runner.run_until_replied(ClientId(1), batch, LIMIT));

        let replies = runner.reply(ClientId(1), batch).unwrap();
        assert_eq!(replies.len(), 2, "one reply per involved shard");
        for reply in replies {
            assert_eq!(reply.results, vec![OperationResult::Stored, OperationResult::Stored]);
        }
    }
    runner.run_for(Duration::from_millis(200));

    assert_shard_converged(&runner, ShardId(0));
    assert_shard_converged(&runner, ShardId(1));
    // Both shards applied the same batches from the same empty state.
    assert_eq!(
        runner.state_digests(ShardId(0))[0],
        runner.state_digests(ShardId(1))[0]
    );
    for replica in runner.replicas() {
        assert_eq!(replica.stats().executed, 3);
    }
    assert_eq!(runner.stats().fatal, 0);
}

#[traced_test]
#[test]
fn test_cross_shard_batch_commits_on_both_shards() {
    run_cross_shard(ProtocolVariant::CrossShard, 21);
}

#[traced_test]
#[test]
fn test_ring_batch_commits_on_both_shards() {
    run_cross_shard(ProtocolVariant::Ring, 22);
}

#[traced_test]
#[test]
fn test_local_batches_stay_on_their_shard() {
    let mut runner = SimulationRunner::new(config(ProtocolVariant::CrossShard), 23).unwrap();
    runner.add_client(ClientId(1), ShardId(0));
    runner.add_client(ClientId(2), ShardId(1));

    let left = runner.submit(ClientId(1), puts(1, 0)).unwrap();
    let right = runner.submit(ClientId(2), puts(2, 7)).unwrap();
    assert!(runner.run_until_condition(LIMIT, |runner| {
        runner.reply(ClientId(1), left).is_some() && runner.reply(ClientId(2), right).is_some()
    }));
    runner.run_for(Duration::from_millis(200));

    assert_eq!(runner.reply(ClientId(1), left).unwrap()[0].key.client, ClientId(1));
    assert_shard_converged(&runner, ShardId(0));
    assert_shard_converged(&runner, ShardId(1));
    assert_ne!(
        runner.state_digests(ShardId(0))[0],
        runner.state_digests(ShardId(1))[0]
    );
}
