//! Processor pools under injected replica faults.
//!
//! Every replica sits behind a [`ChaosReplica`]; requests go through
//! [`ProcessorPools`] the way a client connection would submit them.

mod common;

use common::{config, encode, request, write_request, Cluster, Record, CLIENT_TIMEOUT};
use kvproxy_common::{Message, OpCode, OpStatus};
use kvproxy_proc::chaos::ChaosReplicaConfig;
use kvproxy_proc::{InboundRequest, ProcConfig, ProcessorPools};
use std::sync::Arc;
use tokio::time::Duration;

async fn submit(pools: &ProcessorPools, m: &Message) -> Message {
    let (inbound, rx) = InboundRequest::new(encode(m), CLIENT_TIMEOUT);
    pools.process(inbound).await;
    rx.await.expect("reply")
}

fn latency(ms: u64) -> ChaosReplicaConfig {
    ChaosReplicaConfig {
        latency: Duration::from_millis(ms),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_quorum_survives_one_failed_zone() {
    let (cluster, chaos) = Cluster::with_chaos(config(3), latency(5));
    let pools = ProcessorPools::new(cluster.env.clone());

    let reply = submit(&pools, &write_request(OpCode::Set, "v1")).await;
    assert_eq!(reply.status, OpStatus::NoError);

    chaos[1].fail();
    let reply = submit(&pools, &write_request(OpCode::Set, "v2")).await;
    assert_eq!(reply.status, OpStatus::NoError);
    assert_eq!(reply.version, 2);

    let reply = submit(&pools, &request(OpCode::Get)).await;
    assert_eq!(reply.status, OpStatus::NoError);
    assert_eq!(reply.version, 2);

    // The recovered zone is repaired by the next read.
    chaos[1].recover();
    let reply = submit(&pools, &request(OpCode::Get)).await;
    assert_eq!(reply.version, 2);
    assert_eq!(cluster.replica(1).record().unwrap().version, 2);
}

#[tokio::test(start_paused = true)]
async fn test_two_failed_zones_is_no_storage_server() {
    let (cluster, chaos) = Cluster::with_chaos(config(3), ChaosReplicaConfig::default());
    cluster.seed_all(Record::new(1, "v"));
    let pools = ProcessorPools::new(cluster.env.clone());

    chaos[0].fail();
    chaos[2].fail();
    for m in [request(OpCode::Get), write_request(OpCode::Update, "w")] {
        let reply = submit(&pools, &m).await;
        assert_eq!(reply.status, OpStatus::NoStorageServer, "{}", m.op_code);
    }
    assert!(cluster.replica(1).received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_everywhere() {
    let faults = ChaosReplicaConfig {
        io_error_rate: 1.0,
        ..Default::default()
    };
    let (cluster, _chaos) = Cluster::with_chaos(config(3), faults);
    cluster.seed_all(Record::new(1, "v"));
    let pools = ProcessorPools::new(cluster.env.clone());

    let reply = submit(&pools, &request(OpCode::Get)).await;
    assert_eq!(reply.status, OpStatus::NoStorageServer);

    let reply = submit(&pools, &write_request(OpCode::Update, "w")).await;
    assert_eq!(reply.status, OpStatus::NoStorageServer);
    assert_eq!(cluster.replica(0).record().unwrap().version, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_responses_time_out_per_replica() {
    let (cluster, chaos) = Cluster::with_chaos(config(3), ChaosReplicaConfig::default());
    cluster.seed_all(Record::new(4, "v"));
    chaos[0].set_config(ChaosReplicaConfig {
        drop_rate: 1.0,
        ..Default::default()
    });
    let pools = ProcessorPools::new(cluster.env.clone());

    let start = tokio::time::Instant::now();
    let reply = submit(&pools, &request(OpCode::Get)).await;

    assert_eq!(reply.status, OpStatus::NoError);
    assert_eq!(reply.version, 4);
    assert!(start.elapsed() < CLIENT_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn test_refused_sends_on_a_minority() {
    let (cluster, chaos) = Cluster::with_chaos(config(5), latency(1));
    let pools = ProcessorPools::new(cluster.env.clone());
    for c in &chaos[..2] {
        c.set_config(ChaosReplicaConfig {
            busy_rate: 1.0,
            ..Default::default()
        });
    }

    let reply = submit(&pools, &write_request(OpCode::Create, "v")).await;
    assert_eq!(reply.status, OpStatus::NoError);
    for i in 2..5 {
        assert_eq!(cluster.replica(i).record().unwrap().version, 1);
    }

    chaos[2].set_config(ChaosReplicaConfig {
        busy_rate: 1.0,
        ..Default::default()
    });
    let reply = submit(&pools, &write_request(OpCode::Set, "w")).await;
    assert_eq!(reply.status, OpStatus::Busy);
}

// ────────────────────────── Pools ──────────────────────────

#[tokio::test(start_paused = true)]
async fn test_pools_route_and_reject() {
    let cluster = Cluster::new(3);
    let pools = ProcessorPools::new(cluster.env.clone());

    let (inbound, rx) = InboundRequest::new(&b"{broken"[..], CLIENT_TIMEOUT);
    assert!(pools.process(inbound).await);
    assert_eq!(rx.await.unwrap().status, OpStatus::BadMsg);

    let reply = submit(&pools, &request(OpCode::Commit)).await;
    assert_eq!(reply.status, OpStatus::NotSupported);

    let reply = submit(&pools, &write_request(OpCode::UdfSet, "v")).await;
    assert_eq!(reply.status, OpStatus::NoError);
    assert_eq!(reply.op_code, OpCode::UdfSet);
}

#[tokio::test(start_paused = true)]
async fn test_pool_exhaustion_replies_busy() {
    let config = ProcConfig {
        max_processors: 1,
        ..config(3)
    };
    let cluster = Cluster::build(config, |env| env);
    cluster.seed_all(Record::new(1, "v"));
    let pools = ProcessorPools::new(cluster.env.clone());

    let held = pools.acquire(OpCode::Get).unwrap();
    let reply = submit(&pools, &request(OpCode::Get)).await;
    assert_eq!(reply.status, OpStatus::Busy);

    // Other ops have their own budget.
    let reply = submit(&pools, &write_request(OpCode::Set, "w")).await;
    assert_eq!(reply.status, OpStatus::NoError);

    pools.release(held);
    let reply = submit(&pools, &request(OpCode::Get)).await;
    assert_eq!(reply.status, OpStatus::NoError);
    assert_eq!(pools.pool(OpCode::Get).unwrap().num_active(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_through_shared_pools() {
    let (cluster, _chaos) = Cluster::with_chaos(
        config(3),
        ChaosReplicaConfig {
            latency: Duration::from_millis(2),
            jitter: Duration::from_millis(8),
            ..Default::default()
        },
    );
    cluster.seed_all(Record::new(1, "v"));
    let pools = Arc::new(ProcessorPools::new(cluster.env.clone()));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let pools = Arc::clone(&pools);
        tasks.spawn(async move { submit(&pools, &request(OpCode::Get)).await });
    }
    while let Some(reply) = tasks.join_next().await {
        let reply = reply.unwrap();
        assert_eq!(reply.status, OpStatus::NoError);
        assert_eq!(reply.version, 1);
    }
    let get = pools.pool(OpCode::Get).unwrap();
    assert_eq!(get.num_active(), 0);
    assert!(get.num_idle() >= 1);
}
