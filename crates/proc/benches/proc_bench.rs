use criterion::{criterion_group, criterion_main, Criterion};
use kvproxy_common::{Message, OpCode, OpStatus, Payload};
use kvproxy_proc::codec::{JsonCodec, MessageCodec};
use kvproxy_proc::group::StaticShardMap;
use kvproxy_proc::replica::{OutboundRequest, ReplicaConnection, SendError};
use kvproxy_proc::{InboundRequest, ProcConfig, ProcessorEnv, ProcessorPools};
use std::sync::Arc;
use std::time::Duration;

/// Answers every request immediately from a fixed version-1 record.
struct StaticReplica(String);

impl ReplicaConnection for StaticReplica {
    fn send_request(&self, request: OutboundRequest) -> Result<(), SendError> {
        let m = &request.message;
        let mut resp = m.response(OpStatus::NoError);
        match m.op_code {
            OpCode::Read => {
                resp.version = 1;
                resp.creation_time = 1_000;
                resp.ttl = 3_600;
                resp.last_modification_time = 1_000_001;
                resp.payload = Payload::clear(&b"value"[..]);
            }
            OpCode::PrepareSet => resp.status = OpStatus::Inserting,
            _ => {}
        }
        request.respond(Ok(resp));
        Ok(())
    }

    fn name(&self) -> &str {
        &self.0
    }
}

fn pools(num_zones: usize) -> ProcessorPools {
    let config = ProcConfig {
        num_zones,
        num_writes: (num_zones + 1) / 2,
        ss_request_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let replicas = (0..num_zones)
        .map(|z| Arc::new(StaticReplica(format!("ss{}", z))) as Arc<dyn ReplicaConnection>)
        .collect();
    let env = ProcessorEnv::new(
        config,
        Arc::new(StaticShardMap::single_host_per_zone(replicas)),
    );
    ProcessorPools::new(Arc::new(env))
}

fn encoded(op: OpCode) -> Vec<u8> {
    let mut m = Message::request(op, b"bench", b"key");
    if op != OpCode::Get {
        m = m.with_payload(Payload::clear(&b"value"[..]));
        m.ttl = 600;
    }
    JsonCodec.encode(&m).unwrap().to_vec()
}

fn bench_get_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let pools = pools(3);
    let raw = encoded(OpCode::Get);

    c.bench_function("get_3_zones", |b| {
        b.to_async(&rt).iter(|| async {
            let (inbound, rx) = InboundRequest::new(raw.clone(), Duration::from_secs(1));
            pools.process(inbound).await;
            let reply = rx.await.unwrap();
            assert_eq!(reply.status, OpStatus::NoError);
        });
    });
}

fn bench_set_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("set");

    for zones in [3usize, 5] {
        let pools = pools(zones);
        let raw = encoded(OpCode::Set);
        group.bench_function(format!("{}_zones", zones), |b| {
            b.to_async(&rt).iter(|| async {
                let (inbound, rx) = InboundRequest::new(raw.clone(), Duration::from_secs(1));
                pools.process(inbound).await;
                rx.await.unwrap();
            });
        });
    }
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let raw = encoded(OpCode::Set);
    c.bench_function("json_decode", |b| {
        b.iter(|| JsonCodec.decode(&raw).unwrap());
    });
}

criterion_group!(
    benches,
    bench_get_round_trip,
    bench_set_round_trip,
    bench_codec
);
criterion_main!(benches);
