//! In-memory storage replicas for driving processors end to end.
//!
//! [`MemReplica`] implements just enough of the storage protocol to answer
//! prepares, commits, reads and follow-ups from a single stored record.
//! Individual answers can be overridden per op with [`Behavior`].

#![allow(dead_code)]

use kvproxy_common::{Message, OpCode, OpStatus, Payload, RequestId};
use kvproxy_proc::chaos::{ChaosReplica, ChaosReplicaConfig};
use kvproxy_proc::codec::{JsonCodec, MessageCodec};
use kvproxy_proc::group::StaticShardMap;
use kvproxy_proc::hooks::Replicator;
use kvproxy_proc::replica::{OutboundRequest, ReplicaConnection, ReplicaError, SendError};
use kvproxy_proc::{process, InboundRequest, ProcConfig, ProcessorEnv, RequestProcessor};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

pub const NS: &[u8] = b"ns";
pub const KEY: &[u8] = b"key";

/// Overall client timeout used by [`Cluster::run`].
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(1);

/// A record held by a replica.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub version: u32,
    pub creation_time: u32,
    pub ttl: u32,
    pub last_modification_time: u64,
    pub originator: RequestId,
    pub payload: Payload,
    pub marked_deleted: bool,
}

impl Record {
    pub fn new(version: u32, payload: &str) -> Self {
        Self {
            version,
            creation_time: 1_000,
            ttl: 3_600,
            last_modification_time: 1_000_000 + version as u64,
            originator: RequestId::new(),
            payload: Payload::clear(payload.to_string()),
            marked_deleted: false,
        }
    }

    fn write_meta(&self, resp: &mut Message) {
        resp.version = self.version;
        resp.creation_time = self.creation_time;
        resp.ttl = self.ttl;
        resp.last_modification_time = self.last_modification_time;
        resp.originator = self.originator;
    }

    fn from_message(m: &Message, payload: Payload) -> Self {
        Self {
            version: m.version,
            creation_time: m.creation_time,
            ttl: m.ttl,
            last_modification_time: m.last_modification_time,
            originator: m.originator,
            payload,
            marked_deleted: false,
        }
    }
}

/// A scripted answer replacing the storage behavior for one request.
#[derive(Debug, Clone)]
pub enum Behavior {
    Status(OpStatus),
    /// Never answer.
    Silent,
    IoError,
    Refuse(SendError),
    /// Answer after a delay, with whatever the store says at send time.
    Delay(Duration),
    /// Answer with a response carrying the wrong op code.
    WrongOp(OpCode),
    /// Answer with this exact response.
    Respond(Message),
}

#[derive(Debug, Default)]
struct Store {
    record: Option<Record>,
    prepared: Option<(OpCode, Payload)>,
}

#[derive(Debug)]
pub struct MemReplica {
    name: String,
    store: Mutex<Store>,
    log: Mutex<Vec<Message>>,
    script: Mutex<HashMap<OpCode, VecDeque<Behavior>>>,
    up: AtomicBool,
}

impl MemReplica {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            store: Mutex::new(Store::default()),
            log: Mutex::new(Vec::new()),
            script: Mutex::new(HashMap::new()),
            up: AtomicBool::new(true),
        })
    }

    pub fn seed(&self, record: Record) {
        self.store.lock().unwrap().record = Some(record);
    }

    pub fn record(&self) -> Option<Record> {
        self.store.lock().unwrap().record.clone()
    }

    /// Override the next answer to `op`. Multiple calls queue up.
    pub fn script(&self, op: OpCode, behavior: Behavior) {
        self.script
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(behavior);
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Every request received, in order.
    pub fn received(&self) -> Vec<Message> {
        self.log.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<OpCode> {
        self.received().iter().map(|m| m.op_code).collect()
    }

    pub fn count(&self, op: OpCode) -> usize {
        self.ops().into_iter().filter(|&o| o == op).count()
    }

    /// The most recent request received for `op`.
    pub fn last(&self, op: OpCode) -> Option<Message> {
        self.received().into_iter().rev().find(|m| m.op_code == op)
    }

    fn next_behavior(&self, op: OpCode) -> Option<Behavior> {
        self.script.lock().unwrap().get_mut(&op)?.pop_front()
    }

    /// Apply `m` to the store and build the answer.
    fn apply(&self, m: &Message) -> Message {
        let mut store = self.store.lock().unwrap();
        let live = store.record.clone().filter(|r| !r.marked_deleted);
        let mut resp = m.response(OpStatus::NoError);
        match m.op_code {
            OpCode::PrepareCreate => {
                if live.is_some() {
                    resp.status = OpStatus::DupKey;
                } else {
                    store.prepared = Some((m.op_code, m.payload.clone()));
                }
            }
            OpCode::PrepareUpdate | OpCode::PrepareSet => {
                store.prepared = Some((m.op_code, m.payload.clone()));
                match &live {
                    Some(r) => r.write_meta(&mut resp),
                    None => {
                        resp.status = OpStatus::Inserting;
                        resp.version = 0;
                    }
                }
            }
            OpCode::PrepareDelete => {
                store.prepared = Some((m.op_code, Payload::default()));
                match &live {
                    Some(r) => r.write_meta(&mut resp),
                    None => resp.status = OpStatus::NoKey,
                }
            }
            OpCode::Commit => match store.prepared.take() {
                Some((OpCode::PrepareDelete, _)) => store.record = None,
                Some((_, payload)) => {
                    let rec = Record::from_message(m, payload);
                    rec.write_meta(&mut resp);
                    store.record = Some(rec);
                }
                None => resp.status = OpStatus::NoUncommitted,
            },
            OpCode::Abort => store.prepared = None,
            OpCode::Repair => {
                let rec = Record::from_message(m, m.payload.clone());
                rec.write_meta(&mut resp);
                store.record = Some(rec);
                store.prepared = None;
            }
            OpCode::MarkDelete => {
                let mut rec = store.record.clone().unwrap_or_default();
                rec.marked_deleted = true;
                store.record = Some(rec);
                store.prepared = None;
            }
            OpCode::Delete => {
                if store.record.take().is_none() {
                    resp.status = OpStatus::NoKey;
                }
            }
            OpCode::Read => match &store.record {
                Some(r) if r.marked_deleted => {
                    resp.status = OpStatus::KeyMarkedDelete;
                    r.write_meta(&mut resp);
                }
                Some(r) => {
                    r.write_meta(&mut resp);
                    resp.payload = r.payload.clone();
                }
                None => resp.status = OpStatus::NoKey,
            },
            _ => resp.status = OpStatus::BadParam,
        }
        resp
    }
}

impl ReplicaConnection for MemReplica {
    fn send_request(&self, request: OutboundRequest) -> Result<(), SendError> {
        let m = request.message.clone();
        let behavior = self.next_behavior(m.op_code);
        if let Some(Behavior::Refuse(e)) = &behavior {
            return Err(*e);
        }
        self.log.lock().unwrap().push(m.clone());

        match behavior {
            None => {
                request.respond(Ok(self.apply(&m)));
            }
            Some(Behavior::Status(st)) => {
                request.respond(Ok(m.response(st)));
            }
            Some(Behavior::Silent) => {}
            Some(Behavior::IoError) => {
                request.respond(Err(ReplicaError::Io("reset by peer".into())));
            }
            Some(Behavior::Delay(d)) => {
                let resp = self.apply(&m);
                tokio::spawn(async move {
                    tokio::time::sleep(d).await;
                    request.respond(Ok(resp));
                });
            }
            Some(Behavior::WrongOp(op)) => {
                let mut resp = m.response(OpStatus::NoError);
                resp.op_code = op;
                request.respond(Ok(resp));
            }
            Some(Behavior::Respond(mut resp)) => {
                resp.op_code = m.op_code;
                resp.opaque = m.opaque;
                resp.is_response = true;
                request.respond(Ok(resp));
            }
            Some(Behavior::Refuse(_)) => unreachable!(),
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Replicator that keeps what it is handed.
#[derive(Debug, Default)]
pub struct RecordingReplicator {
    pub sent: Mutex<Vec<Message>>,
}

impl Replicator for RecordingReplicator {
    fn send_request(&self, request: Message) {
        self.sent.lock().unwrap().push(request);
    }
}

/// N replicas, one per zone, behind a single-shard map.
pub struct Cluster {
    pub replicas: Vec<Arc<MemReplica>>,
    pub env: Arc<ProcessorEnv>,
}

pub fn config(num_zones: usize) -> ProcConfig {
    ProcConfig {
        num_zones,
        num_writes: (num_zones + 1) / 2,
        ss_request_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

impl Cluster {
    pub fn new(num_zones: usize) -> Self {
        Self::build(config(num_zones), |env| env)
    }

    pub fn build(config: ProcConfig, f: impl FnOnce(ProcessorEnv) -> ProcessorEnv) -> Self {
        let replicas: Vec<Arc<MemReplica>> = (0..config.num_zones)
            .map(|z| MemReplica::new(format!("ss{}", z)))
            .collect();
        let conns = replicas
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn ReplicaConnection>)
            .collect();
        let env = ProcessorEnv::new(config, Arc::new(StaticShardMap::single_host_per_zone(conns)));
        Self {
            replicas,
            env: Arc::new(f(env)),
        }
    }

    /// Same topology, with every replica behind a chaos wrapper.
    pub fn with_chaos(
        config: ProcConfig,
        chaos: ChaosReplicaConfig,
    ) -> (Self, Vec<Arc<ChaosReplica<MemReplica>>>) {
        let replicas: Vec<Arc<MemReplica>> = (0..config.num_zones)
            .map(|z| MemReplica::new(format!("ss{}", z)))
            .collect();
        let wrapped: Vec<Arc<ChaosReplica<MemReplica>>> = replicas
            .iter()
            .map(|r| Arc::new(ChaosReplica::from_arc(Arc::clone(r), chaos.clone())))
            .collect();
        let conns = wrapped
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn ReplicaConnection>)
            .collect();
        let env = ProcessorEnv::new(config, Arc::new(StaticShardMap::single_host_per_zone(conns)));
        (
            Self {
                replicas,
                env: Arc::new(env),
            },
            wrapped,
        )
    }

    pub fn seed_all(&self, record: Record) {
        for r in &self.replicas {
            r.seed(record.clone());
        }
    }

    pub fn replica(&self, i: usize) -> &MemReplica {
        &self.replicas[i]
    }

    /// Run `request` through `processor` and return the client reply.
    pub async fn run(&self, processor: &mut dyn RequestProcessor, request: Message) -> Message {
        let (inbound, rx) = InboundRequest::new(encode(&request), CLIENT_TIMEOUT);
        assert!(process(processor, inbound).await, "reply not delivered");
        rx.await.expect("reply")
    }
}

pub fn encode(m: &Message) -> Vec<u8> {
    JsonCodec.encode(m).unwrap().to_vec()
}

pub fn request(op: OpCode) -> Message {
    Message::request(op, NS, KEY)
}

pub fn write_request(op: OpCode, payload: &str) -> Message {
    let mut m = request(op).with_payload(Payload::clear(payload.to_string()));
    m.ttl = 600;
    m
}
