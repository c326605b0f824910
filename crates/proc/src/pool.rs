//! Reusable processors, one pool per client op.
//!
//! A processor is checked out for exactly one request and reset before it
//! goes back. Check-out and check-in are the only points where concurrent
//! requests touch shared state: a mutex-guarded free list and an atomic
//! count of active processors bounded by `max_processors`.

use crate::env::ProcessorEnv;
use crate::ops::{
    CreateProcessor, DestroyProcessor, GetProcessor, SetProcessor, TwoPhaseDestroyProcessor,
    UpdateProcessor,
};
use crate::process::{process, RequestProcessor};
use crate::request::InboundRequest;
use kvproxy_common::{Message, OpCode, OpStatus};
use kvproxy_metrics::metrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("too many active {0} processors")]
    Exhausted(OpCode),
    #[error("no processor for {0}")]
    Unsupported(OpCode),
}

impl PoolError {
    /// Status the client sees when its request cannot get a processor.
    pub fn status(self) -> OpStatus {
        match self {
            PoolError::Exhausted(_) => OpStatus::Busy,
            PoolError::Unsupported(_) => OpStatus::NotSupported,
        }
    }
}

/// Build a fresh processor for `op`.
pub fn new_processor(op: OpCode, env: &Arc<ProcessorEnv>) -> Option<Box<dyn RequestProcessor>> {
    let env = Arc::clone(env);
    let processor: Box<dyn RequestProcessor> = match op {
        OpCode::Create => Box::new(CreateProcessor::new(env)),
        OpCode::Get | OpCode::UdfGet => Box::new(GetProcessor::new(env)),
        OpCode::Update => Box::new(UpdateProcessor::new(env)),
        OpCode::Set | OpCode::UdfSet => Box::new(SetProcessor::new(env)),
        OpCode::Destroy if env.config.two_phase_destroy => {
            Box::new(TwoPhaseDestroyProcessor::new(env))
        }
        OpCode::Destroy => Box::new(DestroyProcessor::new(env)),
        _ => return None,
    };
    Some(processor)
}

/// Processors for one op.
pub struct ProcessorPool {
    op: OpCode,
    env: Arc<ProcessorEnv>,
    free: Mutex<Vec<Box<dyn RequestProcessor>>>,
    /// Idle processors kept for reuse.
    pool_size: usize,
    /// Upper bound on processors checked out at once. Zero is unbounded.
    max_active: usize,
    active: AtomicUsize,
}

impl std::fmt::Debug for ProcessorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorPool")
            .field("op", &self.op)
            .field("active", &self.num_active())
            .field("idle", &self.num_idle())
            .field("max_active", &self.max_active)
            .finish()
    }
}

impl ProcessorPool {
    pub fn new(op: OpCode, env: Arc<ProcessorEnv>) -> Result<Self, PoolError> {
        let first = new_processor(op, &env).ok_or(PoolError::Unsupported(op))?;
        let pool_size = env.config.pool_size;
        let max_active = env.config.max_processors;
        let mut free = Vec::with_capacity(pool_size.max(1));
        free.push(first);
        Ok(Self {
            op,
            env,
            free: Mutex::new(free),
            pool_size,
            max_active,
            active: AtomicUsize::new(0),
        })
    }

    pub fn op(&self) -> OpCode {
        self.op
    }

    /// Check out a processor, creating one if none is idle.
    pub fn acquire(self: &Arc<Self>) -> Result<ProcessorHandle, PoolError> {
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        if self.max_active != 0 && active > self.max_active {
            self.active.fetch_sub(1, Ordering::AcqRel);
            metrics()
                .pool_rejections
                .with_label_values(&[self.op.name()])
                .inc();
            warn!("{} pool exhausted: {} active", self.op, self.max_active);
            return Err(PoolError::Exhausted(self.op));
        }

        let reused = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let processor = match reused {
            Some(p) => p,
            None => match new_processor(self.op, &self.env) {
                Some(p) => p,
                None => {
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    return Err(PoolError::Unsupported(self.op));
                }
            },
        };
        metrics()
            .active_processors
            .with_label_values(&[self.op.name()])
            .inc();
        Ok(ProcessorHandle {
            pool: Arc::clone(self),
            processor: Some(processor),
        })
    }

    /// Check a processor back in. Equivalent to dropping the handle.
    pub fn release(&self, handle: ProcessorHandle) {
        drop(handle);
    }

    fn check_in(&self, mut processor: Box<dyn RequestProcessor>) {
        processor.init();
        self.active.fetch_sub(1, Ordering::AcqRel);
        metrics()
            .active_processors
            .with_label_values(&[self.op.name()])
            .dec();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.pool_size {
            free.push(processor);
        }
    }

    pub fn num_active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn num_idle(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

/// A checked-out processor. Returned to its pool on drop.
pub struct ProcessorHandle {
    pool: Arc<ProcessorPool>,
    processor: Option<Box<dyn RequestProcessor>>,
}

impl std::fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("op", &self.pool.op)
            .finish_non_exhaustive()
    }
}

impl ProcessorHandle {
    pub fn op(&self) -> OpCode {
        self.pool.op
    }

    /// Run one request. Returns `true` if the reply was delivered.
    pub async fn process(&mut self, request: InboundRequest) -> bool {
        match self.processor.as_deref_mut() {
            Some(processor) => process(processor, request).await,
            None => false,
        }
    }
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        if let Some(processor) = self.processor.take() {
            self.pool.check_in(processor);
        }
    }
}

/// One pool per client op, and the entry point for encoded requests.
#[derive(Debug)]
pub struct ProcessorPools {
    env: Arc<ProcessorEnv>,
    pools: HashMap<OpCode, Arc<ProcessorPool>>,
}

impl ProcessorPools {
    pub fn new(env: Arc<ProcessorEnv>) -> Self {
        let pools = OpCode::CLIENT_OPS
            .iter()
            .filter_map(|&op| {
                ProcessorPool::new(op, Arc::clone(&env))
                    .ok()
                    .map(|pool| (op, Arc::new(pool)))
            })
            .collect();
        Self { env, pools }
    }

    pub fn env(&self) -> &Arc<ProcessorEnv> {
        &self.env
    }

    pub fn pool(&self, op: OpCode) -> Option<&Arc<ProcessorPool>> {
        self.pools.get(&op)
    }

    pub fn acquire(&self, op: OpCode) -> Result<ProcessorHandle, PoolError> {
        self.pools
            .get(&op)
            .ok_or(PoolError::Unsupported(op))?
            .acquire()
    }

    /// Route an encoded request to a processor for its op and run it.
    /// Requests that cannot be routed are answered here.
    pub async fn process(&self, request: InboundRequest) -> bool {
        let op = match self.env.codec.peek_op_code(request.raw()) {
            Ok(op) => op,
            Err(e) => {
                warn!("failed to decode inbound request: {}", e);
                return self.reject(request, OpStatus::BadMsg);
            }
        };
        match self.acquire(op) {
            Ok(mut handle) => {
                let delivered = handle.process(request).await;
                self.release(handle);
                delivered
            }
            Err(e) => {
                debug!("rejecting {}: {}", op, e);
                self.reject(request, e.status())
            }
        }
    }

    pub fn release(&self, handle: ProcessorHandle) {
        drop(handle);
    }

    fn reject(&self, request: InboundRequest, status: OpStatus) -> bool {
        let reply = match self.env.codec.decode(request.raw()) {
            Ok(m) => m.response(status),
            Err(_) => Message::default().response(status),
        };
        metrics()
            .client_replies
            .with_label_values(&[reply.op_code.name(), status.short_name()])
            .inc();
        request.reply_directly(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::ProcConfig;
    use crate::group::StaticShardMap;

    fn env(pool_size: usize, max_processors: usize) -> Arc<ProcessorEnv> {
        let config = ProcConfig {
            pool_size,
            max_processors,
            ..Default::default()
        };
        Arc::new(ProcessorEnv::new(
            config,
            Arc::new(StaticShardMap::single_host_per_zone(Vec::new())),
        ))
    }

    #[test]
    fn test_processor_per_op() {
        let env = env(1, 0);
        for op in OpCode::CLIENT_OPS {
            let p = new_processor(op, &env).unwrap();
            assert!(p.accepts(op), "{op}");
        }
        assert!(new_processor(OpCode::Commit, &env).is_none());
        assert!(new_processor(OpCode::Nop, &env).is_none());
    }

    #[test]
    fn test_acquire_reuses_and_bounds() {
        let pool = Arc::new(ProcessorPool::new(OpCode::Get, env(1, 2)).unwrap());
        assert_eq!(pool.num_idle(), 1);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.num_active(), 2);
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(
            pool.acquire().unwrap_err(),
            PoolError::Exhausted(OpCode::Get)
        );
        assert_eq!(pool.num_active(), 2, "rejection must not leak a slot");

        pool.release(a);
        drop(b);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 1, "idle list capped at pool_size");
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_zero_max_processors_from_config_is_unbounded() {
        let yaml = "req_proc:\n  max_processors: 0\n  pool_size: 1\n";
        let proxy = kvproxy_config::load_from_str(yaml).unwrap();
        let config = ProcConfig::from_proxy_config(&proxy);
        let env = Arc::new(ProcessorEnv::new(
            config,
            Arc::new(StaticShardMap::single_host_per_zone(Vec::new())),
        ));
        let pool = Arc::new(ProcessorPool::new(OpCode::Set, env).unwrap());

        let handles: Vec<_> = (0..64).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.num_active(), 64);
        drop(handles);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn test_unsupported_op() {
        let pools = ProcessorPools::new(env(1, 0));
        assert_eq!(
            pools.acquire(OpCode::Repair).unwrap_err(),
            PoolError::Unsupported(OpCode::Repair)
        );
        assert_eq!(PoolError::Unsupported(OpCode::Nop).status(), OpStatus::NotSupported);
        assert_eq!(PoolError::Exhausted(OpCode::Get).status(), OpStatus::Busy);
    }
}
