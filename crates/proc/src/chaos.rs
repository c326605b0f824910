//! Chaos injection wrapper for [`ReplicaConnection`].
//!
//! [`ChaosReplica`] wraps any `C: ReplicaConnection` and injects
//! configurable faults: refused sends, dropped responses, transport errors,
//! added latency, and a whole-zone outage switch.

use crate::replica::{
    OutboundRequest, ReplicaConnection, ReplicaError, ReplicaResponse, SendError,
};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::debug;

/// Configuration for replica chaos injection. Rates are probabilities in
/// \[0.0, 1.0\].
#[derive(Debug, Clone, Default)]
pub struct ChaosReplicaConfig {
    /// Send refused with [`SendError::Busy`].
    pub busy_rate: f64,
    /// Send refused with [`SendError::NoConnection`].
    pub no_conn_rate: f64,
    /// Response swallowed; the processor sees a timeout.
    pub drop_rate: f64,
    /// Response replaced by a transport error.
    pub io_error_rate: f64,
    /// Fixed latency added to every response.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

/// A [`ReplicaConnection`] wrapper that injects chaos.
pub struct ChaosReplica<C: ReplicaConnection> {
    inner: Arc<C>,
    config: Arc<RwLock<ChaosReplicaConfig>>,
    down: AtomicBool,
}

impl<C: ReplicaConnection> std::fmt::Debug for ChaosReplica<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosReplica")
            .field("inner", &self.inner.name())
            .field("down", &self.is_down())
            .finish_non_exhaustive()
    }
}

/// What happens to one response.
enum Fate {
    Deliver(Duration),
    Drop,
    IoError(Duration),
}

impl<C: ReplicaConnection> ChaosReplica<C> {
    pub fn new(inner: C, config: ChaosReplicaConfig) -> Self {
        Self::from_arc(Arc::new(inner), config)
    }

    pub fn from_arc(inner: Arc<C>, config: ChaosReplicaConfig) -> Self {
        Self {
            inner,
            config: Arc::new(RwLock::new(config)),
            down: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Take the replica out: it reports unavailable and refuses sends.
    pub fn fail(&self) {
        self.down.store(true, Ordering::Release);
    }

    pub fn recover(&self) {
        self.down.store(false, Ordering::Release);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    pub fn set_config(&self, config: ChaosReplicaConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    fn snapshot(&self) -> ChaosReplicaConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn roll(rng: &mut impl Rng, rate: f64) -> bool {
        rate > 0.0 && rng.gen_bool(rate.min(1.0))
    }

    /// Decide whether a send is refused.
    fn refuse(&self, config: &ChaosReplicaConfig) -> Option<SendError> {
        if self.is_down() {
            return Some(SendError::NoConnection);
        }
        let mut rng = rand::thread_rng();
        if Self::roll(&mut rng, config.busy_rate) {
            Some(SendError::Busy)
        } else if Self::roll(&mut rng, config.no_conn_rate) {
            Some(SendError::NoConnection)
        } else {
            None
        }
    }

    fn fate(config: &ChaosReplicaConfig) -> Fate {
        let mut rng = rand::thread_rng();
        let jitter_ms = if config.jitter.is_zero() {
            0
        } else {
            rng.gen_range(0..=config.jitter.as_millis() as u64)
        };
        let delay = config.latency + Duration::from_millis(jitter_ms);
        if Self::roll(&mut rng, config.drop_rate) {
            Fate::Drop
        } else if Self::roll(&mut rng, config.io_error_rate) {
            Fate::IoError(delay)
        } else {
            Fate::Deliver(delay)
        }
    }

    fn is_passthrough(config: &ChaosReplicaConfig) -> bool {
        config.drop_rate <= 0.0
            && config.io_error_rate <= 0.0
            && config.latency.is_zero()
            && config.jitter.is_zero()
    }
}

impl<C: ReplicaConnection> ReplicaConnection for ChaosReplica<C> {
    fn send_request(&self, request: OutboundRequest) -> Result<(), SendError> {
        let config = self.snapshot();
        if let Some(err) = self.refuse(&config) {
            debug!("chaos: {} refused send: {}", self.name(), err);
            return Err(err);
        }
        if Self::is_passthrough(&config) {
            return self.inner.send_request(request);
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return self.inner.send_request(request);
        };

        let fate = Self::fate(&config);
        let (message, timeout, reply_to) = request.into_parts();
        let opaque = message.opaque;
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner
            .send_request(OutboundRequest::new(message, timeout, tx))?;

        let name = self.inner.name().to_string();
        runtime.spawn(async move {
            let Some(resp) = rx.recv().await else {
                return;
            };
            let result = match fate {
                Fate::Drop => {
                    debug!("chaos: {} dropped response {:#x}", name, opaque);
                    return;
                }
                Fate::IoError(delay) => {
                    tokio::time::sleep(delay).await;
                    Err(ReplicaError::Io("chaos: injected I/O error".into()))
                }
                Fate::Deliver(delay) => {
                    tokio::time::sleep(delay).await;
                    resp.result
                }
            };
            let _ = reply_to.send(ReplicaResponse { opaque, result });
        });
        Ok(())
    }

    fn is_available(&self) -> bool {
        !self.is_down() && self.inner.is_available()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn conn_info(&self) -> String {
        self.inner.conn_info()
    }

    fn node_info(&self) -> String {
        self.inner.node_info()
    }
}

// ────────────────────────── Tests ──────────────────────────
