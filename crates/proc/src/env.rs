//! Shared, immutable environment handed to every processor.

use crate::codec::{JsonCodec, MessageCodec};
use crate::conf::ProcConfig;
use crate::group::ShardResolver;
use crate::hooks::{PayloadCipher, Replicator, UdfRegistry};
use std::sync::Arc;

pub struct ProcessorEnv {
    pub config: ProcConfig,
    pub shards: Arc<dyn ShardResolver>,
    pub codec: Arc<dyn MessageCodec>,
    pub replicator: Option<Arc<dyn Replicator>>,
    pub udfs: Option<Arc<dyn UdfRegistry>>,
    pub cipher: Option<Arc<dyn PayloadCipher>>,
}

impl std::fmt::Debug for ProcessorEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorEnv")
            .field("config", &self.config)
            .field("replication", &self.replicator.is_some())
            .finish_non_exhaustive()
    }
}

impl ProcessorEnv {
    pub fn new(config: ProcConfig, shards: Arc<dyn ShardResolver>) -> Self {
        Self {
            config,
            shards,
            codec: Arc::new(JsonCodec),
            replicator: None,
            udfs: None,
            cipher: None,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Enable cross-datacenter replication.
    pub fn with_replicator(mut self, replicator: Arc<dyn Replicator>) -> Self {
        self.replicator = Some(replicator);
        self
    }

    pub fn with_udf_registry(mut self, udfs: Arc<dyn UdfRegistry>) -> Self {
        self.udfs = Some(udfs);
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Cipher for payloads sent to storage, if payload encryption is on.
    pub fn payload_cipher(&self) -> Option<&dyn PayloadCipher> {
        if self.config.payload_encryption {
            self.cipher.as_deref()
        } else {
            None
        }
    }

    /// Cipher for payloads handed to the replicator, if enabled.
    pub fn replication_cipher(&self) -> Option<&dyn PayloadCipher> {
        if self.config.replication_encryption {
            self.cipher.as_deref()
        } else {
            None
        }
    }
}
