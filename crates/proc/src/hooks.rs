//! Collaborators invoked around the client reply: cross-datacenter
//! replication, user-defined functions, and payload encryption.

use bytes::Bytes;
use kvproxy_common::{Message, Payload};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

/// Forwards successful writes to another datacenter. Fire-and-forget.
pub trait Replicator: Send + Sync + 'static {
    fn send_request(&self, request: Message);
}

// ---------------------------------------------------------------------------
// UDF
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum UdfError {
    #[error("udf {0:?} not registered")]
    NotFound(String),
    #[error("udf {name:?} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// A function applied to a stored value before it is returned.
pub trait Udf: Send + Sync {
    fn call(&self, stored: &[u8], params: &[u8]) -> Result<Bytes, UdfError>;
}

impl<F> Udf for F
where
    F: Fn(&[u8], &[u8]) -> Result<Bytes, UdfError> + Send + Sync,
{
    fn call(&self, stored: &[u8], params: &[u8]) -> Result<Bytes, UdfError> {
        self(stored, params)
    }
}

pub trait UdfRegistry: Send + Sync + 'static {
    fn get(&self, name: &str) -> Option<Arc<dyn Udf>>;
}

/// In-process UDF registry.
#[derive(Default)]
pub struct UdfManager {
    udfs: RwLock<HashMap<String, Arc<dyn Udf>>>,
}

impl std::fmt::Debug for UdfManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdfManager").finish_non_exhaustive()
    }
}

impl UdfManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, udf: Arc<dyn Udf>) {
        if let Ok(mut udfs) = self.udfs.write() {
            udfs.insert(name.into(), udf);
        }
    }
}

impl UdfRegistry for UdfManager {
    fn get(&self, name: &str) -> Option<Arc<dyn Udf>> {
        self.udfs.read().ok()?.get(name).cloned()
    }
}

/// Run the UDF named `name` against a stored value.
pub fn call_udf(
    registry: &dyn UdfRegistry,
    name: &str,
    stored: &[u8],
    params: &[u8],
) -> Result<Bytes, UdfError> {
    let udf = registry
        .get(name)
        .ok_or_else(|| UdfError::NotFound(name.to_string()))?;
    udf.call(stored, params)
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    #[error("decrypt failed: {0}")]
    Decrypt(String),
}

/// Encrypts payloads on their way to storage and decrypts them on the way
/// back to clients.
pub trait PayloadCipher: Send + Sync + 'static {
    fn encrypt(&self, clear: &[u8]) -> Result<Bytes, CipherError>;
    fn decrypt(&self, sealed: &[u8]) -> Result<Bytes, CipherError>;
}

/// Encrypt a clear, non-empty payload. Anything else is returned as is.
pub fn seal_payload(cipher: &dyn PayloadCipher, payload: &Payload) -> Result<Payload, CipherError> {
    if payload.is_encrypted_by_proxy() || payload.is_empty() {
        return Ok(payload.clone());
    }
    Ok(Payload::encrypted(cipher.encrypt(&payload.data)?))
}

/// Decrypt a payload the proxy encrypted. Anything else is returned as is.
pub fn open_payload(cipher: &dyn PayloadCipher, payload: &Payload) -> Result<Payload, CipherError> {
    if !payload.is_encrypted_by_proxy() {
        return Ok(payload.clone());
    }
    Ok(Payload::clear(cipher.decrypt(&payload.data)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Xor(u8);

    impl PayloadCipher for Xor {
        fn encrypt(&self, clear: &[u8]) -> Result<Bytes, CipherError> {
            Ok(clear.iter().map(|b| b ^ self.0).collect::<Vec<_>>().into())
        }
        fn decrypt(&self, sealed: &[u8]) -> Result<Bytes, CipherError> {
            if sealed.is_empty() {
                return Err(CipherError::Decrypt("empty".into()));
            }
            self.encrypt(sealed)
        }
    }

    #[test]
    fn test_seal_and_open() {
        let cipher = Xor(0x5a);
        let clear = Payload::clear("hello");
        let sealed = seal_payload(&cipher, &clear).unwrap();
        assert!(sealed.is_encrypted_by_proxy());
        assert_ne!(sealed.data, clear.data);

        let opened = open_payload(&cipher, &sealed).unwrap();
        assert_eq!(opened, clear);
    }

    #[test]
    fn test_seal_leaves_empty_and_sealed_alone() {
        let cipher = Xor(1);
        let empty = Payload::default();
        assert_eq!(seal_payload(&cipher, &empty).unwrap(), empty);

        let sealed = Payload::encrypted("x");
        assert_eq!(seal_payload(&cipher, &sealed).unwrap(), sealed);
        assert_eq!(open_payload(&cipher, &Payload::clear("y")).unwrap(), Payload::clear("y"));
    }

    #[test]
    fn test_open_propagates_cipher_error() {
        let err = open_payload(&Xor(1), &Payload::encrypted(Bytes::new())).unwrap_err();
        assert!(matches!(err, CipherError::Decrypt(_)));
    }

    #[test]
    fn test_udf_registry() {
        let udfs = UdfManager::new();
        udfs.register(
            "concat",
            Arc::new(|stored: &[u8], params: &[u8]| -> Result<Bytes, UdfError> {
                Ok([stored, params].concat().into())
            }),
        );

        let out = call_udf(&udfs, "concat", b"ab", b"cd").unwrap();
        assert_eq!(&out[..], b"abcd");

        let err = call_udf(&udfs, "missing", b"", b"").unwrap_err();
        assert!(matches!(err, UdfError::NotFound(name) if name == "missing"));
    }
}
