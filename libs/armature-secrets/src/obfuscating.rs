//! Default provider: XOR-masked in-memory storage.
//!
//! Plaintext never sits in memory as-is: each secret gets a fresh random
//! mask and only the masked bytes plus the mask are retained. This does not
//! protect against a debugger reading both buffers; it prevents casual
//! leakage (core dumps grepped for known strings, accidental logging of the
//! raw store). Deployments that need real protection select the
//! secure-memory provider.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use zeroize::Zeroizing;

use crate::provider::{
    ct_eq, ProviderLimits, SecretError, SecretHandle, SecretKind, SecretMetadata, SecretProvider,
};

pub const PROVIDER_NAME: &str = "insecure";

struct Entry {
    mask: Vec<u8>,
    masked: Vec<u8>,
    kind: SecretKind,
    created_at: DateTime<Utc>,
    stored: Instant,
}

impl Entry {
    fn unmask(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(
            self.masked
                .iter()
                .zip(self.mask.iter())
                .map(|(m, k)| m ^ k)
                .collect(),
        )
    }
}

pub struct ObfuscatingProvider {
    entries: DashMap<u64, Entry>,
    next: AtomicU64,
    limits: ProviderLimits,
}

impl ObfuscatingProvider {
    pub fn new(limits: ProviderLimits) -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU64::new(1),
            limits,
        }
    }

    fn expired(&self, entry: &Entry) -> bool {
        self.limits
            .auto_destroy
            .is_some_and(|ttl| entry.stored.elapsed() >= ttl)
    }

    fn entry_bytes(&self, handle: SecretHandle) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let entry = self.entries.get(&handle.0).ok_or(SecretError::InvalidHandle)?;
        if self.expired(&entry) {
            drop(entry);
            self.entries.remove(&handle.0);
            return Err(SecretError::InvalidHandle);
        }
        Ok(entry.unmask())
    }
}

impl SecretProvider for ObfuscatingProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn store(&self, plaintext: &str, kind: SecretKind) -> Result<SecretHandle, SecretError> {
        self.cleanup();
        if let Some(max) = self.limits.max_secrets {
            if self.entries.len() >= max {
                return Err(SecretError::CapacityExceeded { max });
            }
        }

        let bytes = plaintext.as_bytes();
        let mut mask = vec![0u8; bytes.len()];
        rand::rng().fill(&mut mask[..]);
        let masked: Vec<u8> = bytes.iter().zip(mask.iter()).map(|(b, k)| b ^ k).collect();

        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            id,
            Entry {
                mask,
                masked,
                kind,
                created_at: Utc::now(),
                stored: Instant::now(),
            },
        );
        Ok(SecretHandle(id))
    }

    fn retrieve(&self, handle: SecretHandle) -> Result<Zeroizing<String>, SecretError> {
        let bytes = self.entry_bytes(handle)?;
        String::from_utf8(bytes.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| SecretError::InvalidHandle)
    }

    fn destroy(&self, handle: SecretHandle) -> Result<(), SecretError> {
        // Buffers are dropped here; the mask alone is useless afterwards.
        self.entries.remove(&handle.0);
        Ok(())
    }

    fn compare(&self, handle: SecretHandle, candidate: &str) -> Result<bool, SecretError> {
        let bytes = self.entry_bytes(handle)?;
        Ok(ct_eq(&bytes, candidate.as_bytes()))
    }

    fn is_empty(&self, handle: SecretHandle) -> Result<bool, SecretError> {
        Ok(self.entry_bytes(handle)?.is_empty())
    }

    fn clone_handle(&self, handle: SecretHandle) -> Result<SecretHandle, SecretError> {
        let (plaintext, kind) = {
            let bytes = self.entry_bytes(handle)?;
            let entry = self.entries.get(&handle.0).ok_or(SecretError::InvalidHandle)?;
            (bytes, entry.kind)
        };
        let text = String::from_utf8(plaintext.to_vec()).map_err(|_| SecretError::InvalidHandle)?;
        self.store(&text, kind)
    }

    fn metadata(&self, handle: SecretHandle) -> Result<SecretMetadata, SecretError> {
        let entry = self.entries.get(&handle.0).ok_or(SecretError::InvalidHandle)?;
        Ok(SecretMetadata {
            kind: entry.kind,
            created_at: entry.created_at,
            provider: PROVIDER_NAME,
        })
    }

    fn cleanup(&self) {
        let Some(ttl) = self.limits.auto_destroy else {
            return;
        };
        self.entries.retain(|_, entry| entry.stored.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn store_and_retrieve_round_trip() {
        let provider = ObfuscatingProvider::new(ProviderLimits::default());
        let handle = provider.store("sk-1234", SecretKind::Token).unwrap();
        assert_eq!(&*provider.retrieve(handle).unwrap(), "sk-1234");
        assert!(!provider.is_empty(handle).unwrap());
        assert!(provider.compare(handle, "sk-1234").unwrap());
        assert!(!provider.compare(handle, "sk-5678").unwrap());
    }

    #[test]
    fn destroyed_handle_is_invalid() {
        let provider = ObfuscatingProvider::new(ProviderLimits::default());
        let handle = provider.store("x", SecretKind::Generic).unwrap();
        provider.destroy(handle).unwrap();
        assert!(matches!(
            provider.retrieve(handle),
            Err(SecretError::InvalidHandle)
        ));
    }

    #[test]
    fn clone_handle_is_independent() {
        let provider = ObfuscatingProvider::new(ProviderLimits::default());
        let original = provider.store("shared", SecretKind::Generic).unwrap();
        let copy = provider.clone_handle(original).unwrap();
        provider.destroy(original).unwrap();
        assert_eq!(&*provider.retrieve(copy).unwrap(), "shared");
    }

    #[test]
    fn capacity_is_enforced() {
        let provider = ObfuscatingProvider::new(ProviderLimits {
            max_secrets: Some(2),
            auto_destroy: None,
        });
        provider.store("a", SecretKind::Generic).unwrap();
        provider.store("b", SecretKind::Generic).unwrap();
        assert!(matches!(
            provider.store("c", SecretKind::Generic),
            Err(SecretError::CapacityExceeded { max: 2 })
        ));
    }

    #[test]
    fn auto_destroy_expires_entries() {
        let provider = ObfuscatingProvider::new(ProviderLimits {
            max_secrets: None,
            auto_destroy: Some(Duration::from_millis(10)),
        });
        let handle = provider.store("fleeting", SecretKind::Generic).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            provider.retrieve(handle),
            Err(SecretError::InvalidHandle)
        ));
    }

    #[test]
    fn masked_bytes_do_not_contain_plaintext() {
        let provider = ObfuscatingProvider::new(ProviderLimits::default());
        let handle = provider.store("super-secret", SecretKind::Generic).unwrap();
        let entry = provider.entries.get(&handle.0).unwrap();
        assert_ne!(entry.masked, b"super-secret".to_vec());
    }
}
