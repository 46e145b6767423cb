//! Secure-memory provider: plaintext held in zero-on-drop buffers.
//!
//! Buffers are wiped when destroyed, replaced or expired. Page locking is
//! out of scope; the guarantee is that destroyed material does not linger in
//! reusable allocations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use zeroize::Zeroizing;

use crate::provider::{
    ct_eq, ProviderLimits, SecretError, SecretHandle, SecretKind, SecretMetadata, SecretProvider,
};

pub const PROVIDER_NAME: &str = "memory";

struct Entry {
    data: Zeroizing<Vec<u8>>,
    kind: SecretKind,
    created_at: DateTime<Utc>,
    stored: Instant,
}

pub struct SecureMemoryProvider {
    entries: DashMap<u64, Entry>,
    next: AtomicU64,
    limits: ProviderLimits,
}

impl SecureMemoryProvider {
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

    fn with_entry<R>(
        &self,
        handle: SecretHandle,
        f: impl FnOnce(&Entry) -> R,
    ) -> Result<R, SecretError> {
        let entry = self.entries.get(&handle.0).ok_or(SecretError::InvalidHandle)?;
        if self.expired(&entry) {
            drop(entry);
            self.entries.remove(&handle.0);
            return Err(SecretError::InvalidHandle);
        }
        Ok(f(&entry))
    }
}

impl SecretProvider for SecureMemoryProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn store(&self, plaintext: &str, kind: SecretKind) -> Result<SecretHandle, SecretError> {
        self.cleanup();
        if let Some(max) = self.limits.max_secrets {
            if self.entries.len() >= max {
                return Err(SecretError::CapacityExceeded { max });
            }
        }
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            id,
            Entry {
                data: Zeroizing::new(plaintext.as_bytes().to_vec()),
                kind,
                created_at: Utc::now(),
                stored: Instant::now(),
            },
        );
        Ok(SecretHandle(id))
    }

    fn retrieve(&self, handle: SecretHandle) -> Result<Zeroizing<String>, SecretError> {
        self.with_entry(handle, |entry| {
            String::from_utf8(entry.data.to_vec()).map(Zeroizing::new)
        })?
        .map_err(|_| SecretError::InvalidHandle)
    }

    fn destroy(&self, handle: SecretHandle) -> Result<(), SecretError> {
        // Zeroizing wipes the buffer as the entry drops.
        self.entries.remove(&handle.0);
        Ok(())
    }

    fn compare(&self, handle: SecretHandle, candidate: &str) -> Result<bool, SecretError> {
        self.with_entry(handle, |entry| ct_eq(&entry.data, candidate.as_bytes()))
    }

    fn is_empty(&self, handle: SecretHandle) -> Result<bool, SecretError> {
        self.with_entry(handle, |entry| entry.data.is_empty())
    }

    fn clone_handle(&self, handle: SecretHandle) -> Result<SecretHandle, SecretError> {
        let (data, kind) =
            self.with_entry(handle, |entry| (entry.data.clone(), entry.kind))?;
        if let Some(max) = self.limits.max_secrets {
            if self.entries.len() >= max {
                return Err(SecretError::CapacityExceeded { max });
            }
        }
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            id,
            Entry {
                data,
                kind,
                created_at: Utc::now(),
                stored: Instant::now(),
            },
        );
        Ok(SecretHandle(id))
    }

    fn metadata(&self, handle: SecretHandle) -> Result<SecretMetadata, SecretError> {
        self.with_entry(handle, |entry| SecretMetadata {
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
