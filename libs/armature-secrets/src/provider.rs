//! Pluggable secret storage backends.

use chrono::{DateTime, Utc};
use thiserror::Error;
use zeroize::Zeroizing;

/// Classification of a secret's content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SecretKind {
    Generic,
    Password,
    Token,
    Key,
    Certificate,
}

impl SecretKind {
    /// Type-aware redaction marker for structured masking integrations.
    pub fn marker(self) -> &'static str {
        match self {
            SecretKind::Generic => "[REDACTED]",
            SecretKind::Password => "[PASSWORD]",
            SecretKind::Token => "[TOKEN]",
            SecretKind::Key => "[KEY]",
            SecretKind::Certificate => "[CERTIFICATE]",
        }
    }
}

/// Opaque handle into a provider's storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SecretHandle(pub(crate) u64);

#[derive(Clone, Debug, PartialEq)]
pub struct SecretMetadata {
    pub kind: SecretKind,
    pub created_at: DateTime<Utc>,
    pub provider: &'static str,
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("unknown secret provider '{0}'")]
    UnknownProvider(String),

    #[error("secret provider '{0}' is not secure but secure memory is required")]
    ProviderNotSecure(&'static str),

    #[error("secret handle is invalid or destroyed")]
    InvalidHandle,

    #[error("secret store capacity of {max} exceeded")]
    CapacityExceeded { max: usize },

    #[error("provider cannot compare by handle")]
    CompareUnsupported,
}

/// Storage backend for secret material.
///
/// Providers own plaintext for the lifetime of a handle and perform
/// comparison without leaking timing information.
pub trait SecretProvider: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether the backing storage protects plaintext at rest in memory.
    fn is_secure(&self) -> bool;

    fn store(&self, plaintext: &str, kind: SecretKind) -> Result<SecretHandle, SecretError>;

    fn retrieve(&self, handle: SecretHandle) -> Result<Zeroizing<String>, SecretError>;

    fn destroy(&self, handle: SecretHandle) -> Result<(), SecretError>;

    /// Constant-time comparison against a candidate plaintext. Providers
    /// that cannot compare by handle return [`SecretError::CompareUnsupported`]
    /// and the caller falls back to retrieve-and-compare.
    fn compare(&self, handle: SecretHandle, candidate: &str) -> Result<bool, SecretError>;

    fn is_empty(&self, handle: SecretHandle) -> Result<bool, SecretError>;

    fn clone_handle(&self, handle: SecretHandle) -> Result<SecretHandle, SecretError>;

    fn metadata(&self, handle: SecretHandle) -> Result<SecretMetadata, SecretError>;

    /// Purge expired entries (auto-destroy policy).
    fn cleanup(&self);
}

/// Constant-time byte comparison: the full length is always walked, and the
/// accumulated difference never branches.
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    let len_diff = a.len() ^ b.len();
    let len = a.len().max(b.len());
    let mut acc = 0u8;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        acc |= x ^ y;
    }
    len_diff == 0 && acc == 0
}

/// Per-provider limits from the factory policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProviderLimits {
    pub max_secrets: Option<usize>,
    pub auto_destroy: Option<std::time::Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ct_eq_matches_on_equal_inputs() {
        assert!(ct_eq(b"", b""));
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
        assert!(!ct_eq(b"", b"x"));
    }

    #[test]
    fn kind_markers() {
        assert_eq!(SecretKind::Generic.marker(), "[REDACTED]");
        assert_eq!(SecretKind::Password.marker(), "[PASSWORD]");
        assert_eq!(SecretKind::Certificate.marker(), "[CERTIFICATE]");
    }
}
