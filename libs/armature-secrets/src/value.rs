//! The opaque secret carrier.
//!
//! Every incidental way a value can leak (`Display`, `Debug`, serde) emits
//! a redaction marker; only [`SecretValue::reveal`] returns plaintext.
//! Equality is constant-time through the provider, falling back to
//! reveal-and-compare when the provider cannot compare by handle.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use zeroize::Zeroizing;

use crate::provider::{ct_eq, SecretError, SecretHandle, SecretKind, SecretProvider};

pub const REDACTED: &str = "[REDACTED]";
pub const EMPTY: &str = "[EMPTY]";

pub struct SecretValue {
    provider: Arc<dyn SecretProvider>,
    handle: Mutex<Option<SecretHandle>>,
    kind: SecretKind,
    empty: bool,
    created_at: DateTime<Utc>,
}

impl SecretValue {
    /// Store `plaintext` with the given classification.
    pub fn new(
        plaintext: &str,
        kind: SecretKind,
        provider: Arc<dyn SecretProvider>,
    ) -> Result<Self, SecretError> {
        let handle = provider.store(plaintext, kind)?;
        Ok(Self {
            provider,
            handle: Mutex::new(Some(handle)),
            kind,
            empty: plaintext.is_empty(),
            created_at: Utc::now(),
        })
    }

    pub fn kind(&self) -> SecretKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True for values created from an empty string or already destroyed.
    pub fn is_empty(&self) -> bool {
        self.empty || self.handle.lock().is_none()
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle.lock().is_none()
    }

    /// The only way to the plaintext. Returns an empty string after
    /// [`destroy`](Self::destroy).
    pub fn reveal(&self) -> Zeroizing<String> {
        let handle = *self.handle.lock();
        match handle {
            Some(handle) => self
                .provider
                .retrieve(handle)
                .unwrap_or_else(|_| Zeroizing::new(String::new())),
            None => Zeroizing::new(String::new()),
        }
    }

    /// Constant-time comparison against a candidate string.
    pub fn equals_str(&self, candidate: &str) -> bool {
        let handle = *self.handle.lock();
        let Some(handle) = handle else {
            return ct_eq(b"", candidate.as_bytes());
        };
        match self.provider.compare(handle, candidate) {
            Ok(result) => result,
            Err(SecretError::CompareUnsupported) => {
                ct_eq(self.reveal().as_bytes(), candidate.as_bytes())
            }
            Err(_) => ct_eq(b"", candidate.as_bytes()),
        }
    }

    /// Constant-time comparison against another secret, across providers.
    pub fn equals(&self, other: &SecretValue) -> bool {
        let mine = self.reveal();
        other.equals_str(&mine)
    }

    /// Independent copy with the same plaintext and classification.
    pub fn try_clone(&self) -> Result<SecretValue, SecretError> {
        let handle = *self.handle.lock();
        let cloned = match handle {
            Some(handle) => Some(self.provider.clone_handle(handle)?),
            None => None,
        };
        Ok(Self {
            provider: self.provider.clone(),
            handle: Mutex::new(cloned),
            kind: self.kind,
            empty: self.empty,
            created_at: self.created_at,
        })
    }

    /// Zero internal state and invalidate the handle. Reveal afterwards
    /// returns the empty string.
    pub fn destroy(&self) {
        if let Some(handle) = self.handle.lock().take() {
            // Provider-side buffers are wiped; errors here mean the handle
            // was already gone.
            let _ = self.provider.destroy(handle);
        }
    }

    /// Redaction marker for this value (`[EMPTY]` for empty or destroyed).
    pub fn marker(&self) -> &'static str {
        if self.is_empty() {
            EMPTY
        } else {
            REDACTED
        }
    }

    /// Type-aware marker (`[PASSWORD]`, `[TOKEN]`, ...) for structured
    /// masking integrations.
    pub fn typed_marker(&self) -> &'static str {
        if self.is_empty() {
            EMPTY
        } else {
            self.kind.marker()
        }
    }
}

impl Clone for SecretValue {
    fn clone(&self) -> Self {
        self.try_clone().unwrap_or_else(|_| Self {
            provider: self.provider.clone(),
            handle: Mutex::new(None),
            kind: self.kind,
            empty: true,
            created_at: self.created_at,
        })
    }
}

impl Drop for SecretValue {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

impl Serialize for SecretValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.marker())
    }
}

impl PartialEq for SecretValue {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscating::ObfuscatingProvider;
    use crate::provider::ProviderLimits;

    fn provider() -> Arc<dyn SecretProvider> {
        Arc::new(ObfuscatingProvider::new(ProviderLimits::default()))
    }

    #[test]
    fn formatting_never_leaks() {
        let secret = SecretValue::new("sk-1234", SecretKind::Token, provider()).unwrap();
        assert_eq!(format!("{secret}"), REDACTED);
        assert_eq!(format!("{secret:?}"), REDACTED);
        let wrapped = format!("token is {secret:?}!");
        assert!(!wrapped.contains("sk-1234"));
    }

    #[test]
    fn json_form_redacts_in_structs() {
        #[derive(Serialize)]
        struct Credentials {
            user: String,
            api_key: SecretValue,
        }

        let creds = Credentials {
            user: "alice".to_owned(),
            api_key: SecretValue::new("sk-1234", SecretKind::Token, provider()).unwrap(),
        };
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("\"[REDACTED]\""));
        assert!(!json.contains("sk-1234"));
    }

    #[test]
    fn reveal_and_equality() {
        let secret = SecretValue::new("sk-1234", SecretKind::Token, provider()).unwrap();
        assert_eq!(&*secret.reveal(), "sk-1234");
        assert!(secret.equals_str("sk-1234"));
        assert!(!secret.equals_str("sk-5678"));
    }

    #[test]
    fn empty_values_use_empty_marker() {
        let secret = SecretValue::new("", SecretKind::Generic, provider()).unwrap();
        assert!(secret.is_empty());
        assert_eq!(format!("{secret}"), EMPTY);
    }

    #[test]
    fn clone_is_independent() {
        let secret = SecretValue::new("shared", SecretKind::Generic, provider()).unwrap();
        let copy = secret.clone();
        secret.destroy();
        assert_eq!(&*secret.reveal(), "");
        assert_eq!(&*copy.reveal(), "shared");
        assert_eq!(copy.kind(), SecretKind::Generic);
    }

    #[test]
    fn destroy_invalidates_and_marks_empty() {
        let secret = SecretValue::new("gone", SecretKind::Generic, provider()).unwrap();
        secret.destroy();
        assert!(secret.is_destroyed());
        assert_eq!(&*secret.reveal(), "");
        assert_eq!(format!("{secret}"), EMPTY);
        // A destroyed secret equals only the empty string.
        assert!(secret.equals_str(""));
        assert!(!secret.equals_str("gone"));
    }

    #[test]
    fn cross_value_equality() {
        let a = SecretValue::new("same", SecretKind::Generic, provider()).unwrap();
        let b = SecretValue::new("same", SecretKind::Generic, provider()).unwrap();
        let c = SecretValue::new("other", SecretKind::Generic, provider()).unwrap();
        assert!(a.equals(&b));
        assert!(!a.equals(&c));
    }

    #[test]
    fn typed_markers_follow_kind() {
        let token = SecretValue::new("t", SecretKind::Token, provider()).unwrap();
        assert_eq!(token.typed_marker(), "[TOKEN]");
        let password = SecretValue::new("p", SecretKind::Password, provider()).unwrap();
        assert_eq!(password.typed_marker(), "[PASSWORD]");
    }
}
