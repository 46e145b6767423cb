//! # armature-secrets
//!
//! Opaque secret values with redaction-by-default, pluggable storage
//! providers, and a process-wide redactor for log sinks.
//!
//! The default [`ObfuscatingProvider`] XOR-masks plaintext in memory; it
//! prevents casual leakage but cannot survive a determined memory reader;
//! production deployments should select the [`SecureMemoryProvider`] via
//! `SECRET_PROVIDER=memory` and `ENABLE_SECURE_MEMORY=true`.
//!
//! ```rust
//! use armature_secrets::{provider_from_env, SecretKind, SecretValue};
//!
//! let provider = provider_from_env().unwrap();
//! let secret = SecretValue::new("sk-1234", SecretKind::Token, provider).unwrap();
//! assert_eq!(format!("{secret}"), "[REDACTED]");
//! assert_eq!(&*secret.reveal(), "sk-1234");
//! ```

pub mod factory;
pub mod obfuscating;
pub mod provider;
pub mod redactor;
pub mod secure;
pub mod value;

pub use factory::{create_provider, provider_from_env, SecretsPolicy};
pub use obfuscating::ObfuscatingProvider;
pub use provider::{SecretError, SecretHandle, SecretKind, SecretMetadata, SecretProvider};
pub use redactor::{global as global_redactor, Redactor};
pub use secure::SecureMemoryProvider;
pub use value::{SecretValue, EMPTY, REDACTED};
