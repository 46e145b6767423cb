//! Provider selection and policy.
//!
//! Environment surface: `SECRET_PROVIDER` (default `insecure`),
//! `ENABLE_SECURE_MEMORY`, `WARN_ON_INSECURE`, `MAX_SECRETS`,
//! `AUTO_DESTROY` (human duration, e.g. `15m`).

use std::sync::Arc;
use std::time::Duration;

use crate::obfuscating::ObfuscatingProvider;
use crate::provider::{ProviderLimits, SecretError, SecretProvider};
use crate::secure::SecureMemoryProvider;

#[derive(Clone, Debug)]
pub struct SecretsPolicy {
    pub provider: String,
    pub enable_secure_memory: bool,
    pub warn_on_insecure: bool,
    pub max_secrets: Option<usize>,
    pub auto_destroy: Option<Duration>,
}

impl Default for SecretsPolicy {
    fn default() -> Self {
        Self {
            provider: crate::obfuscating::PROVIDER_NAME.to_owned(),
            enable_secure_memory: false,
            warn_on_insecure: false,
            max_secrets: None,
            auto_destroy: None,
        }
    }
}

impl SecretsPolicy {
    pub fn from_env() -> Self {
        let truthy = |key: &str| {
            std::env::var(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };
        Self {
            provider: std::env::var("SECRET_PROVIDER")
                .unwrap_or_else(|_| crate::obfuscating::PROVIDER_NAME.to_owned()),
            enable_secure_memory: truthy("ENABLE_SECURE_MEMORY"),
            warn_on_insecure: truthy("WARN_ON_INSECURE"),
            max_secrets: std::env::var("MAX_SECRETS")
                .ok()
                .and_then(|v| v.parse().ok()),
            auto_destroy: std::env::var("AUTO_DESTROY")
                .ok()
                .and_then(|v| humantime::parse_duration(&v).ok()),
        }
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_secrets: self.max_secrets,
            auto_destroy: self.auto_destroy,
        }
    }
}

/// Instantiate the provider named by the policy.
///
/// Requesting secure memory while selecting a non-secure provider is an
/// initialization error, not a silent downgrade.
pub fn create_provider(policy: &SecretsPolicy) -> Result<Arc<dyn SecretProvider>, SecretError> {
    let provider: Arc<dyn SecretProvider> = match policy.provider.as_str() {
        crate::obfuscating::PROVIDER_NAME | "obfuscating" => {
            Arc::new(ObfuscatingProvider::new(policy.limits()))
        }
        crate::secure::PROVIDER_NAME | "secure" => {
            Arc::new(SecureMemoryProvider::new(policy.limits()))
        }
        other => return Err(SecretError::UnknownProvider(other.to_owned())),
    };

    if policy.enable_secure_memory && !provider.is_secure() {
        return Err(SecretError::ProviderNotSecure(provider.name()));
    }
    if policy.warn_on_insecure && !provider.is_secure() {
        tracing::warn!(
            provider = provider.name(),
            "secret provider does not protect plaintext in memory"
        );
    }
    Ok(provider)
}

/// Provider from the process environment.
pub fn provider_from_env() -> Result<Arc<dyn SecretProvider>, SecretError> {
    create_provider(&SecretsPolicy::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_selects_obfuscating() {
        let provider = create_provider(&SecretsPolicy::default()).unwrap();
        assert_eq!(provider.name(), "insecure");
        assert!(!provider.is_secure());
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let policy = SecretsPolicy {
            provider: "vault".to_owned(),
            ..SecretsPolicy::default()
        };
        assert!(matches!(
            create_provider(&policy),
            Err(SecretError::UnknownProvider(name)) if name == "vault"
        ));
    }

    #[test]
    fn secure_memory_requirement_rejects_insecure_provider() {
        let policy = SecretsPolicy {
            enable_secure_memory: true,
            ..SecretsPolicy::default()
        };
        assert!(matches!(
            create_provider(&policy),
            Err(SecretError::ProviderNotSecure("insecure"))
        ));

        let policy = SecretsPolicy {
            provider: "memory".to_owned(),
            enable_secure_memory: true,
            ..SecretsPolicy::default()
        };
        assert!(create_provider(&policy).unwrap().is_secure());
    }

    #[test]
    fn policy_from_env_reads_all_knobs() {
        temp_env::with_vars(
            [
                ("SECRET_PROVIDER", Some("memory")),
                ("ENABLE_SECURE_MEMORY", Some("true")),
                ("MAX_SECRETS", Some("64")),
                ("AUTO_DESTROY", Some("15m")),
            ],
            || {
                let policy = SecretsPolicy::from_env();
                assert_eq!(policy.provider, "memory");
                assert!(policy.enable_secure_memory);
                assert_eq!(policy.max_secrets, Some(64));
                assert_eq!(policy.auto_destroy, Some(Duration::from_secs(900)));
            },
        );
    }
}
