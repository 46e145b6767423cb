//! Process-wide redaction of registered plaintexts.
//!
//! Sinks that cannot work with [`crate::SecretValue`] directly (legacy log
//! adapters, panic messages) run their output through the global redactor,
//! which strips every registered plaintext before emission.

use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::RwLock;

use crate::value::REDACTED;

#[derive(Default)]
pub struct Redactor {
    // Longest-first so overlapping secrets redact the longer match.
    secrets: RwLock<Vec<String>>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plaintext to strip from future output. Empty strings are
    /// ignored (they would match everywhere).
    pub fn register(&self, plaintext: impl Into<String>) {
        let plaintext = plaintext.into();
        if plaintext.is_empty() {
            return;
        }
        let mut secrets = self.secrets.write();
        if !secrets.contains(&plaintext) {
            secrets.push(plaintext);
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    pub fn unregister(&self, plaintext: &str) {
        self.secrets.write().retain(|s| s != plaintext);
    }

    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }

    /// Strip every registered plaintext from `input`.
    pub fn redact(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        let mut output = input.to_owned();
        for secret in secrets.iter() {
            if output.contains(secret.as_str()) {
                output = output.replace(secret.as_str(), REDACTED);
            }
        }
        output
    }

    /// Redact values of a structured log field map in place.
    pub fn redact_fields(&self, fields: &mut HashMap<String, String>) {
        for value in fields.values_mut() {
            let cleaned = self.redact(value);
            if &cleaned != value {
                *value = cleaned;
            }
        }
    }
}

static GLOBAL: LazyLock<Redactor> = LazyLock::new(Redactor::default);

/// The process-wide redactor.
pub fn global() -> &'static Redactor {
    &GLOBAL
}
