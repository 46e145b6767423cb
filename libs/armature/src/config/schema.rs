//! Declarative per-field metadata for configuration sections.
//!
//! A [`ConfigSection`] describes itself with a [`SectionSchema`]: one
//! [`FieldSpec`] per field, carrying the external key, the string-encoded
//! default, and the required/dynamic flags. The pipeline walks the schema,
//! never the struct, so missing or extra keys in the incoming data are
//! structurally meaningless.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Runtime type of a configuration field, used for default parsing and
/// zero-value detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Bool,
    /// Signed integer with the target width in bits (8, 16, 32 or 64).
    Int(u32),
    /// Unsigned integer with the target width in bits.
    UInt(u32),
    /// Floating point with the target width in bits (32 or 64).
    Float(u32),
    /// Human-readable duration ("30s", "5m"); serialized as its string form.
    Duration,
    /// `Vec<String>`, defaulted from a JSON array literal.
    StrList,
    /// `HashMap<String, String>`, defaulted from a JSON object literal.
    StrMap,
}

/// Metadata for a single field.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    /// Dotted path within the section ("endpoint.host").
    pub path: String,
    /// Desired external key, consulted by key-oriented feeders (env).
    pub key: String,
    pub kind: FieldKind,
    /// String-encoded default, parsed per `kind` when the field is still at
    /// its zero value after all feeders ran.
    pub default: Option<String>,
    pub required: bool,
    /// Dynamic fields may change at runtime through the reload orchestrator.
    pub dynamic: bool,
    pub description: Option<String>,
    /// Optional value rule: `nonempty`, `min:<n>`, `max:<n>` or
    /// `oneof:a|b|c`.
    pub rule: Option<String>,
}

impl FieldSpec {
    pub fn new(path: impl Into<String>, kind: FieldKind) -> Self {
        let path = path.into();
        // Default external key: last path segment, upper snake case.
        let key = path
            .rsplit('.')
            .next()
            .unwrap_or(&path)
            .to_ascii_uppercase();
        Self {
            path,
            key,
            kind,
            default: None,
            required: false,
            dynamic: false,
            description: None,
            rule: None,
        }
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    #[must_use]
    pub fn default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    #[must_use]
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    #[must_use]
    pub fn rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }
}

/// Ordered field metadata for one section.
#[derive(Clone, Debug, Default)]
pub struct SectionSchema {
    fields: Vec<FieldSpec>,
}

impl SectionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Splice a nested section's fields in under `prefix`. Dynamic flags are
    /// per-field and do not inherit from the parent.
    #[must_use]
    pub fn nest(mut self, prefix: &str, child: SectionSchema) -> Self {
        for mut spec in child.fields {
            spec.path = format!("{prefix}.{}", spec.path);
            self.fields.push(spec);
        }
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, path: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.path == path)
    }

    /// All paths flagged dynamic.
    pub fn dynamic_paths(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|f| f.dynamic)
            .map(|f| f.path.clone())
            .collect()
    }

    /// All paths flagged required.
    pub fn required_paths(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.path.as_str())
            .collect()
    }
}

/// A typed configuration entity with declarative field metadata.
///
/// Implementations should put `#[serde(default)]` on the struct so fields
/// absent from the loaded tree fall back to their zero values before default
/// application is judged.
pub trait ConfigSection: DeserializeOwned + Serialize + Send + Sync + 'static {
    fn schema() -> SectionSchema;

    /// Entity-level validation, called after defaults and required checks.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}
