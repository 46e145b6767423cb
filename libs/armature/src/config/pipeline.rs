//! Feeder chain execution: load, default, validate, extract.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::feeders::{FeedScope, Feeder, FieldOrigin, InstanceAwareFeeder};
use super::paths;
use super::schema::{ConfigSection, FieldKind, FieldSpec, SectionSchema};
use super::ConfigError;

/// Result of loading one section: the typed entity, the raw tree it was
/// extracted from, and per-field provenance.
#[derive(Debug)]
pub struct Loaded<T> {
    pub value: T,
    pub raw: Value,
    pub provenance: Vec<FieldOrigin>,
}

/// Ordered feeder chain. Later feeders override earlier ones; defaults only
/// fill fields every feeder left at their zero value.
#[derive(Clone, Default)]
pub struct ConfigPipeline {
    feeders: Vec<Arc<dyn Feeder>>,
}

impl ConfigPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_feeder(mut self, feeder: Arc<dyn Feeder>) -> Self {
        self.feeders.push(feeder);
        self
    }

    pub fn push_feeder(&mut self, feeder: Arc<dyn Feeder>) {
        self.feeders.push(feeder);
    }

    pub fn feeders(&self) -> &[Arc<dyn Feeder>] {
        &self.feeders
    }

    /// Load one section through the chain.
    pub fn load<T: ConfigSection>(&self, scope: &FeedScope<'_>) -> Result<Loaded<T>, ConfigError> {
        let schema = T::schema();
        let mut out = Map::new();
        let mut provenance = Vec::new();
        for feeder in &self.feeders {
            provenance.extend(feeder.feed(&schema, scope, &mut out)?);
        }
        provenance.extend(apply_defaults(&schema, &mut out)?);
        check_required(&schema, &out, scope.section)?;
        check_rules(&schema, &out)?;
        extract(scope.section, &schema, out, provenance)
    }

    /// Populate one section type once per instance id, applying the
    /// per-instance key prefix through every instance-aware feeder.
    ///
    /// All-or-nothing: an error from any feeder or any instance leaves no
    /// partial result behind.
    pub fn load_instances<T: ConfigSection>(
        &self,
        scope: &FeedScope<'_>,
        instances: &[&str],
        prefix: &(dyn Fn(&str) -> String + Sync),
        instance_feeders: &[&dyn InstanceAwareFeeder],
    ) -> Result<BTreeMap<String, Loaded<T>>, ConfigError> {
        let schema = T::schema();
        let mut trees: BTreeMap<String, Map<String, Value>> = instances
            .iter()
            .map(|id| ((*id).to_owned(), Map::new()))
            .collect();

        let mut provenance = Vec::new();
        for feeder in instance_feeders {
            provenance.extend(feeder.feed_instances(&schema, scope, prefix, &mut trees)?);
        }

        let mut loaded = BTreeMap::new();
        for (instance, mut tree) in trees {
            let mut instance_prov: Vec<FieldOrigin> = provenance
                .iter()
                .filter(|o| o.path.starts_with(&format!("{instance}.")))
                .cloned()
                .collect();
            instance_prov.extend(apply_defaults(&schema, &mut tree)?);
            check_required(&schema, &tree, scope.section)?;
            check_rules(&schema, &tree)?;
            loaded.insert(instance, extract(scope.section, &schema, tree, instance_prov)?);
        }
        Ok(loaded)
    }
}

fn extract<T: ConfigSection>(
    section: &str,
    _schema: &SectionSchema,
    out: Map<String, Value>,
    provenance: Vec<FieldOrigin>,
) -> Result<Loaded<T>, ConfigError> {
    let raw = Value::Object(out);
    let value: T =
        serde_json::from_value(raw.clone()).map_err(|source| ConfigError::Deserialize {
            section: section.to_owned(),
            source,
        })?;
    value
        .validate()
        .map_err(|message| ConfigError::ValidationFailed {
            section: section.to_owned(),
            message,
        })?;
    Ok(Loaded {
        value,
        raw,
        provenance,
    })
}

/// Fill fields still at their zero value from their declared defaults.
/// Applying defaults twice is indistinguishable from applying them once.
pub(crate) fn apply_defaults(
    schema: &SectionSchema,
    out: &mut Map<String, Value>,
) -> Result<Vec<FieldOrigin>, ConfigError> {
    let mut origins = Vec::new();
    for spec in schema.fields() {
        let Some(default) = &spec.default else {
            continue;
        };
        let current_is_zero = match paths::get(out, &spec.path) {
            None => true,
            Some(value) => is_zero(spec.kind, value),
        };
        if !current_is_zero {
            continue;
        }
        let parsed = parse_scalar(spec.kind, default, &spec.path)?;
        paths::insert(out, &spec.path, parsed);
        origins.push(FieldOrigin {
            path: spec.path.clone(),
            feeder: "default",
            source: default.clone(),
        });
    }
    Ok(origins)
}

/// Every missing required path is reported in one aggregated error.
pub(crate) fn check_required(
    schema: &SectionSchema,
    out: &Map<String, Value>,
    section: &str,
) -> Result<(), ConfigError> {
    let missing: Vec<String> = schema
        .required_paths()
        .into_iter()
        .filter(|path| {
            let spec = schema.get(path).unwrap_or_else(|| unreachable!());
            match paths::get(out, path) {
                None => true,
                Some(value) => is_zero(spec.kind, value),
            }
        })
        .map(str::to_owned)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingRequired {
            section: section.to_owned(),
            paths: missing,
        })
    }
}

fn check_rules(schema: &SectionSchema, out: &Map<String, Value>) -> Result<(), ConfigError> {
    for spec in schema.fields() {
        let Some(rule) = &spec.rule else { continue };
        let Some(value) = paths::get(out, &spec.path) else {
            continue;
        };
        if !rule_holds(rule, value) {
            return Err(ConfigError::RuleViolation {
                path: spec.path.clone(),
                rule: rule.clone(),
            });
        }
    }
    Ok(())
}

fn rule_holds(rule: &str, value: &Value) -> bool {
    if rule == "nonempty" {
        return value.as_str().is_none_or(|s| !s.is_empty());
    }
    if let Some(n) = rule.strip_prefix("min:") {
        let Ok(bound) = n.parse::<f64>() else {
            return true;
        };
        return value.as_f64().is_none_or(|v| v >= bound);
    }
    if let Some(n) = rule.strip_prefix("max:") {
        let Ok(bound) = n.parse::<f64>() else {
            return true;
        };
        return value.as_f64().is_none_or(|v| v <= bound);
    }
    if let Some(options) = rule.strip_prefix("oneof:") {
        return value
            .as_str()
            .is_none_or(|s| options.split('|').any(|o| o == s));
    }
    // Unknown rules are advisory metadata, never a failure.
    true
}

/// Zero value per field kind: the value defaults are allowed to overwrite.
pub(crate) fn is_zero(kind: FieldKind, value: &Value) -> bool {
    match kind {
        FieldKind::Str => value.as_str().is_some_and(str::is_empty),
        FieldKind::Bool => value.as_bool() == Some(false),
        FieldKind::Int(_) => value.as_i64() == Some(0),
        FieldKind::UInt(_) => value.as_u64() == Some(0),
        FieldKind::Float(_) => value.as_f64() == Some(0.0),
        FieldKind::Duration => value
            .as_str()
            .and_then(|s| humantime::parse_duration(s).ok())
            .is_some_and(|d| d.is_zero()),
        FieldKind::StrList => value.as_array().is_some_and(Vec::is_empty),
        FieldKind::StrMap => value.as_object().is_some_and(Map::is_empty),
    }
}

/// Parse a string-encoded value into the field's runtime type. Used for both
/// defaults and key-oriented feeders (environment values).
pub(crate) fn parse_scalar(kind: FieldKind, raw: &str, path: &str) -> Result<Value, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        path: path.to_owned(),
        value: raw.to_owned(),
        kind,
    };
    let overflow = || ConfigError::Overflow {
        path: path.to_owned(),
        value: raw.to_owned(),
        kind,
    };

    match kind {
        FieldKind::Str => Ok(Value::String(raw.to_owned())),
        FieldKind::Bool => raw.parse::<bool>().map(Value::Bool).map_err(|_| invalid()),
        FieldKind::Int(bits) => {
            let parsed = raw.parse::<i64>().map_err(|_| invalid())?;
            let fits = match bits {
                8 => i64::from(i8::MIN) <= parsed && parsed <= i64::from(i8::MAX),
                16 => i64::from(i16::MIN) <= parsed && parsed <= i64::from(i16::MAX),
                32 => i64::from(i32::MIN) <= parsed && parsed <= i64::from(i32::MAX),
                _ => true,
            };
            if !fits {
                return Err(overflow());
            }
            Ok(Value::from(parsed))
        }
        FieldKind::UInt(bits) => {
            let parsed = raw.parse::<u64>().map_err(|_| invalid())?;
            let fits = match bits {
                8 => parsed <= u64::from(u8::MAX),
                16 => parsed <= u64::from(u16::MAX),
                32 => parsed <= u64::from(u32::MAX),
                _ => true,
            };
            if !fits {
                return Err(overflow());
            }
            Ok(Value::from(parsed))
        }
        FieldKind::Float(bits) => {
            let parsed = raw.parse::<f64>().map_err(|_| invalid())?;
            if bits == 32 && parsed.is_finite() && !f64::from(parsed as f32).is_finite() {
                return Err(overflow());
            }
            Ok(Value::from(parsed))
        }
        FieldKind::Duration => {
            humantime::parse_duration(raw).map_err(|_| invalid())?;
            // Durations travel as their human string form; entity fields use
            // humantime-serde to pick them up.
            Ok(Value::String(raw.to_owned()))
        }
        FieldKind::StrList => {
            let parsed: Vec<String> = serde_json::from_str(raw).map_err(|_| invalid())?;
            Ok(Value::from(parsed))
        }
        FieldKind::StrMap => {
            let parsed: std::collections::HashMap<String, String> =
                serde_json::from_str(raw).map_err(|_| invalid())?;
            serde_json::to_value(parsed).map_err(|_| invalid())
        }
    }
}
