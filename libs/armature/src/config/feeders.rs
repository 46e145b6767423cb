//! Feeders: ordered producers of configuration data.
//!
//! A feeder consumes a section schema and writes values into the section's
//! object tree. Two refinements exist: [`KeyedFeeder`] can target a single
//! field, and [`InstanceAwareFeeder`] can populate one section type N times
//! under per-instance key prefixes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use figment::providers::Format;
use figment::Figment;
use serde_json::{Map, Value};

use super::paths;
use super::pipeline::parse_scalar;
use super::schema::{FieldSpec, SectionSchema};
use super::ConfigError;

/// Where a load is headed: the section name and, for module-owned sections,
/// the module name that drives environment key prefixing.
#[derive(Clone, Copy, Debug)]
pub struct FeedScope<'a> {
    pub section: &'a str,
    pub module: Option<&'a str>,
}

impl<'a> FeedScope<'a> {
    pub fn section(section: &'a str) -> Self {
        Self {
            section,
            module: None,
        }
    }

    pub fn module_section(section: &'a str, module: &'a str) -> Self {
        Self {
            section,
            module: Some(module),
        }
    }
}

/// Provenance of one populated field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldOrigin {
    pub path: String,
    /// Feeder that produced the value (`env`, `map`, `file`, `default`).
    pub feeder: &'static str,
    /// Feeder-specific source identifier (environment key, file path, ...).
    pub source: String,
}

pub trait Feeder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write values for `schema` into `out`, returning provenance for every
    /// field written.
    fn feed(
        &self,
        schema: &SectionSchema,
        scope: &FeedScope<'_>,
        out: &mut Map<String, Value>,
    ) -> Result<Vec<FieldOrigin>, ConfigError>;
}

/// Feeder that can populate one field in isolation.
pub trait KeyedFeeder: Feeder {
    fn feed_field(
        &self,
        spec: &FieldSpec,
        scope: &FeedScope<'_>,
        out: &mut Map<String, Value>,
    ) -> Result<Option<FieldOrigin>, ConfigError>;
}

/// Feeder that can populate one section type N times, once per instance id,
/// with a caller-supplied key prefix per instance.
///
/// Implementations must be all-or-nothing: on error no instance tree may be
/// partially written.
pub trait InstanceAwareFeeder: Feeder {
    fn feed_instances(
        &self,
        schema: &SectionSchema,
        scope: &FeedScope<'_>,
        prefix: &(dyn Fn(&str) -> String + Sync),
        out: &mut BTreeMap<String, Map<String, Value>>,
    ) -> Result<Vec<FieldOrigin>, ConfigError>;
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment feeder.
///
/// For a field with external key `K` owned by module `M`, keys are searched
/// in this order, first hit wins: `<M_UPPER>_<K>`, `<K>_<M_UPPER>`, `<K>`.
/// The chosen key is recorded as provenance.
pub struct EnvFeeder {
    lookup: EnvLookup,
}

impl EnvFeeder {
    pub fn new() -> Self {
        Self {
            lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Custom lookup, mainly for tests.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn candidates(spec: &FieldSpec, module: Option<&str>) -> Vec<String> {
        match module {
            Some(module) => {
                let upper = module.to_ascii_uppercase().replace('-', "_");
                vec![
                    format!("{upper}_{}", spec.key),
                    format!("{}_{upper}", spec.key),
                    spec.key.clone(),
                ]
            }
            None => vec![spec.key.clone()],
        }
    }

    fn resolve(&self, spec: &FieldSpec, module: Option<&str>) -> Option<(String, String)> {
        Self::candidates(spec, module)
            .into_iter()
            .find_map(|key| (self.lookup)(&key).map(|raw| (key, raw)))
    }
}

impl Default for EnvFeeder {
    fn default() -> Self {
        Self::new()
    }
}

impl Feeder for EnvFeeder {
    fn name(&self) -> &'static str {
        "env"
    }

    fn feed(
        &self,
        schema: &SectionSchema,
        scope: &FeedScope<'_>,
        out: &mut Map<String, Value>,
    ) -> Result<Vec<FieldOrigin>, ConfigError> {
        let mut origins = Vec::new();
        for spec in schema.fields() {
            if let Some(origin) = self.feed_field(spec, scope, out)? {
                origins.push(origin);
            }
        }
        Ok(origins)
    }
}

impl KeyedFeeder for EnvFeeder {
    fn feed_field(
        &self,
        spec: &FieldSpec,
        scope: &FeedScope<'_>,
        out: &mut Map<String, Value>,
    ) -> Result<Option<FieldOrigin>, ConfigError> {
        let Some((key, raw)) = self.resolve(spec, scope.module) else {
            return Ok(None);
        };
        let value = parse_scalar(spec.kind, &raw, &spec.path)?;
        paths::insert(out, &spec.path, value);
        Ok(Some(FieldOrigin {
            path: spec.path.clone(),
            feeder: "env",
            source: key,
        }))
    }
}

impl InstanceAwareFeeder for EnvFeeder {
    fn feed_instances(
        &self,
        schema: &SectionSchema,
        _scope: &FeedScope<'_>,
        prefix: &(dyn Fn(&str) -> String + Sync),
        out: &mut BTreeMap<String, Map<String, Value>>,
    ) -> Result<Vec<FieldOrigin>, ConfigError> {
        // Stage everything first so a failing instance leaves `out` alone.
        let mut staged: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
        let mut origins = Vec::new();
        for (instance, tree) in out.iter() {
            let instance_prefix = prefix(instance);
            let mut pending = tree.clone();
            for spec in schema.fields() {
                let key = format!("{instance_prefix}_{}", spec.key);
                if let Some(raw) = (self.lookup)(&key) {
                    let value = parse_scalar(spec.kind, &raw, &spec.path)?;
                    paths::insert(&mut pending, &spec.path, value);
                    origins.push(FieldOrigin {
                        path: format!("{instance}.{}", spec.path),
                        feeder: "env",
                        source: key,
                    });
                }
            }
            staged.insert(instance.clone(), pending);
        }
        *out = staged;
        Ok(origins)
    }
}

/// Programmatic feeder over a fixed path → value map.
///
/// Keys address fields either relative to the fed section ("port") or
/// section-qualified ("server.port"), so one feeder built from a flattened
/// document tree can serve every section.
pub struct MapFeeder {
    values: BTreeMap<String, Value>,
}

impl MapFeeder {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn single(path: impl Into<String>, value: Value) -> Self {
        let mut values = BTreeMap::new();
        values.insert(path.into(), value);
        Self { values }
    }
}

impl Feeder for MapFeeder {
    fn name(&self) -> &'static str {
        "map"
    }

    fn feed(
        &self,
        schema: &SectionSchema,
        scope: &FeedScope<'_>,
        out: &mut Map<String, Value>,
    ) -> Result<Vec<FieldOrigin>, ConfigError> {
        let mut origins = Vec::new();
        for spec in schema.fields() {
            if let Some(origin) = self.feed_field(spec, scope, out)? {
                origins.push(origin);
            }
        }
        Ok(origins)
    }
}

impl KeyedFeeder for MapFeeder {
    fn feed_field(
        &self,
        spec: &FieldSpec,
        scope: &FeedScope<'_>,
        out: &mut Map<String, Value>,
    ) -> Result<Option<FieldOrigin>, ConfigError> {
        let qualified = format!("{}.{}", scope.section, spec.path);
        let (key, value) = match self.values.get(&spec.path) {
            Some(value) => (spec.path.clone(), value),
            None => match self.values.get(&qualified) {
                Some(value) => (qualified, value),
                None => return Ok(None),
            },
        };
        paths::insert(out, &spec.path, value.clone());
        Ok(Some(FieldOrigin {
            path: spec.path.clone(),
            feeder: "map",
            source: key,
        }))
    }
}

/// File feeder: reads one document (yaml/yml/json/toml by extension) and
/// copies the section's declared fields out of it.
pub struct FileFeeder {
    path: PathBuf,
}

impl FileFeeder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn document(&self) -> Result<Value, ConfigError> {
        let ext = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let figment = match ext {
            "yaml" | "yml" => {
                Figment::from(figment::providers::Yaml::file(&self.path))
            }
            "json" => Figment::from(figment::providers::Json::file(&self.path)),
            "toml" => Figment::from(figment::providers::Toml::file(&self.path)),
            other => return Err(ConfigError::UnsupportedFormat(other.to_owned())),
        };
        Ok(figment.extract::<Value>()?)
    }
}

impl Feeder for FileFeeder {
    fn name(&self) -> &'static str {
        "file"
    }

    fn feed(
        &self,
        schema: &SectionSchema,
        scope: &FeedScope<'_>,
        out: &mut Map<String, Value>,
    ) -> Result<Vec<FieldOrigin>, ConfigError> {
        let document = self.document()?;
        let Some(section) = document.get(scope.section).and_then(Value::as_object) else {
            return Ok(Vec::new());
        };

        let mut origins = Vec::new();
        for spec in schema.fields() {
            if let Some(value) = paths::get(section, &spec.path) {
                paths::insert(out, &spec.path, value.clone());
                origins.push(FieldOrigin {
                    path: spec.path.clone(),
                    feeder: "file",
                    source: format!("{}#{}", self.path.display(), scope.section),
                });
            }
        }
        Ok(origins)
    }
}
