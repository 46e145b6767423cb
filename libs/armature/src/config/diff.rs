//! Configuration diffing.
//!
//! [`generate_config_diff`] walks two section trees in lock step and
//! produces added/removed/changed maps keyed by dotted path.
//! [`declared_changes`] walks the *declared schema* instead of the actual
//! values, which makes missing or extra keys structurally meaningless; the
//! reload orchestrator uses it to split dynamic from non-dynamic changes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::paths;
use super::schema::SectionSchema;

pub const REDACTED: &str = "[REDACTED]";

/// One changed field, with the feeder-level source of the new value.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigChange {
    pub section: String,
    pub path: String,
    pub old: Value,
    pub new: Value,
    /// Identifier of whatever produced the new value (feeder name, env key).
    pub source: String,
}

#[derive(Clone, Debug, Default)]
pub struct DiffOptions {
    /// Paths excluded from the diff entirely.
    pub ignore: BTreeSet<String>,
    /// Paths whose values are kept but masked in [`ConfigDiff::redacted`].
    pub sensitive: BTreeSet<String>,
}

#[derive(Clone, Debug)]
pub struct ConfigDiff {
    pub section: String,
    pub changed: BTreeMap<String, ConfigChange>,
    pub added: BTreeMap<String, Value>,
    pub removed: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
    sensitive: BTreeSet<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Copy limited to paths under `prefix`.
    #[must_use]
    pub fn filter_prefix(&self, prefix: &str) -> ConfigDiff {
        let matches = |path: &str| path == prefix || path.starts_with(&format!("{prefix}."));
        ConfigDiff {
            section: self.section.clone(),
            changed: self
                .changed
                .iter()
                .filter(|(p, _)| matches(p))
                .map(|(p, c)| (p.clone(), c.clone()))
                .collect(),
            added: self
                .added
                .iter()
                .filter(|(p, _)| matches(p))
                .map(|(p, v)| (p.clone(), v.clone()))
                .collect(),
            removed: self
                .removed
                .iter()
                .filter(|(p, _)| matches(p))
                .map(|(p, v)| (p.clone(), v.clone()))
                .collect(),
            created_at: self.created_at,
            id: self.id,
            sensitive: self.sensitive.clone(),
        }
    }

    /// Copy with sensitive paths masked.
    #[must_use]
    pub fn redacted(&self) -> ConfigDiff {
        let mask = Value::String(REDACTED.to_owned());
        let mask_value = |path: &str, value: &Value| {
            if self.sensitive.contains(path) {
                mask.clone()
            } else {
                value.clone()
            }
        };
        ConfigDiff {
            section: self.section.clone(),
            changed: self
                .changed
                .iter()
                .map(|(p, c)| {
                    (
                        p.clone(),
                        ConfigChange {
                            section: c.section.clone(),
                            path: c.path.clone(),
                            old: mask_value(p, &c.old),
                            new: mask_value(p, &c.new),
                            source: c.source.clone(),
                        },
                    )
                })
                .collect(),
            added: self
                .added
                .iter()
                .map(|(p, v)| (p.clone(), mask_value(p, v)))
                .collect(),
            removed: self
                .removed
                .iter()
                .map(|(p, v)| (p.clone(), mask_value(p, v)))
                .collect(),
            created_at: self.created_at,
            id: self.id,
            sensitive: self.sensitive.clone(),
        }
    }
}

/// Lock-step diff of two section trees.
pub fn generate_config_diff(
    section: &str,
    old: &Value,
    new: &Value,
    options: &DiffOptions,
) -> ConfigDiff {
    let old_flat = paths::flatten(old);
    let new_flat = paths::flatten(new);

    let mut changed = BTreeMap::new();
    let mut added = BTreeMap::new();
    let mut removed = BTreeMap::new();

    for (path, old_value) in &old_flat {
        if options.ignore.contains(path) {
            continue;
        }
        match new_flat.get(path) {
            Some(new_value) if new_value != old_value => {
                changed.insert(
                    path.clone(),
                    ConfigChange {
                        section: section.to_owned(),
                        path: path.clone(),
                        old: old_value.clone(),
                        new: new_value.clone(),
                        source: String::new(),
                    },
                );
            }
            Some(_) => {}
            None => {
                removed.insert(path.clone(), old_value.clone());
            }
        }
    }
    for (path, new_value) in &new_flat {
        if options.ignore.contains(path) || old_flat.contains_key(path) {
            continue;
        }
        added.insert(path.clone(), new_value.clone());
    }

    ConfigDiff {
        section: section.to_owned(),
        changed,
        added,
        removed,
        created_at: Utc::now(),
        id: Uuid::new_v4(),
        sensitive: options.sensitive.clone(),
    }
}

/// Diff restricted to paths the schema marks dynamic. Non-dynamic changes do
/// not contribute; they still exist in the full diff and the reload
/// orchestrator rejects them separately.
pub fn generate_dynamic_diff(
    section: &str,
    old: &Value,
    new: &Value,
    schema: &SectionSchema,
    options: &DiffOptions,
) -> ConfigDiff {
    let dynamic = schema.dynamic_paths();
    let full = generate_config_diff(section, old, new, options);
    ConfigDiff {
        section: full.section.clone(),
        changed: full
            .changed
            .into_iter()
            .filter(|(p, _)| dynamic.contains(p))
            .collect(),
        added: full
            .added
            .into_iter()
            .filter(|(p, _)| dynamic.contains(p))
            .collect(),
        removed: full
            .removed
            .into_iter()
            .filter(|(p, _)| dynamic.contains(p))
            .collect(),
        created_at: full.created_at,
        id: full.id,
        sensitive: full.sensitive,
    }
}

/// Field-level changes over the *declared* schema: for every declared path,
/// compare old and new, and split the result into dynamic changes and the
/// non-dynamic paths that changed. `sources` resolves the feeder that
/// produced each new value.
pub(crate) fn declared_changes(
    section: &str,
    schema: &SectionSchema,
    old: &Value,
    new: &Value,
    sources: &dyn Fn(&str) -> String,
) -> (Vec<ConfigChange>, Vec<String>) {
    let empty = Map::new();
    let old_map = old.as_object().unwrap_or(&empty);
    let new_map = new.as_object().unwrap_or(&empty);

    let mut dynamic = Vec::new();
    let mut violations = Vec::new();
    for spec in schema.fields() {
        let old_value = paths::get(old_map, &spec.path).cloned().unwrap_or(Value::Null);
        let new_value = paths::get(new_map, &spec.path).cloned().unwrap_or(Value::Null);
        if old_value == new_value {
            continue;
        }
        if spec.dynamic {
            dynamic.push(ConfigChange {
                section: section.to_owned(),
                path: spec.path.clone(),
                old: old_value,
                new: new_value,
                source: sources(&spec.path),
            });
        } else {
            violations.push(spec.path.clone());
        }
    }
    (dynamic, violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{FieldKind, FieldSpec};
    use serde_json::json;

    #[test]
    fn identical_trees_diff_empty() {
        let value = json!({"a": 1, "b": {"c": "x"}});
        let diff = generate_config_diff("s", &value, &value, &DiffOptions::default());
        assert!(diff.is_empty());
    }

    #[test]
    fn changed_added_removed_are_split() {
        let old = json!({"keep": 1, "change": "a", "drop": true});
        let new = json!({"keep": 1, "change": "b", "fresh": 2});
        let diff = generate_config_diff("s", &old, &new, &DiffOptions::default());

        assert_eq!(diff.changed.len(), 1);
        let change = &diff.changed["change"];
        assert_eq!(change.old, json!("a"));
        assert_eq!(change.new, json!("b"));
        assert_eq!(diff.added.get("fresh"), Some(&json!(2)));
        assert_eq!(diff.removed.get("drop"), Some(&json!(true)));
    }

    #[test]
    fn ignored_paths_do_not_contribute() {
        let old = json!({"a": 1, "noise": 1});
        let new = json!({"a": 2, "noise": 2});
        let options = DiffOptions {
            ignore: ["noise".to_owned()].into(),
            ..DiffOptions::default()
        };
        let diff = generate_config_diff("s", &old, &new, &options);
        assert_eq!(diff.changed.len(), 1);
        assert!(diff.changed.contains_key("a"));
    }

    #[test]
    fn redacted_copy_masks_sensitive_paths_only() {
        let old = json!({"token": "old-secret", "port": 1});
        let new = json!({"token": "new-secret", "port": 2});
        let options = DiffOptions {
            sensitive: ["token".to_owned()].into(),
            ..DiffOptions::default()
        };
        let diff = generate_config_diff("s", &old, &new, &options);

        // The diff itself retains values.
        assert_eq!(diff.changed["token"].new, json!("new-secret"));

        let masked = diff.redacted();
        assert_eq!(masked.changed["token"].old, json!(REDACTED));
        assert_eq!(masked.changed["token"].new, json!(REDACTED));
        assert_eq!(masked.changed["port"].new, json!(2));
    }

    #[test]
    fn prefix_filter_keeps_subtree() {
        let old = json!({"db": {"host": "a", "port": 1}, "misc": 1});
        let new = json!({"db": {"host": "b", "port": 2}, "misc": 2});
        let diff = generate_config_diff("s", &old, &new, &DiffOptions::default());
        let db_only = diff.filter_prefix("db");
        assert_eq!(db_only.changed.len(), 2);
        assert!(db_only.changed.contains_key("db.host"));
        assert!(!db_only.changed.contains_key("misc"));
    }

    #[test]
    fn dynamic_diff_drops_non_dynamic_paths() {
        let schema = crate::config::schema::SectionSchema::new()
            .field(FieldSpec::new("level", FieldKind::Str).dynamic())
            .field(FieldSpec::new("port", FieldKind::UInt(16)));
        let old = json!({"level": "info", "port": 1});
        let new = json!({"level": "debug", "port": 2});
        let diff = generate_dynamic_diff("s", &old, &new, &schema, &DiffOptions::default());
        assert_eq!(diff.changed.len(), 1);
        assert!(diff.changed.contains_key("level"));
    }

    #[test]
    fn declared_changes_split_dynamic_and_violations() {
        let schema = crate::config::schema::SectionSchema::new()
            .field(FieldSpec::new("level", FieldKind::Str).dynamic())
            .field(FieldSpec::new("port", FieldKind::UInt(16)));
        let old = json!({"level": "info", "port": 1, "junk": true});
        let new = json!({"level": "debug", "port": 2});
        let (dynamic, violations) =
            declared_changes("s", &schema, &old, &new, &|_| "env".to_owned());

        assert_eq!(dynamic.len(), 1);
        assert_eq!(dynamic[0].path, "level");
        assert_eq!(dynamic[0].source, "env");
        // "junk" is undeclared and therefore meaningless; "port" changed and
        // is not dynamic.
        assert_eq!(violations, vec!["port"]);
    }
}
