//! Application-level reload: a module registers its own config section,
//! declares itself reloadable, and reacts to dynamic changes driven through
//! a mutable programmatic feeder.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use armature::{
    Application, ConfigChange, ConfigError, ConfigRegistrar, ConfigSection, ConfigStore, FeedScope,
    Feeder, FieldKind, FieldOrigin, FieldSpec, Module, ModuleCtx, ReloadError, Reloadable,
    SectionSchema,
};

/// Feeder over shared mutable state, so tests can change "the world"
/// between reload requests.
#[derive(Clone, Default)]
struct SharedFeeder {
    values: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl SharedFeeder {
    fn set(&self, path: &str, value: Value) {
        self.values.lock().unwrap().insert(path.to_owned(), value);
    }
}

impl Feeder for SharedFeeder {
    fn name(&self) -> &'static str {
        "shared"
    }

    fn feed(
        &self,
        schema: &SectionSchema,
        _scope: &FeedScope<'_>,
        out: &mut Map<String, Value>,
    ) -> Result<Vec<FieldOrigin>, ConfigError> {
        let values = self.values.lock().unwrap();
        let mut origins = Vec::new();
        for spec in schema.fields() {
            if let Some(value) = values.get(&spec.path) {
                out.insert(spec.path.clone(), value.clone());
                origins.push(FieldOrigin {
                    path: spec.path.clone(),
                    feeder: "shared",
                    source: spec.path.clone(),
                });
            }
        }
        Ok(origins)
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct LimiterConfig {
    rate: u64,
    burst: u64,
}

impl ConfigSection for LimiterConfig {
    fn schema() -> SectionSchema {
        SectionSchema::new()
            .field(FieldSpec::new("rate", FieldKind::UInt(32)).default("100").dynamic())
            .field(FieldSpec::new("burst", FieldKind::UInt(32)).default("10"))
    }
}

struct Limiter {
    applied: Arc<Mutex<Vec<ConfigChange>>>,
}

#[async_trait]
impl Module for Limiter {
    fn name(&self) -> &'static str {
        "limiter"
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: Arc<LimiterConfig> = ctx.config("limiter")?;
        anyhow::ensure!(cfg.rate > 0, "rate must be positive");
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_config_registrar(&self) -> Option<&dyn ConfigRegistrar> {
        Some(self)
    }

    fn as_reloadable(&self) -> Option<&dyn Reloadable> {
        Some(self)
    }
}

impl ConfigRegistrar for Limiter {
    fn register_config(&self, store: &ConfigStore) -> Result<(), ConfigError> {
        store.register_section::<LimiterConfig>("limiter", Some("limiter"))?;
        Ok(())
    }
}

#[async_trait]
impl Reloadable for Limiter {
    async fn reload(
        &self,
        _cancel: CancellationToken,
        changes: &[ConfigChange],
    ) -> anyhow::Result<()> {
        self.applied.lock().unwrap().extend(changes.iter().cloned());
        Ok(())
    }
}

fn build(feeder: SharedFeeder) -> (Application, Arc<Mutex<Vec<ConfigChange>>>) {
    let applied = Arc::new(Mutex::new(Vec::new()));
    let app = Application::builder("reload-e2e")
        .with_feeder(Arc::new(feeder))
        .build();
    app.register_module(Limiter {
        applied: applied.clone(),
    })
    .unwrap();
    (app, applied)
}

#[tokio::test]
async fn dynamic_change_flows_to_module_and_store() {
    let feeder = SharedFeeder::default();
    let (app, applied) = build(feeder.clone());
    app.init().await.unwrap();

    let before: Arc<LimiterConfig> = app.config().get("limiter").unwrap();
    assert_eq!(before.rate, 100);

    feeder.set("rate", json!(250));
    app.request_reload(&["limiter"]).await.unwrap();

    let applied = applied.lock().unwrap().clone();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].path, "rate");
    assert_eq!(applied[0].old, json!(100));
    assert_eq!(applied[0].new, json!(250));
    assert_eq!(applied[0].source, "shared:rate");

    let after: Arc<LimiterConfig> = app.config().get("limiter").unwrap();
    assert_eq!(after.rate, 250);
}

#[tokio::test]
async fn unchanged_config_is_a_noop() {
    let feeder = SharedFeeder::default();
    let (app, applied) = build(feeder);
    app.init().await.unwrap();

    app.request_reload(&["limiter"]).await.unwrap();
    app.request_reload(&["limiter"]).await.unwrap();
    assert!(applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn non_dynamic_change_rejects_whole_reload() {
    let feeder = SharedFeeder::default();
    let (app, applied) = build(feeder.clone());
    app.init().await.unwrap();

    feeder.set("burst", json!(99));
    feeder.set("rate", json!(500));
    let err = app.request_reload(&["limiter"]).await.unwrap_err();
    assert!(err.to_string().contains("burst"), "got: {err}");

    // Nothing dispatched, nothing committed.
    assert!(applied.lock().unwrap().is_empty());
    let cfg: Arc<LimiterConfig> = app.config().get("limiter").unwrap();
    assert_eq!(cfg.rate, 100);
    assert_eq!(cfg.burst, 10);
}

#[tokio::test]
async fn reload_errors_keep_identity_through_app_error() {
    let feeder = SharedFeeder::default();
    let (app, _applied) = build(feeder.clone());
    app.init().await.unwrap();

    feeder.set("burst", json!(1));
    let err = app.request_reload(&["limiter"]).await.unwrap_err();
    match err {
        armature::AppError::Reload(ReloadError::NonDynamicField { section, path }) => {
            assert_eq!(section, "limiter");
            assert_eq!(path, "burst");
        }
        other => panic!("expected NonDynamicField, got {other:?}"),
    }
}
