//! Section store: owns the active configuration snapshots.
//!
//! Each registered section keeps its schema, the active raw tree (swapped
//! atomically on reload commit), the typed entity, and field provenance.
//! The store also keeps a monomorphized loader per section so the reload
//! orchestrator can re-drive the pipeline without knowing entity types.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde_json::Value;

use super::feeders::{FeedScope, FieldOrigin};
use super::pipeline::ConfigPipeline;
use super::schema::{ConfigSection, SectionSchema};
use super::ConfigError;

/// A freshly loaded, not yet committed section state.
pub(crate) struct PendingLoad {
    pub raw: Value,
    pub typed: Arc<dyn Any + Send + Sync>,
    pub provenance: Vec<FieldOrigin>,
}

type Loader = Box<dyn Fn(&ConfigPipeline, FeedScope<'_>) -> Result<PendingLoad, ConfigError> + Send + Sync>;

struct SectionState {
    module: Option<String>,
    schema: SectionSchema,
    raw: ArcSwap<Value>,
    typed: RwLock<Arc<dyn Any + Send + Sync>>,
    provenance: RwLock<Vec<FieldOrigin>>,
    loader: Loader,
}

pub struct ConfigStore {
    pipeline: ConfigPipeline,
    sections: RwLock<HashMap<String, Arc<SectionState>>>,
}

impl ConfigStore {
    pub fn new(pipeline: ConfigPipeline) -> Self {
        Self {
            pipeline,
            sections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a section and load it immediately through the feeder chain.
    /// `module` attributes the section to a module, which enables the
    /// module-prefixed environment key search.
    pub fn register_section<T: ConfigSection>(
        &self,
        section: &str,
        module: Option<&str>,
    ) -> Result<Arc<T>, ConfigError> {
        {
            let sections = self.sections.read();
            if sections.contains_key(section) {
                return Err(ConfigError::SectionAlreadyRegistered(section.to_owned()));
            }
        }

        let loader: Loader = Box::new(|pipeline, scope| {
            let loaded = pipeline.load::<T>(&scope)?;
            Ok(PendingLoad {
                raw: loaded.raw,
                typed: Arc::new(loaded.value) as Arc<dyn Any + Send + Sync>,
                provenance: loaded.provenance,
            })
        });

        let scope = match module {
            Some(module) => FeedScope::module_section(section, module),
            None => FeedScope::section(section),
        };
        let initial = loader(&self.pipeline, scope)?;
        let typed = initial
            .typed
            .clone()
            .downcast::<T>()
            .map_err(|_| ConfigError::WrongSectionType(section.to_owned()))?;

        let state = Arc::new(SectionState {
            module: module.map(str::to_owned),
            schema: T::schema(),
            raw: ArcSwap::from_pointee(initial.raw),
            typed: RwLock::new(initial.typed),
            provenance: RwLock::new(initial.provenance),
            loader,
        });
        self.sections.write().insert(section.to_owned(), state);
        tracing::debug!(section, module = module.unwrap_or("-"), "config section registered");
        Ok(typed)
    }

    /// Current typed snapshot of a section.
    pub fn get<T: ConfigSection>(&self, section: &str) -> Result<Arc<T>, ConfigError> {
        let state = self.state(section)?;
        let typed = state.typed.read().clone();
        typed
            .downcast::<T>()
            .map_err(|_| ConfigError::WrongSectionType(section.to_owned()))
    }

    /// Current raw snapshot of a section.
    pub fn raw(&self, section: &str) -> Result<Arc<Value>, ConfigError> {
        Ok(self.state(section)?.raw.load_full())
    }

    pub fn schema(&self, section: &str) -> Result<SectionSchema, ConfigError> {
        Ok(self.state(section)?.schema.clone())
    }

    pub fn provenance(&self, section: &str) -> Result<Vec<FieldOrigin>, ConfigError> {
        Ok(self.state(section)?.provenance.read().clone())
    }

    /// Feeder-level source of one field's current value, as
    /// `<feeder>:<source>` (empty when the field has no recorded origin).
    pub fn source_of(&self, section: &str, path: &str) -> String {
        self.state(section)
            .ok()
            .and_then(|state| {
                state
                    .provenance
                    .read()
                    .iter()
                    .rev()
                    .find(|o| o.path == path)
                    .map(|o| format!("{}:{}", o.feeder, o.source))
            })
            .unwrap_or_default()
    }

    pub fn sections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, section: &str) -> bool {
        self.sections.read().contains_key(section)
    }

    pub fn module_of(&self, section: &str) -> Option<String> {
        self.state(section).ok().and_then(|s| s.module.clone())
    }

    /// Re-run the feeder chain for a section without committing the result.
    pub(crate) fn load_pending(&self, section: &str) -> Result<PendingLoad, ConfigError> {
        let state = self.state(section)?;
        let scope = match &state.module {
            Some(module) => FeedScope::module_section(section, module),
            None => FeedScope::section(section),
        };
        (state.loader)(&self.pipeline, scope)
    }

    /// Swap a pending load in as the active snapshot.
    pub(crate) fn commit(&self, section: &str, pending: PendingLoad) -> Result<(), ConfigError> {
        let state = self.state(section)?;
        state.raw.store(Arc::new(pending.raw));
        *state.typed.write() = pending.typed;
        *state.provenance.write() = pending.provenance;
        Ok(())
    }

    fn state(&self, section: &str) -> Result<Arc<SectionState>, ConfigError> {
        self.sections
            .read()
            .get(section)
            .cloned()
            .ok_or_else(|| ConfigError::SectionNotRegistered(section.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::feeders::MapFeeder;
    use crate::config::schema::{FieldKind, FieldSpec};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Default, Deserialize, Serialize)]
    #[serde(default)]
    struct CacheConfig {
        capacity: u64,
        eviction: String,
    }

    impl ConfigSection for CacheConfig {
        fn schema() -> SectionSchema {
            SectionSchema::new()
                .field(FieldSpec::new("capacity", FieldKind::UInt(32)).default("128"))
                .field(
                    FieldSpec::new("eviction", FieldKind::Str)
                        .default("lru")
                        .rule("oneof:lru|lfu"),
                )
        }
    }

    fn store() -> ConfigStore {
        ConfigStore::new(
            ConfigPipeline::new()
                .with_feeder(Arc::new(MapFeeder::single("capacity", json!(512)))),
        )
    }

    #[test]
    fn register_loads_and_typed_get_works() {
        let store = store();
        let cfg = store.register_section::<CacheConfig>("cache", None).unwrap();
        assert_eq!(cfg.capacity, 512);
        assert_eq!(cfg.eviction, "lru");

        let again: Arc<CacheConfig> = store.get("cache").unwrap();
        assert_eq!(again.capacity, 512);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let store = store();
        store.register_section::<CacheConfig>("cache", None).unwrap();
        let err = store
            .register_section::<CacheConfig>("cache", None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::SectionAlreadyRegistered(_)));
    }

    #[test]
    fn wrong_type_get_is_detected() {
        #[derive(Debug, Default, Deserialize, Serialize)]
        struct Other {}
        impl ConfigSection for Other {
            fn schema() -> SectionSchema {
                SectionSchema::new()
            }
        }

        let store = store();
        store.register_section::<CacheConfig>("cache", None).unwrap();
        let err = store.get::<Other>("cache").unwrap_err();
        assert!(matches!(err, ConfigError::WrongSectionType(_)));
    }

    #[test]
    fn source_of_reports_feeder_and_key() {
        let store = store();
        store.register_section::<CacheConfig>("cache", None).unwrap();
        assert_eq!(store.source_of("cache", "capacity"), "map:capacity");
        assert_eq!(store.source_of("cache", "eviction"), "default:lru");
        assert_eq!(store.source_of("cache", "ghost"), "");
    }

    #[test]
    fn commit_swaps_snapshots() {
        let store = store();
        store.register_section::<CacheConfig>("cache", None).unwrap();

        let pending = PendingLoad {
            raw: json!({"capacity": 9, "eviction": "lfu"}),
            typed: Arc::new(CacheConfig {
                capacity: 9,
                eviction: "lfu".to_owned(),
            }),
            provenance: Vec::new(),
        };
        store.commit("cache", pending).unwrap();

        let cfg: Arc<CacheConfig> = store.get("cache").unwrap();
        assert_eq!(cfg.capacity, 9);
        assert_eq!(*store.raw("cache").unwrap(), json!({"capacity": 9, "eviction": "lfu"}));
    }
}
