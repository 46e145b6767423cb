//! Reload orchestration.
//!
//! A single reload is in flight at any time: the gate is an atomic
//! compare-and-swap, so exactly one of N simultaneous callers proceeds and
//! the rest are rejected synchronously (no queue). The processing flag is a
//! state sentinel, never held as a lock while module reloads run.
//!
//! Consecutive failures arm an exponential backoff
//! (`base * 2^(n-1)`, capped); while armed, requests are rejected with a
//! message containing `backing off`. A change to a non-dynamic field rejects
//! the whole reload before any module is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::diff::declared_changes;
use crate::config::store::ConfigStore;
use crate::config::{ConfigChange, ConfigError};
use crate::contracts::Reloadable;
use crate::observer::bus::panic_message;
use crate::observer::{types, CloudEvent, ObserverBus};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("reload already in progress")]
    InProgress,

    #[error("backing off after {failures} consecutive failures, retry in {retry_in:?}")]
    BackingOff { failures: u32, retry_in: Duration },

    #[error("section '{section}': non-dynamic field '{path}' changed")]
    NonDynamicField { section: String, path: String },

    #[error("module '{module}' reload failed")]
    ModuleFailed {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}' reload timed out after {timeout:?}")]
    Timeout { module: String, timeout: Duration },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Backoff tuning.
#[derive(Clone, Copy, Debug)]
pub struct ReloadPolicy {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Breaker {
    consecutive_failures: u32,
    next_allowed: Option<Instant>,
}

struct RegisteredModule {
    key: String,
    module: Arc<dyn Reloadable>,
}

/// Snapshot of the circuit breaker, for status surfaces.
#[derive(Clone, Copy, Debug)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    pub retry_in: Option<Duration>,
}

pub struct ReloadOrchestrator {
    store: Arc<ConfigStore>,
    events: Arc<ObserverBus>,
    source: String,
    policy: ReloadPolicy,
    processing: AtomicBool,
    breaker: Mutex<Breaker>,
    /// Registration order is dispatch order.
    modules: Mutex<Vec<RegisteredModule>>,
}

/// Clears the processing flag when the winning request finishes.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ReloadOrchestrator {
    pub fn new(
        store: Arc<ConfigStore>,
        events: Arc<ObserverBus>,
        source: impl Into<String>,
        policy: ReloadPolicy,
    ) -> Self {
        Self {
            store,
            events,
            source: source.into(),
            policy,
            processing: AtomicBool::new(false),
            breaker: Mutex::new(Breaker::default()),
            modules: Mutex::new(Vec::new()),
        }
    }

    /// Register a reloadable module under a key; the key is matched against
    /// change-set section names when dispatching.
    pub fn register_module(&self, key: impl Into<String>, module: Arc<dyn Reloadable>) {
        self.modules.lock().push(RegisteredModule {
            key: key.into(),
            module,
        });
    }

    pub fn unregister_module(&self, key: &str) -> bool {
        let mut modules = self.modules.lock();
        let before = modules.len();
        modules.retain(|m| m.key != key);
        modules.len() != before
    }

    pub fn breaker_state(&self) -> BreakerState {
        let breaker = self.breaker.lock();
        BreakerState {
            consecutive_failures: breaker.consecutive_failures,
            retry_in: breaker
                .next_allowed
                .and_then(|at| at.checked_duration_since(Instant::now())),
        }
    }

    /// Reload the given sections with a manual trigger.
    pub async fn request_reload(
        &self,
        cancel: CancellationToken,
        sections: &[&str],
    ) -> Result<(), ReloadError> {
        self.request_reload_triggered(cancel, "manual", sections).await
    }

    pub async fn request_reload_triggered(
        &self,
        cancel: CancellationToken,
        trigger: &str,
        sections: &[&str],
    ) -> Result<(), ReloadError> {
        // Single-writer gate: the CAS makes exactly one caller the winner
        // even under simultaneous arrivals.
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReloadError::InProgress);
        }
        let _guard = ProcessingGuard(&self.processing);

        {
            let breaker = self.breaker.lock();
            if let Some(next_allowed) = breaker.next_allowed {
                if let Some(retry_in) = next_allowed.checked_duration_since(Instant::now()) {
                    return Err(ReloadError::BackingOff {
                        failures: breaker.consecutive_failures,
                        retry_in,
                    });
                }
            }
        }

        let started = Instant::now();
        self.emit(
            &cancel,
            CloudEvent::new(self.source.clone(), types::RELOAD_START)
                .extension("trigger", trigger)
                .data(serde_json::json!({ "sections": sections })),
        );

        match self.execute(&cancel, sections).await {
            Ok(affected) if affected.is_empty() => {
                {
                    let mut breaker = self.breaker.lock();
                    breaker.consecutive_failures = 0;
                    breaker.next_allowed = None;
                }
                self.emit(
                    &cancel,
                    CloudEvent::new(self.source.clone(), types::RELOAD_NOOP)
                        .extension("trigger", trigger),
                );
                Ok(())
            }
            Ok(affected) => {
                {
                    let mut breaker = self.breaker.lock();
                    breaker.consecutive_failures = 0;
                    breaker.next_allowed = None;
                }
                self.emit(
                    &cancel,
                    CloudEvent::new(self.source.clone(), types::RELOAD_SUCCESS)
                        .extension("trigger", trigger)
                        .data(serde_json::json!({
                            "duration_ms": started.elapsed().as_millis() as u64,
                            "modules": affected,
                        })),
                );
                Ok(())
            }
            Err(error) => {
                if error.trips_breaker() {
                    self.record_failure();
                }
                let failing_module = match &error {
                    ReloadError::ModuleFailed { module, .. }
                    | ReloadError::Timeout { module, .. } => Some(module.clone()),
                    _ => None,
                };
                self.emit(
                    &cancel,
                    CloudEvent::new(self.source.clone(), types::RELOAD_FAILED)
                        .extension("trigger", trigger)
                        .data(serde_json::json!({
                            "error": error.to_string(),
                            "module": failing_module,
                        })),
                );
                Err(error)
            }
        }
    }

    /// Load pending snapshots, validate dynamics, dispatch, commit.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        sections: &[&str],
    ) -> Result<Vec<String>, ReloadError> {
        struct SectionPlan {
            name: String,
            pending: crate::config::store::PendingLoad,
            changes: Vec<ConfigChange>,
        }

        // Phase 1: compute every section's pending state and change set.
        // Validation happens before any module is called.
        let mut plans = Vec::new();
        for section in sections {
            let schema = self.store.schema(section)?;
            let active = self.store.raw(section)?;
            let pending = self.store.load_pending(section)?;

            let sources = |path: &str| -> String {
                pending
                    .provenance
                    .iter()
                    .rev()
                    .find(|o| o.path == path)
                    .map(|o| format!("{}:{}", o.feeder, o.source))
                    .unwrap_or_default()
            };
            let (changes, violations) =
                declared_changes(section, &schema, &active, &pending.raw, &sources);
            if let Some(path) = violations.into_iter().next() {
                return Err(ReloadError::NonDynamicField {
                    section: (*section).to_owned(),
                    path,
                });
            }
            plans.push(SectionPlan {
                name: (*section).to_owned(),
                pending,
                changes,
            });
        }

        // Phase 2: dispatch sequentially in registration order. Each module
        // receives the changes of the section matching its key; modules with
        // an empty change set are skipped.
        let registered: Vec<(String, Arc<dyn Reloadable>)> = {
            let modules = self.modules.lock();
            modules
                .iter()
                .map(|m| (m.key.clone(), m.module.clone()))
                .collect()
        };

        let mut affected = Vec::new();
        for (key, module) in registered {
            if !module.can_reload() {
                continue;
            }
            let changes: Vec<ConfigChange> = plans
                .iter()
                .flat_map(|p| p.changes.iter())
                .filter(|c| c.section == key)
                .cloned()
                .collect();
            if changes.is_empty() {
                continue;
            }

            let timeout = module.reload_timeout();
            let module_cancel = cancel.child_token();
            let call = std::panic::AssertUnwindSafe(module.reload(module_cancel, &changes))
                .catch_unwind();
            match tokio::time::timeout(timeout, call).await {
                Ok(Ok(Ok(()))) => affected.push(key),
                Ok(Ok(Err(source))) => {
                    return Err(ReloadError::ModuleFailed { module: key, source });
                }
                Ok(Err(panic)) => {
                    return Err(ReloadError::ModuleFailed {
                        module: key,
                        source: anyhow::anyhow!("panic: {}", panic_message(&panic)),
                    });
                }
                Err(_elapsed) => {
                    return Err(ReloadError::Timeout {
                        module: key,
                        timeout,
                    });
                }
            }
        }

        // Phase 3: all dispatches succeeded; swap the snapshots in.
        for plan in plans {
            if !plan.changes.is_empty() {
                self.store.commit(&plan.name, plan.pending)?;
            }
        }
        Ok(affected)
    }

    fn record_failure(&self) {
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures += 1;
        let exponent = breaker.consecutive_failures.saturating_sub(1).min(16);
        let delay = self
            .policy
            .backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.policy.backoff_cap);
        breaker.next_allowed = Some(Instant::now() + delay);
        tracing::warn!(
            failures = breaker.consecutive_failures,
            backoff = ?delay,
            "reload failed, backoff armed"
        );
    }

    fn emit(&self, cancel: &CancellationToken, event: CloudEvent) {
        self.events.notify(cancel, &event);
    }
}

impl ReloadError {
    /// Dynamic-field violations, module failures and timeouts feed the
    /// circuit breaker; rejections and config plumbing errors do not.
    fn trips_breaker(&self) -> bool {
        matches!(
            self,
            ReloadError::NonDynamicField { .. }
                | ReloadError::ModuleFailed { .. }
                | ReloadError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::feeders::MapFeeder;
    use crate::config::pipeline::ConfigPipeline;
    use crate::config::schema::{ConfigSection, FieldKind, FieldSpec, SectionSchema};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default, Deserialize, Serialize)]
    #[serde(default)]
    struct LogConfig {
        level: String,
        file: String,
    }

    impl ConfigSection for LogConfig {
        fn schema() -> SectionSchema {
            SectionSchema::new()
                .field(FieldSpec::new("level", FieldKind::Str).default("info").dynamic())
                .field(FieldSpec::new("file", FieldKind::Str).default("app.log"))
        }
    }

    struct CountingReloader {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Reloadable for CountingReloader {
        async fn reload(
            &self,
            _cancel: CancellationToken,
            _changes: &[ConfigChange],
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("refused");
            }
            Ok(())
        }
    }

    fn orchestrator_with(
        values: Vec<(&str, serde_json::Value)>,
        policy: ReloadPolicy,
    ) -> (Arc<ReloadOrchestrator>, Arc<ConfigStore>) {
        let map: std::collections::BTreeMap<String, serde_json::Value> = values
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        let pipeline = ConfigPipeline::new().with_feeder(Arc::new(MapFeeder::new(map)));
        let store = Arc::new(ConfigStore::new(pipeline));
        store.register_section::<LogConfig>("logging", None).unwrap();
        let orchestrator = Arc::new(ReloadOrchestrator::new(
            store.clone(),
            Arc::new(ObserverBus::new()),
            "armature://test",
            policy,
        ));
        (orchestrator, store)
    }

    #[tokio::test]
    async fn identical_config_noops_every_time() {
        let (orchestrator, _store) = orchestrator_with(vec![], ReloadPolicy::default());
        let reloader = Arc::new(CountingReloader {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        orchestrator.register_module("logging", reloader.clone());

        orchestrator
            .request_reload(CancellationToken::new(), &["logging"])
            .await
            .unwrap();
        orchestrator
            .request_reload(CancellationToken::new(), &["logging"])
            .await
            .unwrap();
        // No changes, so the module is never called.
        assert_eq!(reloader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_module_arms_backoff_and_recovers() {
        // The loaded value never changes, so force a change by swapping the
        // active snapshot underneath the orchestrator.
        let policy = ReloadPolicy {
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_secs(1),
        };
        let (orchestrator, store) = orchestrator_with(vec![], policy);
        let reloader = Arc::new(CountingReloader {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        orchestrator.register_module("logging", reloader.clone());

        let divergent = crate::config::store::PendingLoad {
            raw: serde_json::json!({"level": "debug", "file": "app.log"}),
            typed: Arc::new(LogConfig {
                level: "debug".to_owned(),
                file: "app.log".to_owned(),
            }),
            provenance: Vec::new(),
        };
        store.commit("logging", divergent).unwrap();

        // First attempt: module failure, no backoff mention.
        let err = orchestrator
            .request_reload(CancellationToken::new(), &["logging"])
            .await
            .unwrap_err();
        assert!(matches!(err, ReloadError::ModuleFailed { .. }));
        assert!(!err.to_string().contains("backing off"));

        // Second attempt: rejected by the armed breaker.
        let err = orchestrator
            .request_reload(CancellationToken::new(), &["logging"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("backing off"), "got: {err}");
        assert_eq!(reloader.calls.load(Ordering::SeqCst), 1);

        // After the base delay the next attempt executes again.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let err = orchestrator
            .request_reload(CancellationToken::new(), &["logging"])
            .await
            .unwrap_err();
        assert!(matches!(err, ReloadError::ModuleFailed { .. }));
        assert_eq!(reloader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_have_one_winner() {
        struct SlowReloader {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Reloadable for SlowReloader {
            async fn reload(
                &self,
                _cancel: CancellationToken,
                _changes: &[ConfigChange],
            ) -> anyhow::Result<()> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }
        }

        let (orchestrator, store) = orchestrator_with(vec![], ReloadPolicy::default());
        let reloader = Arc::new(SlowReloader {
            calls: AtomicUsize::new(0),
        });
        orchestrator.register_module("logging", reloader.clone());
        store
            .commit(
                "logging",
                crate::config::store::PendingLoad {
                    raw: serde_json::json!({"level": "warn", "file": "app.log"}),
                    typed: Arc::new(LogConfig::default()),
                    provenance: Vec::new(),
                },
            )
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move {
                orchestrator
                    .request_reload(CancellationToken::new(), &["logging"])
                    .await
            }));
        }

        let mut winners = 0;
        let mut rejections = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => winners += 1,
                Err(ReloadError::InProgress) => rejections += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(rejections, 7);
        assert_eq!(reloader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_dynamic_change_rejects_before_dispatch() {
        let (orchestrator, store) = orchestrator_with(vec![], ReloadPolicy::default());
        let reloader = Arc::new(CountingReloader {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        orchestrator.register_module("logging", reloader.clone());

        // Make the *active* snapshot differ from what the pipeline loads in
        // the non-dynamic `file` field.
        store
            .commit(
                "logging",
                crate::config::store::PendingLoad {
                    raw: serde_json::json!({"level": "info", "file": "other.log"}),
                    typed: Arc::new(LogConfig::default()),
                    provenance: Vec::new(),
                },
            )
            .unwrap();

        let err = orchestrator
            .request_reload(CancellationToken::new(), &["logging"])
            .await
            .unwrap_err();
        assert!(
            matches!(&err, ReloadError::NonDynamicField { path, .. } if path == "file"),
            "got: {err}"
        );
        assert_eq!(reloader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_reload_commits_and_resets_breaker() {
        let policy = ReloadPolicy {
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_secs(1),
        };
        let (orchestrator, store) = orchestrator_with(vec![], policy);
        let reloader = Arc::new(CountingReloader {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        orchestrator.register_module("logging", reloader.clone());

        store
            .commit(
                "logging",
                crate::config::store::PendingLoad {
                    raw: serde_json::json!({"level": "trace", "file": "app.log"}),
                    typed: Arc::new(LogConfig::default()),
                    provenance: Vec::new(),
                },
            )
            .unwrap();

        orchestrator
            .request_reload(CancellationToken::new(), &["logging"])
            .await
            .unwrap();
        assert_eq!(reloader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.breaker_state().consecutive_failures, 0);

        // The committed snapshot now matches the pipeline output again.
        let cfg: Arc<LogConfig> = store.get("logging").unwrap();
        assert_eq!(cfg.level, "info");
    }

    #[tokio::test]
    async fn reload_timeout_is_reported() {
        struct Stuck;

        #[async_trait]
        impl Reloadable for Stuck {
            fn reload_timeout(&self) -> Duration {
                Duration::from_millis(30)
            }

            async fn reload(
                &self,
                _cancel: CancellationToken,
                _changes: &[ConfigChange],
            ) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        }

        let (orchestrator, store) = orchestrator_with(vec![], ReloadPolicy::default());
        orchestrator.register_module("logging", Arc::new(Stuck));
        store
            .commit(
                "logging",
                crate::config::store::PendingLoad {
                    raw: serde_json::json!({"level": "warn", "file": "app.log"}),
                    typed: Arc::new(LogConfig::default()),
                    provenance: Vec::new(),
                },
            )
            .unwrap();

        let err = orchestrator
            .request_reload(CancellationToken::new(), &["logging"])
            .await
            .unwrap_err();
        assert!(matches!(err, ReloadError::Timeout { .. }));
    }
}
