//! Application core: registration, lifecycle orchestration, runner.
//!
//! Phase order: resolve → (per module) config → inject/construct → init →
//! publish services → start → wait → stop. Start runs in init order, stop in
//! reverse. Stop errors are collected, logged, and the first one is
//! surfaced after every module had its chance to stop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::pipeline::ConfigPipeline;
use crate::config::store::ConfigStore;
use crate::config::Feeder;
use crate::context::ModuleCtx;
use crate::contracts::{Capabilities, HealthReporter, Module, Reloadable, ResolvedServices};
use crate::errors::AppError;
use crate::health::{AggregatedHealth, HealthAggregator, HealthReport, Refresh};
use crate::observer::{types, CloudEvent, Observer, ObserverBus};
use crate::registry::{ModuleRegistry, ModuleSlot};
use crate::reload::{ReloadOrchestrator, ReloadPolicy};
use crate::services::{ProvidingModule, ServiceRegistry};

/// How the runner decides when to stop.
pub enum ShutdownOptions {
    /// Listen for Ctrl+C / SIGTERM.
    Signals,
    /// An external token controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; completion initiates shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

/// Capability comparison for one module: what it declared at registration
/// versus what its (possibly constructor-replaced) instance advertises now.
#[derive(Clone, Debug)]
pub struct ModuleInterfaceReport {
    pub module: String,
    pub declared: Capabilities,
    pub current: Capabilities,
    /// Capabilities the replacement instance no longer advertises. A
    /// non-empty list is a defect in the module's constructor.
    pub lost: Vec<&'static str>,
}

pub struct ApplicationBuilder {
    name: String,
    pipeline: ConfigPipeline,
    reload_policy: ReloadPolicy,
    health_ttl: Duration,
}

impl ApplicationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipeline: ConfigPipeline::new(),
            reload_policy: ReloadPolicy::default(),
            health_ttl: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_feeder(mut self, feeder: Arc<dyn Feeder>) -> Self {
        self.pipeline.push_feeder(feeder);
        self
    }

    #[must_use]
    pub fn reload_policy(mut self, policy: ReloadPolicy) -> Self {
        self.reload_policy = policy;
        self
    }

    #[must_use]
    pub fn health_ttl(mut self, ttl: Duration) -> Self {
        self.health_ttl = ttl;
        self
    }

    pub fn build(self) -> Application {
        let source = format!("armature://{}", self.name);
        let services = Arc::new(ServiceRegistry::new());
        let config = Arc::new(ConfigStore::new(self.pipeline));
        let events = Arc::new(ObserverBus::new());
        let health = Arc::new(HealthAggregator::new(
            events.clone(),
            source.clone(),
            self.health_ttl,
        ));
        let reload = Arc::new(ReloadOrchestrator::new(
            config.clone(),
            events.clone(),
            source.clone(),
            self.reload_policy,
        ));
        Application {
            name: self.name,
            source,
            modules: ModuleRegistry::new(),
            services,
            config,
            events,
            health,
            reload,
            cancel: CancellationToken::new(),
            init_order: RwLock::new(Vec::new()),
            reports: RwLock::new(Vec::new()),
        }
    }
}

pub struct Application {
    name: String,
    source: String,
    modules: ModuleRegistry,
    services: Arc<ServiceRegistry>,
    config: Arc<ConfigStore>,
    events: Arc<ObserverBus>,
    health: Arc<HealthAggregator>,
    reload: Arc<ReloadOrchestrator>,
    cancel: CancellationToken,
    init_order: RwLock<Vec<String>>,
    reports: RwLock<Vec<ModuleInterfaceReport>>,
}

impl Application {
    pub fn builder(name: impl Into<String>) -> ApplicationBuilder {
        ApplicationBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn events(&self) -> &Arc<ObserverBus> {
        &self.events
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    pub fn reloader(&self) -> &Arc<ReloadOrchestrator> {
        &self.reload
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn register_observer(&self, observer: Arc<dyn Observer>, event_types: &[&str]) {
        self.events.register(observer, event_types);
    }

    /// Register a module. Fails fast on a duplicate name.
    pub fn register_module<M: Module>(&self, module: M) -> Result<(), AppError> {
        let name = module.name();
        self.modules.register(module)?;
        self.emit(
            CloudEvent::new(self.source.clone(), types::MODULE_REGISTERED)
                .subject(name)
                .extension("moduleaction", "registered")
                .extension("lifecyclename", name),
        );
        Ok(())
    }

    /// Init order as resolved by the last successful `init`.
    pub fn init_order(&self) -> Vec<String> {
        self.init_order.read().clone()
    }

    /// Capability comparison per module; see [`ModuleInterfaceReport`].
    pub fn module_interface_report(&self) -> Vec<ModuleInterfaceReport> {
        self.reports.read().clone()
    }

    /// Initialize all modules in dependency order.
    pub async fn init(&self) -> Result<(), AppError> {
        self.emit(CloudEvent::new(self.source.clone(), types::BEFORE_INIT));

        let result = self.init_inner().await;
        match &result {
            Ok(()) => self.emit(CloudEvent::new(self.source.clone(), types::AFTER_INIT)),
            Err(error) => self.emit(
                CloudEvent::new(self.source.clone(), types::INIT_FAILED)
                    .data(serde_json::json!({ "error": error.to_string() })),
            ),
        }
        result
    }

    async fn init_inner(&self) -> Result<(), AppError> {
        let order = self.modules.resolve_order(&self.services)?;
        *self.init_order.write() = order.clone();
        tracing::info!(modules = ?order, "initializing application");

        let mut reports = Vec::new();
        for name in &order {
            let Some(slot) = self.modules.slot(name) else {
                continue;
            };
            let ctx = self.ctx_for(&slot);

            if let Some(registrar) = slot.module.as_config_registrar() {
                registrar.register_config(&self.config)?;
            }

            let module = self.inject_and_construct(&slot, &ctx, &mut reports).await?;

            module
                .init(&ctx)
                .await
                .map_err(|source| AppError::InitFailed {
                    module: name.clone(),
                    source,
                })?;
            tracing::debug!(module = %name, "module initialized");

            self.publish_provisions(&slot, module.as_ref());
            self.hook_capabilities(&slot, &module)?;
        }

        *self.reports.write() = reports;
        Ok(())
    }

    /// Run the constructor when the module has one; the returned instance
    /// replaces the registered one. Capability loss is recorded, not fatal.
    async fn inject_and_construct(
        &self,
        slot: &ModuleSlot,
        ctx: &ModuleCtx,
        reports: &mut Vec<ModuleInterfaceReport>,
    ) -> Result<Arc<dyn Module>, AppError> {
        let module = slot.module.clone();
        // Required dependencies are validated for every module; the resolved
        // map is only handed over when there is a constructor to take it.
        let resolved = self.resolve_dependencies(slot)?;

        let Some(constructor) = module.as_constructible() else {
            reports.push(ModuleInterfaceReport {
                module: slot.name.to_owned(),
                declared: slot.declared,
                current: slot.declared,
                lost: Vec::new(),
            });
            return Ok(module);
        };

        let replacement =
            constructor
                .construct(ctx, resolved)
                .await
                .map_err(|source| AppError::ConstructFailed {
                    module: slot.name.to_owned(),
                    source,
                })?;

        let current = Capabilities::of(replacement.as_ref());
        let lost = slot.declared.lost_in(&current);
        if !lost.is_empty() {
            tracing::warn!(
                module = slot.name,
                lost = ?lost,
                "constructor replacement dropped capabilities"
            );
        }
        reports.push(ModuleInterfaceReport {
            module: slot.name.to_owned(),
            declared: slot.declared,
            current,
            lost,
        });

        self.modules.replace(slot.name, replacement.clone());
        Ok(replacement)
    }

    fn resolve_dependencies(&self, slot: &ModuleSlot) -> Result<ResolvedServices, AppError> {
        let mut resolved = ResolvedServices::default();
        for dep in slot.module.dependencies() {
            let entry = if dep.match_by_interface {
                dep.interface
                    .and_then(|key| self.services.by_interface_key(key).into_iter().next())
            } else {
                self.services.entry_by_any_name(&dep.name)
            };
            match entry {
                Some(entry) => resolved.insert(dep.name.clone(), entry.handle().clone()),
                None if dep.required => {
                    return Err(AppError::MissingService {
                        module: slot.name.to_owned(),
                        service: dep.name.clone(),
                    });
                }
                None => {}
            }
        }
        Ok(resolved)
    }

    fn publish_provisions(&self, slot: &ModuleSlot, module: &dyn Module) {
        for provision in module.provisions() {
            let resolved = self.services.register_for_module(
                provision.name.clone(),
                provision.handle,
                ProvidingModule {
                    name: slot.name.to_owned(),
                    type_name: slot.type_name,
                },
            );
            self.emit(
                CloudEvent::new(self.source.clone(), types::SERVICE_REGISTERED)
                    .subject(resolved.clone())
                    .extension("lifecyclesubject", "service")
                    .extension("lifecyclename", resolved)
                    .extension("moduleaction", slot.name),
            );
        }
    }

    /// Wire reload and health capabilities into their aggregators.
    fn hook_capabilities(&self, slot: &ModuleSlot, module: &Arc<dyn Module>) -> Result<(), AppError> {
        if module.as_reloadable().is_some() {
            self.reload
                .register_module(slot.name, Arc::new(ReloadFacet(module.clone())));
        }
        if let Some(reporter) = module.as_health_reporter() {
            let optional = reporter.optional();
            self.health.register_provider(
                slot.name,
                Arc::new(HealthFacet(module.clone())),
                optional,
            )?;
        }
        Ok(())
    }

    /// Start all startable modules in init order.
    pub async fn start(&self) -> Result<(), AppError> {
        self.emit(CloudEvent::new(self.source.clone(), types::BEFORE_START));

        let order = self.init_order.read().clone();
        for name in order {
            let Some(slot) = self.modules.slot(&name) else {
                continue;
            };
            if let Some(startable) = slot.module.as_startable() {
                tracing::debug!(module = %name, "starting module");
                if let Err(source) = startable.start(self.cancel.clone()).await {
                    self.emit(
                        CloudEvent::new(self.source.clone(), types::START_FAILED)
                            .subject(name.clone())
                            .data(serde_json::json!({ "error": source.to_string() })),
                    );
                    return Err(AppError::StartFailed {
                        module: name,
                        source,
                    });
                }
            }
        }

        self.emit(CloudEvent::new(self.source.clone(), types::AFTER_START));
        Ok(())
    }

    /// Stop all stoppable modules in reverse init order. Every module gets
    /// its chance; the first error is surfaced afterwards.
    pub async fn stop(&self) -> Result<(), AppError> {
        self.emit(CloudEvent::new(self.source.clone(), types::BEFORE_STOP));

        let mut first_error: Option<AppError> = None;
        let order = self.init_order.read().clone();
        for name in order.into_iter().rev() {
            let Some(slot) = self.modules.slot(&name) else {
                continue;
            };
            if let Some(stoppable) = slot.module.as_stoppable() {
                tracing::debug!(module = %name, "stopping module");
                if let Err(source) = stoppable.stop(self.cancel.clone()).await {
                    tracing::warn!(module = %name, error = %source, "module stop failed");
                    if first_error.is_none() {
                        first_error = Some(AppError::StopFailed {
                            module: name,
                            source,
                        });
                    }
                }
            }
        }

        match first_error {
            None => {
                self.emit(CloudEvent::new(self.source.clone(), types::AFTER_STOP));
                Ok(())
            }
            Some(error) => {
                self.emit(
                    CloudEvent::new(self.source.clone(), types::STOP_FAILED)
                        .data(serde_json::json!({ "error": error.to_string() })),
                );
                Err(error)
            }
        }
    }

    /// Full cycle: init → start → wait for shutdown → stop.
    pub async fn run(&self, shutdown: ShutdownOptions) -> Result<(), AppError> {
        match shutdown {
            ShutdownOptions::Signals => {
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    if let Err(error) = wait_for_shutdown().await {
                        tracing::warn!(error = %error, "signal waiter failed");
                    } else {
                        tracing::info!("shutdown signal received");
                    }
                    cancel.cancel();
                });
            }
            ShutdownOptions::Token(token) => {
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    token.cancelled().await;
                    cancel.cancel();
                });
            }
            ShutdownOptions::Future(waiter) => {
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    waiter.await;
                    tracing::info!("external shutdown future completed");
                    cancel.cancel();
                });
            }
        }

        self.init().await?;
        self.start().await?;
        self.cancel.cancelled().await;
        self.stop().await
    }

    /// In-process reload endpoint.
    pub async fn request_reload(&self, sections: &[&str]) -> Result<(), AppError> {
        self.reload
            .request_reload(self.cancel.child_token(), sections)
            .await
            .map_err(AppError::from)
    }

    /// In-process health endpoint.
    pub async fn collect_health(&self, refresh: Refresh) -> AggregatedHealth {
        self.health.collect(self.cancel.child_token(), refresh).await
    }

    fn ctx_for(&self, slot: &ModuleSlot) -> ModuleCtx {
        ModuleCtx::new(
            slot.name,
            slot.type_name,
            self.services.clone(),
            self.config.clone(),
            self.events.clone(),
            self.cancel.child_token(),
        )
    }

    fn emit(&self, event: CloudEvent) {
        self.events.notify(&self.cancel, &event);
    }
}

/// Reload view over a module. Capability lookups happen per call, so a
/// constructor replacement that dropped `Reloadable` degrades to a no-op
/// instead of holding a stale reference.
struct ReloadFacet(Arc<dyn Module>);

#[async_trait::async_trait]
impl Reloadable for ReloadFacet {
    fn can_reload(&self) -> bool {
        self.0.as_reloadable().is_some_and(Reloadable::can_reload)
    }

    fn reload_timeout(&self) -> Duration {
        self.0
            .as_reloadable()
            .map_or(Duration::from_secs(30), Reloadable::reload_timeout)
    }

    async fn reload(
        &self,
        cancel: CancellationToken,
        changes: &[crate::config::ConfigChange],
    ) -> anyhow::Result<()> {
        match self.0.as_reloadable() {
            Some(reloadable) => reloadable.reload(cancel, changes).await,
            None => Ok(()),
        }
    }
}

/// Health view over a module; same per-call lookup as [`ReloadFacet`].
struct HealthFacet(Arc<dyn Module>);

#[async_trait::async_trait]
impl HealthReporter for HealthFacet {
    fn optional(&self) -> bool {
        self.0.as_health_reporter().is_some_and(HealthReporter::optional)
    }

    async fn health_check(&self, cancel: CancellationToken) -> anyhow::Result<Vec<HealthReport>> {
        match self.0.as_health_reporter() {
            Some(reporter) => reporter.health_check(cancel).await,
            None => Ok(Vec::new()),
        }
    }
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
