//! Module contracts: the core [`Module`] trait and its optional capabilities.
//!
//! A module is a named, self-describing unit. The runtime discovers what a
//! module can do through the `as_*` accessors: each capability is a separate
//! trait, and a module opts in by overriding the accessor to return `Some`.
//! Capability accessors must be stable for a given instance: the runtime
//! snapshots the capability set before and after constructor replacement and
//! reports any capability that went missing (see
//! [`crate::app::Application::module_interface_report`]).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::diff::ConfigChange;
use crate::context::ModuleCtx;
use crate::health::HealthReport;
use crate::services::{ServiceHandle, TypeKey};

/// Core module: DI/wiring entry point. Runs once, in dependency order.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Unique module name. Duplicate names are a registration error.
    fn name(&self) -> &'static str;

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;

    /// Explicit name-based dependencies on other modules.
    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    /// Service dependencies this module needs satisfied before `init`.
    fn dependencies(&self) -> Vec<ServiceDependency> {
        Vec::new()
    }

    /// Services this module provides. Called once before order resolution
    /// (names and interfaces drive the implicit dependency graph) and once
    /// after `init` to publish the handles; implementations must be pure.
    fn provisions(&self) -> Vec<ServiceProvision> {
        Vec::new()
    }

    fn as_startable(&self) -> Option<&dyn Startable> {
        None
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }

    fn as_constructible(&self) -> Option<&dyn Constructible> {
        None
    }

    fn as_reloadable(&self) -> Option<&dyn Reloadable> {
        None
    }

    fn as_health_reporter(&self) -> Option<&dyn HealthReporter> {
        None
    }

    fn as_config_registrar(&self) -> Option<&dyn ConfigRegistrar> {
        None
    }
}

/// Long-running side of a module. Start runs in init order, stop in reverse.
#[async_trait]
pub trait Startable: Send + Sync {
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Stoppable: Send + Sync {
    async fn stop(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Constructor-based service injection.
///
/// The returned instance *replaces* the registered module. It must keep every
/// capability the original declared; a lost capability is recorded as a
/// defect in the interface report rather than aborting initialization.
#[async_trait]
pub trait Constructible: Send + Sync {
    async fn construct(
        &self,
        ctx: &ModuleCtx,
        services: ResolvedServices,
    ) -> anyhow::Result<Arc<dyn Module>>;
}

/// In-place reaction to dynamic configuration changes.
///
/// Implementations must validate the change set before mutating any state:
/// the orchestrator does not roll back modules that already reloaded.
#[async_trait]
pub trait Reloadable: Send + Sync {
    fn can_reload(&self) -> bool {
        true
    }

    /// Deadline for a single reload dispatch.
    fn reload_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn reload(
        &self,
        cancel: CancellationToken,
        changes: &[ConfigChange],
    ) -> anyhow::Result<()>;
}

/// Zero or more health reports per invocation.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    /// Optional reporters contribute to overall health but not to readiness.
    fn optional(&self) -> bool {
        false
    }

    async fn health_check(&self, cancel: CancellationToken) -> anyhow::Result<Vec<HealthReport>>;
}

/// Modules that own configuration sections register them here before `init`.
pub trait ConfigRegistrar: Send + Sync {
    fn register_config(&self, store: &crate::config::store::ConfigStore)
        -> Result<(), crate::config::ConfigError>;
}

/// A single declared service dependency.
#[derive(Clone, Debug)]
pub struct ServiceDependency {
    /// Requested service name.
    pub name: String,
    /// Required dependencies participate in ordering and fail init when unmet.
    pub required: bool,
    /// Match any service exposing `interface` instead of matching by name.
    pub match_by_interface: bool,
    pub interface: Option<TypeKey>,
}

impl ServiceDependency {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            match_by_interface: false,
            interface: None,
        }
    }

    /// Dependency satisfied by any service exposing the interface `I`.
    pub fn interface<I: ?Sized + 'static>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            match_by_interface: true,
            interface: Some(TypeKey::of::<I>()),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// A service a module publishes after its `init` completes.
pub struct ServiceProvision {
    pub name: String,
    pub handle: ServiceHandle,
}

impl ServiceProvision {
    pub fn new(name: impl Into<String>, handle: ServiceHandle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }
}

/// Services resolved for one module's constructor, keyed by the *requested*
/// dependency name (not the resolved registry name).
#[derive(Default)]
pub struct ResolvedServices {
    entries: HashMap<String, ServiceHandle>,
}

impl ResolvedServices {
    pub(crate) fn insert(&mut self, requested: impl Into<String>, handle: ServiceHandle) {
        self.entries.insert(requested.into(), handle);
    }

    /// Fetch a resolved dependency as `Arc<T>`, where `T` may be a trait
    /// object the provider exposed.
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self, requested: &str) -> Option<Arc<T>> {
        self.entries.get(requested).and_then(ServiceHandle::view)
    }

    pub fn contains(&self, requested: &str) -> bool {
        self.entries.contains_key(requested)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Capability set of a module instance, derived from its `as_*` accessors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub startable: bool,
    pub stoppable: bool,
    pub constructible: bool,
    pub reloadable: bool,
    pub health_reporter: bool,
    pub config_registrar: bool,
}

impl Capabilities {
    pub fn of(module: &dyn Module) -> Self {
        Self {
            startable: module.as_startable().is_some(),
            stoppable: module.as_stoppable().is_some(),
            constructible: module.as_constructible().is_some(),
            reloadable: module.as_reloadable().is_some(),
            health_reporter: module.as_health_reporter().is_some(),
            config_registrar: module.as_config_registrar().is_some(),
        }
    }

    /// Capabilities present in `self` but missing from `other`.
    pub fn lost_in(&self, other: &Capabilities) -> Vec<&'static str> {
        let mut lost = Vec::new();
        let pairs = [
            (self.startable, other.startable, "startable"),
            (self.stoppable, other.stoppable, "stoppable"),
            (self.constructible, other.constructible, "constructible"),
            (self.reloadable, other.reloadable, "reloadable"),
            (self.health_reporter, other.health_reporter, "health_reporter"),
            (
                self.config_registrar,
                other.config_registrar,
                "config_registrar",
            ),
        ];
        for (before, after, label) in pairs {
            if before && !after {
                lost.push(label);
            }
        }
        lost
    }
}
