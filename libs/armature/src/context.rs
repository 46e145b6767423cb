//! Module-scoped view of the application.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::store::ConfigStore;
use crate::config::{ConfigError, ConfigSection};
use crate::observer::{CloudEvent, ObserverBus};
use crate::services::{ProvidingModule, ServiceHandle, ServiceRegistry};

/// Handle passed to a module's `init` and constructor.
///
/// Everything here is shared application state; the cancellation token is a
/// child of the application's root token.
#[derive(Clone)]
pub struct ModuleCtx {
    module_name: Arc<str>,
    module_type: &'static str,
    services: Arc<ServiceRegistry>,
    config: Arc<ConfigStore>,
    events: Arc<ObserverBus>,
    cancellation_token: CancellationToken,
}

impl ModuleCtx {
    pub(crate) fn new(
        module_name: impl Into<Arc<str>>,
        module_type: &'static str,
        services: Arc<ServiceRegistry>,
        config: Arc<ConfigStore>,
        events: Arc<ObserverBus>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            module_type,
            services,
            config,
            events,
            cancellation_token,
        }
    }

    #[inline]
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    #[inline]
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    #[inline]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Register an additional service attributed to this module, outside the
    /// declared provisions. Returns the resolved name.
    pub fn register_service(&self, name: impl Into<String>, handle: ServiceHandle) -> String {
        self.services.register_for_module(
            name,
            handle,
            ProvidingModule {
                name: self.module_name.to_string(),
                type_name: self.module_type,
            },
        )
    }

    /// Typed snapshot of a config section.
    pub fn config<T: ConfigSection>(&self, section: &str) -> Result<Arc<T>, ConfigError> {
        self.config.get::<T>(section)
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    /// Emit an event through the application's observer bus.
    pub fn emit(&self, event: &CloudEvent) {
        self.events.notify(&self.cancellation_token, event);
    }
}
