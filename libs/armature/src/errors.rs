//! Application-level error taxonomy.
//!
//! Component errors ([`crate::registry::ResolveError`],
//! [`crate::services::ServiceError`], [`crate::config::ConfigError`],
//! [`crate::reload::ReloadError`], [`crate::health::HealthError`]) stay
//! typed through `#[from]` conversions, so callers can always test identity
//! through the chain.

use thiserror::Error;

use crate::config::ConfigError;
use crate::health::HealthError;
use crate::registry::ResolveError;
use crate::reload::ReloadError;
use crate::services::ServiceError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Reload(#[from] ReloadError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error("module '{module}' requires service '{service}' which is not registered")]
    MissingService { module: String, service: String },

    #[error("constructor of module '{module}' failed")]
    ConstructFailed {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("initialization failed for module '{module}'")]
    InitFailed {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("start failed for module '{module}'")]
    StartFailed {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("stop failed for module '{module}'")]
    StopFailed {
        module: String,
        #[source]
        source: anyhow::Error,
    },
}
