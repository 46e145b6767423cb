//! # Armature: modular application runtime
//!
//! A process-local framework that wires self-describing modules into one
//! long-running application:
//!
//! - **Modules** declare capabilities through `as_*` accessors on the
//!   [`Module`] trait and are driven through init → start → stop in a
//!   deterministic, dependency-resolved order.
//! - **Services** are published by name and by explicitly exposed interface
//!   views, with deterministic conflict resolution and module attribution.
//! - **Configuration** flows through an ordered feeder chain (environment,
//!   files, programmatic maps) into schema-described sections, with string
//!   defaults, aggregated required-field checks, provenance and diffing.
//! - **Reload** re-drives dynamic fields through registered modules behind a
//!   single-writer gate with an exponential-backoff circuit breaker.
//! - **Health** is aggregated from per-module providers into readiness
//!   (required providers) and overall health (all providers).
//! - **Events** fan out as CloudEvents 1.0 envelopes with per-observer
//!   isolation.
//!
//! ## Quick tour
//!
//! ```rust,ignore
//! use armature::{Application, EnvFeeder, ShutdownOptions};
//! use std::sync::Arc;
//!
//! let app = Application::builder("my-app")
//!     .with_feeder(Arc::new(EnvFeeder::new()))
//!     .build();
//! app.register_module(MyModule::default())?;
//! app.run(ShutdownOptions::Signals).await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod app;
pub mod config;
pub mod context;
pub mod contracts;
pub mod errors;
pub mod health;
pub mod observer;
pub mod registry;
pub mod reload;
pub mod services;

pub use app::{Application, ApplicationBuilder, ModuleInterfaceReport, ShutdownOptions};
pub use config::{
    ConfigChange, ConfigDiff, ConfigError, ConfigPipeline, ConfigSection, ConfigStore, EnvFeeder,
    FeedScope, Feeder, FieldKind, FieldOrigin, FieldSpec, FileFeeder, LayeredConfig, MapFeeder,
    SectionSchema,
};
pub use context::ModuleCtx;
pub use contracts::{
    Capabilities, ConfigRegistrar, Constructible, HealthReporter, Module, Reloadable,
    ResolvedServices, ServiceDependency, ServiceProvision, Startable, Stoppable,
};
pub use errors::AppError;
pub use health::{AggregatedHealth, HealthAggregator, HealthReport, HealthStatus, Refresh};
pub use observer::{types as event_types, CloudEvent, Observer, ObserverBus, ObserverDescriptor};
pub use registry::{ModuleRegistry, ResolveError};
pub use reload::{ReloadError, ReloadOrchestrator, ReloadPolicy};
pub use services::{
    ProvidingModule, ServiceEntry, ServiceError, ServiceHandle, ServiceRegistry, TypeKey,
};
