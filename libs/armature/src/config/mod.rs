//! Configuration pipeline: schema-described sections populated by a feeder
//! chain, defaulted, validated and diffed.

pub mod diff;
pub mod feeders;
pub mod layering;
pub mod paths;
pub mod pipeline;
pub mod schema;
pub mod store;

pub use diff::{ConfigChange, ConfigDiff, DiffOptions};
pub use feeders::{EnvFeeder, FeedScope, Feeder, FieldOrigin, FileFeeder, InstanceAwareFeeder, KeyedFeeder, MapFeeder};
pub use layering::LayeredConfig;
pub use pipeline::{ConfigPipeline, Loaded};
pub use schema::{ConfigSection, FieldKind, FieldSpec, SectionSchema};
pub use store::ConfigStore;

use thiserror::Error;

/// Configuration failure taxonomy.
///
/// The shape errors of the original contract (nil entity, non-pointer,
/// non-struct) are statically unrepresentable here: sections are owned typed
/// values and the pipeline only ever works on object trees. What remains is
/// everything that can actually go wrong at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config section '{0}' is not registered")]
    SectionNotRegistered(String),

    #[error("config section '{0}' is already registered")]
    SectionAlreadyRegistered(String),

    #[error("config section '{0}' data must be an object")]
    NotAnObject(String),

    #[error("config section '{0}' is registered with a different type")]
    WrongSectionType(String),

    #[error("section '{section}': required configuration fields missing: {}", paths.join(", "))]
    MissingRequired {
        section: String,
        paths: Vec<String>,
    },

    #[error("no default parser for field '{path}' of kind {kind:?}")]
    UnsupportedDefaultType {
        path: String,
        kind: schema::FieldKind,
    },

    #[error("value '{value}' for field '{path}' overflows {kind:?}")]
    Overflow {
        path: String,
        value: String,
        kind: schema::FieldKind,
    },

    #[error("value '{value}' for field '{path}' is not a valid {kind:?}")]
    InvalidValue {
        path: String,
        value: String,
        kind: schema::FieldKind,
    },

    #[error("field '{path}' holds data incompatible with {kind:?}")]
    IncompatibleFieldKind {
        path: String,
        kind: schema::FieldKind,
    },

    #[error("unsupported config file format '{0}'")]
    UnsupportedFormat(String),

    #[error("feeder '{feeder}' failed: {message}")]
    Feed { feeder: String, message: String },

    #[error("field '{path}' violates rule '{rule}'")]
    RuleViolation { path: String, rule: String },

    #[error("section '{section}' validation failed: {message}")]
    ValidationFailed { section: String, message: String },

    #[error("section '{section}' does not deserialize")]
    Deserialize {
        section: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    File(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::File(Box::new(err))
    }
}
