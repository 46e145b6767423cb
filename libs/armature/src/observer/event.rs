//! CloudEvents 1.0 envelope carried by the observer bus.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const SPEC_VERSION: &str = "1.0";

/// Canonical event type strings emitted by the runtime.
pub mod types {
    pub const BEFORE_INIT: &str = "com.modular.application.before.init";
    pub const AFTER_INIT: &str = "com.modular.application.after.init";
    pub const INIT_FAILED: &str = "com.modular.application.init.failed";
    pub const BEFORE_START: &str = "com.modular.application.before.start";
    pub const AFTER_START: &str = "com.modular.application.after.start";
    pub const START_FAILED: &str = "com.modular.application.start.failed";
    pub const BEFORE_STOP: &str = "com.modular.application.before.stop";
    pub const AFTER_STOP: &str = "com.modular.application.after.stop";
    pub const STOP_FAILED: &str = "com.modular.application.stop.failed";
    pub const MODULE_REGISTERED: &str = "com.modular.module.registered";
    pub const SERVICE_REGISTERED: &str = "com.modular.service.registered";
    pub const RELOAD_START: &str = "config.reload.start";
    pub const RELOAD_SUCCESS: &str = "config.reload.success";
    pub const RELOAD_FAILED: &str = "config.reload.failed";
    pub const RELOAD_NOOP: &str = "config.reload.noop";
    pub const HEALTH_UPDATED: &str = "health.aggregate.updated";
}

/// A CloudEvents 1.0 event. Extension attributes are preserved verbatim,
/// both programmatically set ones and any carried by deserialized events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl CloudEvent {
    pub fn new(source: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            specversion: SPEC_VERSION.to_owned(),
            ty: ty.into(),
            time: Some(Utc::now()),
            subject: None,
            dataschema: None,
            datacontenttype: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.datacontenttype = Some("application/json".to_owned());
        self.data = Some(data);
        self
    }

    /// Set one extension attribute (e.g. `moduleaction`, `lifecyclename`).
    #[must_use]
    pub fn extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn extension_attr(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }
}
