//! Health aggregation.
//!
//! Providers are registered per module, required or optional. `collect`
//! invokes every provider sequentially in registration order and derives two
//! statuses: *readiness* is the worst status among required reports,
//! *health* the worst across all reports. Results are cached for a TTL;
//! [`Refresh::Force`] bypasses the cache. A provider error becomes a
//! synthetic unhealthy report, a provider panic becomes
//! `panic: <message>`. Collection itself never fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::contracts::HealthReporter;
use crate::observer::bus::panic_message;
use crate::observer::{types, CloudEvent, ObserverBus};

/// Ordered worst-first aggregation: healthy < degraded < unhealthy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub module: String,
    pub component: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
    /// Since when the component has been in this status.
    pub observed_since: DateTime<Utc>,
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HealthReport {
    pub fn healthy(module: impl Into<String>, component: impl Into<String>) -> Self {
        Self::with_status(module, component, HealthStatus::Healthy)
    }

    pub fn with_status(
        module: impl Into<String>,
        component: impl Into<String>,
        status: HealthStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            module: module.into(),
            component: component.into(),
            status,
            message: None,
            checked_at: now,
            observed_since: now,
            optional: false,
            details: None,
        }
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatedHealth {
    /// Worst status among required reports; healthy when there are none.
    pub readiness: HealthStatus,
    /// Worst status across all reports.
    pub health: HealthStatus,
    pub reports: Vec<HealthReport>,
    pub generated_at: DateTime<Utc>,
}

impl AggregatedHealth {
    fn from_reports(reports: Vec<HealthReport>) -> Self {
        let readiness = reports
            .iter()
            .filter(|r| !r.optional)
            .map(|r| r.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        let health = reports
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            readiness,
            health,
            reports,
            generated_at: Utc::now(),
        }
    }

    fn status_counts(&self) -> [usize; 3] {
        let mut counts = [0usize; 3];
        for report in &self.reports {
            counts[report.status as usize] += 1;
        }
        counts
    }
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("health provider for module '{0}' is already registered")]
    DuplicateProvider(String),
}

/// Cache bypass control for [`HealthAggregator::collect`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Refresh {
    #[default]
    Cached,
    Force,
}

#[derive(Clone)]
pub struct ProviderInfo {
    pub module: String,
    pub optional: bool,
}

struct ProviderEntry {
    module: String,
    provider: Arc<dyn HealthReporter>,
    optional: bool,
}

struct Cache {
    generated: Instant,
    value: AggregatedHealth,
}

pub struct HealthAggregator {
    providers: Mutex<Vec<ProviderEntry>>,
    cache: Mutex<Option<Cache>>,
    ttl: Duration,
    /// Last status per (module, component), for observed_since continuity.
    observed: Mutex<HashMap<(String, String), (HealthStatus, DateTime<Utc>)>>,
    last_emitted: Mutex<Option<(HealthStatus, HealthStatus)>>,
    events: Arc<ObserverBus>,
    source: String,
}

impl HealthAggregator {
    pub fn new(events: Arc<ObserverBus>, source: impl Into<String>, ttl: Duration) -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
            cache: Mutex::new(None),
            ttl,
            observed: Mutex::new(HashMap::new()),
            last_emitted: Mutex::new(None),
            events,
            source: source.into(),
        }
    }

    pub fn register_provider(
        &self,
        module: impl Into<String>,
        provider: Arc<dyn HealthReporter>,
        optional: bool,
    ) -> Result<(), HealthError> {
        let module = module.into();
        let mut providers = self.providers.lock();
        if providers.iter().any(|p| p.module == module) {
            return Err(HealthError::DuplicateProvider(module));
        }
        providers.push(ProviderEntry {
            module,
            provider,
            optional,
        });
        Ok(())
    }

    pub fn unregister_provider(&self, module: &str) -> bool {
        let mut providers = self.providers.lock();
        let before = providers.len();
        providers.retain(|p| p.module != module);
        providers.len() != before
    }

    pub fn providers(&self) -> Vec<ProviderInfo> {
        self.providers
            .lock()
            .iter()
            .map(|p| ProviderInfo {
                module: p.module.clone(),
                optional: p.optional,
            })
            .collect()
    }

    /// Collect reports from every provider. Within the TTL the cached
    /// aggregate is returned unchanged; `Refresh::Force` bypasses it.
    pub async fn collect(&self, cancel: CancellationToken, refresh: Refresh) -> AggregatedHealth {
        if refresh == Refresh::Cached {
            let cache = self.cache.lock();
            if let Some(cache) = cache.as_ref() {
                if cache.generated.elapsed() < self.ttl {
                    return cache.value.clone();
                }
            }
        }

        // Snapshot so providers run without the lock held.
        let entries: Vec<(String, Arc<dyn HealthReporter>, bool)> = {
            let providers = self.providers.lock();
            providers
                .iter()
                .map(|p| (p.module.clone(), p.provider.clone(), p.optional))
                .collect()
        };

        let mut reports = Vec::new();
        for (module, provider, optional) in entries {
            let call =
                std::panic::AssertUnwindSafe(provider.health_check(cancel.clone())).catch_unwind();
            let produced = match call.await {
                Ok(Ok(list)) => list,
                Ok(Err(error)) => {
                    vec![HealthReport::with_status(
                        module.clone(),
                        module.clone(),
                        HealthStatus::Unhealthy,
                    )
                    .message(error.to_string())]
                }
                Err(panic) => {
                    vec![HealthReport::with_status(
                        module.clone(),
                        module.clone(),
                        HealthStatus::Unhealthy,
                    )
                    .message(format!("panic: {}", panic_message(&panic)))]
                }
            };
            for mut report in produced {
                report.optional = optional;
                reports.push(report);
            }
        }

        self.stamp_observed_since(&mut reports);
        let aggregated = AggregatedHealth::from_reports(reports);

        *self.cache.lock() = Some(Cache {
            generated: Instant::now(),
            value: aggregated.clone(),
        });
        self.emit_if_changed(&cancel, &aggregated);
        aggregated
    }

    /// Preserve `observed_since` across collections while a component's
    /// status is unchanged.
    fn stamp_observed_since(&self, reports: &mut [HealthReport]) {
        let mut observed = self.observed.lock();
        for report in reports {
            let key = (report.module.clone(), report.component.clone());
            match observed.get(&key) {
                Some((status, since)) if *status == report.status => {
                    report.observed_since = *since;
                }
                _ => {
                    observed.insert(key, (report.status, report.observed_since));
                }
            }
        }
    }

    fn emit_if_changed(&self, cancel: &CancellationToken, aggregated: &AggregatedHealth) {
        let current = (aggregated.readiness, aggregated.health);
        let mut last = self.last_emitted.lock();
        let previous = *last;
        if previous == Some(current) {
            return;
        }
        *last = Some(current);
        drop(last);

        let counts = aggregated.status_counts();
        let event = CloudEvent::new(self.source.clone(), types::HEALTH_UPDATED).data(
            serde_json::json!({
                "previous": previous.map(|(r, h)| serde_json::json!({
                    "readiness": r,
                    "health": h,
                })),
                "readiness": aggregated.readiness,
                "health": aggregated.health,
                "counts": {
                    "healthy": counts[0],
                    "degraded": counts[1],
                    "unhealthy": counts[2],
                },
            }),
        );
        self.events.notify(cancel, &event);
    }
}
