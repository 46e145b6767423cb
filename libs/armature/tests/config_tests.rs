//! Configuration pipeline integration: real environment variables, full
//! sections with nesting and durations, and the diff laws at the public
//! surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use armature::config::diff::generate_config_diff;
use armature::config::DiffOptions;
use armature::{
    ConfigPipeline, ConfigSection, EnvFeeder, FeedScope, FieldKind, FieldSpec, SectionSchema,
};

#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
struct ProxyConfig {
    dry_run: bool,
    listen: String,
    #[serde(with = "humantime_serde")]
    idle_timeout: Duration,
    headers: HashMap<String, String>,
    endpoint: Endpoint,
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
struct Endpoint {
    host: String,
    port: u16,
}

impl ConfigSection for ProxyConfig {
    fn schema() -> SectionSchema {
        let endpoint = SectionSchema::new()
            .field(FieldSpec::new("host", FieldKind::Str).default("127.0.0.1"))
            .field(FieldSpec::new("port", FieldKind::UInt(16)).default("8080").required());
        SectionSchema::new()
            .field(FieldSpec::new("dry_run", FieldKind::Bool).dynamic())
            .field(FieldSpec::new("listen", FieldKind::Str).default("0.0.0.0:80").required())
            .field(
                FieldSpec::new("idle_timeout", FieldKind::Duration)
                    .key("IDLE_TIMEOUT")
                    .default("90s"),
            )
            .field(FieldSpec::new("headers", FieldKind::StrMap).default("{}"))
            .nest("endpoint", endpoint)
    }
}

fn pipeline() -> ConfigPipeline {
    ConfigPipeline::new().with_feeder(Arc::new(EnvFeeder::new()))
}

#[test]
fn module_prefixed_env_key_wins() {
    temp_env::with_vars(
        [
            ("REVERSEPROXY_DRY_RUN", Some("true")),
            ("DRY_RUN_REVERSEPROXY", Some("false")),
            ("DRY_RUN", Some("false")),
        ],
        || {
            let loaded = pipeline()
                .load::<ProxyConfig>(&FeedScope::module_section("reverseproxy", "reverseproxy"))
                .unwrap();
            assert!(loaded.value.dry_run);

            let origin = loaded
                .provenance
                .iter()
                .find(|o| o.path == "dry_run")
                .unwrap();
            assert_eq!(origin.source, "REVERSEPROXY_DRY_RUN");
        },
    );
}

#[test]
fn defaults_cover_durations_maps_and_nested_sections() {
    temp_env::with_vars([("DRY_RUN", None::<&str>)], || {
        let loaded = pipeline()
            .load::<ProxyConfig>(&FeedScope::section("proxy"))
            .unwrap();
        assert_eq!(loaded.value.idle_timeout, Duration::from_secs(90));
        assert!(loaded.value.headers.is_empty());
        assert_eq!(loaded.value.endpoint.host, "127.0.0.1");
        assert_eq!(loaded.value.endpoint.port, 8080);
        assert_eq!(loaded.value.listen, "0.0.0.0:80");
    });
}

#[test]
fn loading_twice_is_stable() {
    temp_env::with_vars([("PROXY_LISTEN", Some("10.1.1.1:443"))], || {
        let scope = FeedScope::module_section("proxy", "proxy");
        let first = pipeline().load::<ProxyConfig>(&scope).unwrap();
        let second = pipeline().load::<ProxyConfig>(&scope).unwrap();
        assert_eq!(first.value, second.value);
        assert_eq!(first.raw, second.raw);
    });
}

#[test]
fn env_overrides_nested_fields() {
    temp_env::with_vars(
        [("PROXY_PORT", Some("9443")), ("HOST", Some("10.0.0.9"))],
        || {
            let loaded = pipeline()
                .load::<ProxyConfig>(&FeedScope::module_section("proxy", "proxy"))
                .unwrap();
            assert_eq!(loaded.value.endpoint.port, 9443);
            assert_eq!(loaded.value.endpoint.host, "10.0.0.9");
        },
    );
}

#[test]
fn diff_of_identical_snapshots_is_empty() {
    temp_env::with_vars([("LISTEN", Some("1.2.3.4:80"))], || {
        let loaded = pipeline()
            .load::<ProxyConfig>(&FeedScope::section("proxy"))
            .unwrap();
        let diff = generate_config_diff("proxy", &loaded.raw, &loaded.raw, &DiffOptions::default());
        assert!(diff.is_empty());
    });
}

#[test]
fn diff_detects_scalar_change_between_loads() {
    let old = json!({"listen": "0.0.0.0:80", "dry_run": false});
    let new = json!({"listen": "0.0.0.0:80", "dry_run": true});
    let diff = generate_config_diff("proxy", &old, &new, &DiffOptions::default());
    assert_eq!(diff.changed.len(), 1);
    assert!(diff.changed.contains_key("dry_run"));
    assert_eq!(diff.section, "proxy");
}
