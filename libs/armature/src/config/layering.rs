//! Layered base configuration files.
//!
//! Directory layout (any of yaml/yml/json/toml per file, merged key-level,
//! later layers override earlier ones):
//!
//! ```text
//! <root>/base/default.<ext>
//! <root>/environments/<env>/overrides.<ext>
//! <root>/base/tenants/<tenant>.<ext>
//! <root>/environments/<env>/tenants/<tenant>.<ext>
//! ```
//!
//! The environment name comes from the caller, then the `ENV` variable; if
//! neither is set and exactly one directory exists under `environments/`,
//! that one is chosen.

use std::path::{Path, PathBuf};

use figment::providers::Format;
use figment::Figment;
use serde_json::Value;

use super::ConfigError;

const EXTENSIONS: [&str; 4] = ["yaml", "yml", "json", "toml"];

#[derive(Clone, Debug, Default)]
pub struct LayeredConfig {
    pub root: PathBuf,
    pub environment: Option<String>,
    pub tenant: Option<String>,
}

impl LayeredConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            environment: None,
            tenant: None,
        }
    }

    #[must_use]
    pub fn environment(mut self, env: impl Into<String>) -> Self {
        self.environment = Some(env.into());
        self
    }

    #[must_use]
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Merge all present layers into one value tree.
    pub fn load(&self) -> Result<Value, ConfigError> {
        let env = self.resolve_environment();
        let mut layers: Vec<PathBuf> = Vec::new();

        if let Some(path) = first_existing(&self.root.join("base"), "default") {
            layers.push(path);
        }
        if let Some(env) = &env {
            if let Some(path) =
                first_existing(&self.root.join("environments").join(env), "overrides")
            {
                layers.push(path);
            }
        }
        if let Some(tenant) = &self.tenant {
            if let Some(path) = first_existing(&self.root.join("base").join("tenants"), tenant) {
                layers.push(path);
            }
            if let Some(env) = &env {
                if let Some(path) = first_existing(
                    &self.root.join("environments").join(env).join("tenants"),
                    tenant,
                ) {
                    layers.push(path);
                }
            }
        }

        let mut figment = Figment::new();
        for path in layers {
            figment = merge_file(figment, &path)?;
        }
        Ok(figment.extract::<Value>()?)
    }

    fn resolve_environment(&self) -> Option<String> {
        if let Some(env) = &self.environment {
            return Some(env.clone());
        }
        if let Ok(env) = std::env::var("ENV") {
            if !env.is_empty() {
                return Some(env);
            }
        }
        // Single environment directory: use it.
        let dir = self.root.join("environments");
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        if names.len() == 1 {
            names.pop()
        } else {
            None
        }
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment, ConfigError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    Ok(match ext {
        "yaml" | "yml" => figment.merge(figment::providers::Yaml::file(path)),
        "json" => figment.merge(figment::providers::Json::file(path)),
        "toml" => figment.merge(figment::providers::Toml::file(path)),
        other => return Err(ConfigError::UnsupportedFormat(other.to_owned())),
    })
}

fn first_existing(dir: &Path, stem: &str) -> Option<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn later_layers_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "base/default.yaml", "server:\n  port: 1\n  host: base\n");
        write(root, "environments/prod/overrides.yaml", "server:\n  port: 2\n");
        write(root, "base/tenants/acme.yaml", "server:\n  host: acme\n");
        write(
            root,
            "environments/prod/tenants/acme.yaml",
            "server:\n  port: 3\n",
        );

        let value = LayeredConfig::new(root)
            .environment("prod")
            .tenant("acme")
            .load()
            .unwrap();
        assert_eq!(value["server"]["port"], 3);
        assert_eq!(value["server"]["host"], "acme");
    }

    #[test]
    fn mixed_formats_merge() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "base/default.toml", "[server]\nport = 1\nhost = \"base\"\n");
        write(
            root,
            "environments/dev/overrides.json",
            r#"{"server": {"port": 9}}"#,
        );

        let value = LayeredConfig::new(root).environment("dev").load().unwrap();
        assert_eq!(value["server"]["port"], 9);
        assert_eq!(value["server"]["host"], "base");
    }

    #[test]
    fn single_environment_directory_is_auto_selected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "base/default.yaml", "mode: base\n");
        write(root, "environments/staging/overrides.yaml", "mode: staging\n");

        temp_env::with_var("ENV", None::<&str>, || {
            let value = LayeredConfig::new(root).load().unwrap();
            assert_eq!(value["mode"], "staging");
        });
    }

    #[test]
    fn env_variable_selects_environment() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "base/default.yaml", "mode: base\n");
        write(root, "environments/a/overrides.yaml", "mode: a\n");
        write(root, "environments/b/overrides.yaml", "mode: b\n");

        temp_env::with_var("ENV", Some("b"), || {
            let value = LayeredConfig::new(root).load().unwrap();
            assert_eq!(value["mode"], "b");
        });
    }
}
