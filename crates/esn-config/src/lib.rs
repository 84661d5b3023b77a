//! Layered YAML configuration with a canonical hash, plus the typed
//! `SentinelConfig` the binaries actually consume.
//!
//! Later files override earlier files. Every layer is converted into plain
//! JSON up front, which is where YAML-only constructs get rejected:
//! mapping keys must be strings, and numbers must survive the trip (NaN
//! and infinity do not). The merged document is hashed over its compact
//! serialization; `serde_json`'s map type is BTreeMap-backed in this
//! workspace (no `preserve_order` feature), so that serialization is
//! already key-sorted and stable without any post-processing.
//!
//! Environment variables `CHECK_IN_POLL_INTERVAL` (ms) and
//! `WORKER_CONCURRENCY` override the file layers last.

use std::fs;

use serde_json::Value;
use sha2::{Digest, Sha256};

pub const ENV_POLL_INTERVAL: &str = "CHECK_IN_POLL_INTERVAL";
pub const ENV_WORKER_CONCURRENCY: &str = "WORKER_CONCURRENCY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: mapping keys must be strings")]
    NonStringKey { path: String },
    #[error("{path}: {what} has no canonical JSON form")]
    Unrepresentable { path: String, what: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// The merged configuration document, its canonical serialization, and the
/// hash deployments assert against.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub document: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load YAML files in order and fold them into one canonical document.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig, ConfigError> {
    let mut merged = Value::Object(serde_json::Map::new());

    for path in paths {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
                path: path.to_string(),
                source,
            })?;
        let layer = yaml_to_json(&yaml, path)?;
        merged = overlay(merged, layer);
    }

    // Compact output over BTreeMap-backed maps: canonical by construction.
    let canonical_json = merged.to_string();
    let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));

    Ok(LoadedConfig {
        document: merged,
        canonical_json,
        config_hash,
    })
}

/// Convert one parsed YAML document into JSON, rejecting constructs that
/// have no stable canonical form.
fn yaml_to_json(v: &serde_yaml::Value, path: &str) -> Result<Value, ConfigError> {
    use serde_yaml::Value as Y;
    Ok(match v {
        Y::Null => Value::Null,
        Y::Bool(b) => Value::Bool(*b),
        Y::String(s) => Value::String(s.clone()),
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                serde_json::Number::from_f64(f).map(Value::Number).ok_or(
                    ConfigError::Unrepresentable {
                        path: path.to_string(),
                        what: format!("number {n}"),
                    },
                )?
            }
        }
        Y::Sequence(items) => Value::Array(
            items
                .iter()
                .map(|item| yaml_to_json(item, path))
                .collect::<Result<_, _>>()?,
        ),
        Y::Mapping(entries) => {
            let mut out = serde_json::Map::new();
            for (key, value) in entries {
                let key = key
                    .as_str()
                    .ok_or_else(|| ConfigError::NonStringKey {
                        path: path.to_string(),
                    })?
                    .to_string();
                out.insert(key, yaml_to_json(value, path)?);
            }
            Value::Object(out)
        }
        // `!tag value` carries no meaning here; keep the value.
        Y::Tagged(tagged) => yaml_to_json(&tagged.value, path)?,
    })
}

/// Fold `layer` over `base`: objects merge key-wise, everything else is
/// replaced by the layer's value.
fn overlay(base: Value, layer: Value) -> Value {
    match (base, layer) {
        (Value::Object(mut under), Value::Object(over)) => {
            for (key, incoming) in over {
                let merged = match under.remove(&key) {
                    Some(existing) => overlay(existing, incoming),
                    None => incoming,
                };
                under.insert(key, merged);
            }
            Value::Object(under)
        }
        (_, replacement) => replacement,
    }
}

// ---------------------------------------------------------------------------
// Typed config
// ---------------------------------------------------------------------------

/// Runtime knobs for the scheduler, workers, and daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct SentinelConfig {
    /// Scheduler sweep period in milliseconds.
    pub poll_interval_ms: u64,
    /// Default per-queue worker concurrency (the release queue is always 1).
    pub worker_concurrency: usize,
    /// Rows per scheduler subscan pass.
    pub sweep_batch_size: i64,
    /// Public origin used in check-in and trustee links.
    pub base_url: String,
    /// Daemon bind address.
    pub bind_addr: String,
    /// Bearer token for the /admin routes. None = admin surface disabled.
    pub admin_token: Option<String>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            worker_concurrency: 5,
            sweep_batch_size: 100,
            base_url: "http://localhost:8787".to_string(),
            bind_addr: "127.0.0.1:8787".to_string(),
            admin_token: None,
        }
    }
}

impl SentinelConfig {
    /// Read the typed view out of a merged document, falling back to
    /// defaults for absent keys, then apply env overrides.
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self, ConfigError> {
        let doc = &loaded.document;
        let defaults = Self::default();

        let mut cfg = Self {
            poll_interval_ms: doc
                .pointer("/scheduler/poll_interval_ms")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.poll_interval_ms),
            worker_concurrency: doc
                .pointer("/workers/concurrency")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.worker_concurrency as u64)
                as usize,
            sweep_batch_size: doc
                .pointer("/scheduler/batch_size")
                .and_then(Value::as_i64)
                .unwrap_or(defaults.sweep_batch_size),
            base_url: doc
                .pointer("/http/base_url")
                .and_then(Value::as_str)
                .unwrap_or(&defaults.base_url)
                .to_string(),
            bind_addr: doc
                .pointer("/http/bind_addr")
                .and_then(Value::as_str)
                .unwrap_or(&defaults.bind_addr)
                .to_string(),
            admin_token: doc
                .pointer("/http/admin_token")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults + env overrides, for processes booted without config files.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw) = std::env::var(ENV_POLL_INTERVAL) {
            self.poll_interval_ms = raw.parse().map_err(|_| ConfigError::Invalid {
                field: ENV_POLL_INTERVAL,
                reason: format!("{raw:?} is not a millisecond count"),
            })?;
        }
        if let Ok(raw) = std::env::var(ENV_WORKER_CONCURRENCY) {
            self.worker_concurrency = raw.parse().map_err(|_| ConfigError::Invalid {
                field: ENV_WORKER_CONCURRENCY,
                reason: format!("{raw:?} is not a positive integer"),
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_concurrency",
                reason: "must be > 0".to_string(),
            });
        }
        if self.sweep_batch_size <= 0 {
            return Err(ConfigError::Invalid {
                field: "sweep_batch_size",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn later_layers_override_and_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(
            &dir,
            "base.yaml",
            "scheduler:\n  poll_interval_ms: 60000\nhttp:\n  base_url: https://sentinel.example\n",
        );
        let env = write_yaml(&dir, "env.yaml", "scheduler:\n  poll_interval_ms: 5000\n");

        let a = load_layered_yaml(&[&base, &env]).unwrap();
        let b = load_layered_yaml(&[&base, &env]).unwrap();
        assert_eq!(a.config_hash, b.config_hash);

        let cfg = SentinelConfig::from_loaded(&a).unwrap();
        assert_eq!(cfg.poll_interval_ms, 5000);
        assert_eq!(cfg.base_url, "https://sentinel.example");
        // Unset keys fall back to defaults.
        assert_eq!(cfg.worker_concurrency, 5);
    }

    #[test]
    fn layer_order_changes_the_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_yaml(&dir, "a.yaml", "workers:\n  concurrency: 2\n");
        let b = write_yaml(&dir, "b.yaml", "workers:\n  concurrency: 9\n");

        let ab = load_layered_yaml(&[&a, &b]).unwrap();
        let ba = load_layered_yaml(&[&b, &a]).unwrap();
        assert_ne!(ab.config_hash, ba.config_hash);
        assert_eq!(SentinelConfig::from_loaded(&ab).unwrap().worker_concurrency, 9);
        assert_eq!(SentinelConfig::from_loaded(&ba).unwrap().worker_concurrency, 2);
    }

    #[test]
    fn canonical_json_sorts_keys_regardless_of_source_order() {
        let dir = tempfile::tempdir().unwrap();
        let zyx = write_yaml(&dir, "zyx.yaml", "z: 1\ny: 2\nx:\n  b: 1\n  a: 2\n");
        let loaded = load_layered_yaml(&[&zyx]).unwrap();
        assert_eq!(loaded.canonical_json, r#"{"x":{"a":2,"b":1},"y":2,"z":1}"#);
    }

    #[test]
    fn non_string_mapping_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bad = write_yaml(&dir, "bad.yaml", "1: one\n2: two\n");
        let err = load_layered_yaml(&[&bad]).unwrap_err();
        assert!(matches!(err, ConfigError::NonStringKey { .. }));
    }
}
