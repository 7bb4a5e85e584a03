//! YAML configuration for the service's external collaborators: which
//! data sources to bootstrap and how the cache is backed. Grounded on the
//! teacher's `src/config.rs` (`Config::finalize`, `subst::yaml::from_str`
//! env substitution) and `src/file_config.rs` (`report_unrecognized_config`,
//! the `#[serde(tag = "type")]` per-kind dispatch pattern). Hot-reloading
//! this file and the `GET`/`POST /config` endpoints are an external
//! collaborator's job (§6); this module only covers parsing, validation
//! and secret masking.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subst::VariableMap;

use crate::error::{Error, Result};

/// A secret config value. Serializes as `MASKED:<sha256-hex>`; deserializes
/// a plain string. `resolve` re-substitutes a previously known value when a
/// masked string is submitted back unchanged, per §6.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn masked(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        format!("MASKED:{:x}", hasher.finalize())
    }

    /// Accepts either a new plaintext value, or a `MASKED:...` string that
    /// must match `previous`'s mask exactly (the UI round-tripped an
    /// unchanged value). Any other masked string is unresolvable.
    pub fn resolve(candidate: &str, previous: Option<&Secret>) -> Result<Self> {
        if candidate.starts_with("MASKED:") {
            match previous {
                Some(prev) if prev.masked() == candidate => Ok(prev.clone()),
                _ => Err(Error::Config(format!("cannot resolve masked secret against prior config: {candidate}"))),
            }
        } else {
            Ok(Self::new(candidate))
        }
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.masked())
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.masked())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

fn default_max_parallel_jobs() -> u32 {
    1
}

fn default_max_tiles() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

/// One registered data source descriptor. `type` dispatches to the kind;
/// only `remote` (the HTTP data source, §4.7) is a config-driven source —
/// in-process sources are registered programmatically, not from YAML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Remote(RemoteSourceConfig),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteSourceConfig {
    #[serde(rename = "mapId")]
    pub map_id: String,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(default, rename = "maxParallelJobs")]
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: u32,
    #[serde(default)]
    pub headers: HashMap<String, Secret>,
    #[serde(default, rename = "isAddOn")]
    pub is_add_on: bool,
    #[serde(flatten)]
    pub unrecognized: HashMap<String, serde_yaml::Value>,
}

impl SourceConfig {
    pub fn finalize(&self, prefix: &str) -> Result<()> {
        match self {
            SourceConfig::Remote(r) => {
                report_unrecognized_config(prefix, &r.unrecognized);
                if r.base_url.is_empty() {
                    return Err(Error::Config(format!("{prefix}baseUrl must not be empty")));
                }
                Ok(())
            }
        }
    }
}

/// Which `Cache` implementation (§4.6) to construct. `max_tiles <= 0`
/// degrades a `memory`/`sqlite` cache to effectively a null cache per the
/// TTL-disables-caching boundary behavior, but that degradation is a
/// runtime concern, not this config's.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheConfig {
    Memory {
        #[serde(default = "default_max_tiles", rename = "maxTiles")]
        max_tiles: usize,
    },
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_max_tiles", rename = "maxTiles")]
        max_tiles: usize,
    },
    None,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory {
            max_tiles: default_max_tiles(),
        }
    }
}

/// Gates for the external `/config` read/write endpoints (§6); the
/// endpoints themselves are an external collaborator's job, this just
/// carries the enable flags through the same YAML document.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigEndpoints {
    #[serde(default, rename = "allowGet")]
    pub allow_get: bool,
    #[serde(default, rename = "allowPost")]
    pub allow_post: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default, rename = "configEndpoints")]
    pub config_endpoints: ConfigEndpoints,
    #[serde(flatten)]
    pub unrecognized: HashMap<String, serde_yaml::Value>,
}

impl Config {
    /// Validates every source descriptor and warns on unrecognized keys.
    /// Does not require at least one source: sources may be registered
    /// programmatically after load (per §9's `add(source)`/`remove(source)`
    /// design note).
    pub fn finalize(&mut self) -> Result<&Self> {
        report_unrecognized_config("", &self.unrecognized);
        for (i, source) in self.sources.iter().enumerate() {
            source.finalize(&format!("sources[{i}]."))?;
        }
        Ok(self)
    }
}

pub fn report_unrecognized_config(prefix: &str, unrecognized: &HashMap<String, serde_yaml::Value>) {
    for key in unrecognized.keys() {
        warn!("Unrecognized config key: {prefix}{key}");
    }
}

/// Reads a YAML config file, substituting `${VAR}`/`${VAR:-default}`
/// references against `env` before parsing (mirrors the teacher's
/// `subst::yaml::from_str` use in `read_config`).
pub fn read_config<'a, M>(file_name: &Path, env: &'a M) -> Result<Config>
where
    M: VariableMap<'a>,
    M::Value: AsRef<str>,
{
    let contents = fs::read_to_string(file_name)?;
    parse_config(&contents, env)
}

pub fn parse_config<'a, M>(contents: &str, env: &'a M) -> Result<Config>
where
    M: VariableMap<'a>,
    M::Value: AsRef<str>,
{
    subst::yaml::from_str(contents, env).map_err(|e| Error::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn parse(yaml: &str) -> Config {
        parse_config(yaml, &env::vars().collect::<HashMap<_, _>>()).unwrap()
    }

    #[test]
    fn defaults_to_memory_cache_and_no_sources() {
        let cfg = parse("cache:\n  type: memory\n");
        assert_eq!(cfg.cache, CacheConfig::Memory { max_tiles: 1000 });
        assert!(cfg.sources.is_empty());
    }

    #[test]
    fn dispatches_remote_source_by_type() {
        let yaml = indoc::indoc! {r#"
            sources:
              - type: remote
                mapId: Tropico
                baseUrl: http://localhost:8080
        "#};
        let mut cfg = parse(yaml);
        cfg.finalize().unwrap();
        assert_eq!(cfg.sources.len(), 1);
        match &cfg.sources[0] {
            SourceConfig::Remote(r) => {
                assert_eq!(r.map_id, "Tropico");
                assert_eq!(r.max_parallel_jobs, 1);
            }
        }
    }

    #[test]
    fn empty_base_url_fails_finalize() {
        let yaml = indoc::indoc! {r#"
            sources:
              - type: remote
                mapId: Tropico
                baseUrl: ""
        "#};
        let mut cfg = parse(yaml);
        assert!(cfg.finalize().is_err());
    }

    #[test]
    fn secret_masks_on_serialize_and_resolves_unchanged_mask() {
        let secret = Secret::new("s3cr3t");
        let masked = secret.masked();
        assert!(masked.starts_with("MASKED:"));

        let resolved = Secret::resolve(&masked, Some(&secret)).unwrap();
        assert_eq!(resolved.expose(), "s3cr3t");

        let err = Secret::resolve("MASKED:deadbeef", Some(&secret));
        assert!(err.is_err());

        let fresh = Secret::resolve("new-value", Some(&secret)).unwrap();
        assert_eq!(fresh.expose(), "new-value");
    }

    #[test]
    fn env_substitution_resolves_variables() {
        let mut env = HashMap::new();
        env.insert("MAPGET_BASE_URL".to_string(), "http://example.test".to_string());
        let yaml = indoc::indoc! {r#"
            sources:
              - type: remote
                mapId: Tropico
                baseUrl: "${MAPGET_BASE_URL}"
        "#};
        let cfg: Config = parse_config(yaml, &env).unwrap();
        match &cfg.sources[0] {
            SourceConfig::Remote(r) => assert_eq!(r.base_url, "http://example.test"),
        }
    }
}
