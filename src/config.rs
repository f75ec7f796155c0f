//! Layered store configuration.
//!
//! Settings come from an optional file (any format the `config` crate knows by
//! extension) overlaid with `TESSERA__SECTION__KEY` environment variables, for
//! example `TESSERA__DATABASE__PATH=store.db`. Every field has a default, so
//! an empty configuration opens an in-memory store.

use serde::Deserialize;

use crate::error::Result;
use crate::persist::PersistenceMode;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub identifiers: IdentifierSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// File backing the store, in memory when absent.
    pub path: Option<String>,
}
impl DatabaseSettings {
    pub fn mode(&self) -> PersistenceMode {
        match &self.path {
            Some(path) => PersistenceMode::File(path.clone()),
            None => PersistenceMode::InMemory,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Memory,
    Table,
    None,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub kind: CacheKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdStrategy {
    /// Random identities in the 32 bit range.
    #[default]
    Random,
    /// Increasing identities, released ones are handed out again first.
    Sequential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentifierSettings {
    pub strategy: IdStrategy,
    pub max_attempts: u32,
}
impl Default for IdentifierSettings {
    fn default() -> Self {
        Self {
            strategy: IdStrategy::Random,
            max_attempts: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// An `EnvFilter` directive, `RUST_LOG` takes precedence when set.
    pub filter: String,
}
impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn load(path: Option<&str>) -> Result<StoreConfig> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("TESSERA").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
