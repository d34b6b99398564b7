//! ORM configuration.

use crate::loader::LoadMethod;
use relmap_core::{Dialect, Result};
use serde::{Deserialize, Serialize};

/// Configuration for an [`Orm`](crate::Orm).
///
/// Deserializable from JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmConfig {
    /// Bound for session identity maps (`None` = unlimited).
    pub entity_cache_limit: Option<usize>,
    /// Remember entities even when the bound is reached.
    pub ignore_cache_limit: bool,
    /// Method used by `Selector::load_default`.
    pub default_load_method: LoadMethod,
    /// Overrides the connection's dialect for SQL rendering.
    pub dialect: Option<Dialect>,
}

impl Default for OrmConfig {
    fn default() -> Self {
        Self {
            entity_cache_limit: None,
            ignore_cache_limit: false,
            default_load_method: LoadMethod::Postload,
            dialect: None,
        }
    }
}

impl OrmConfig {
    /// Parse a configuration document.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config = serde_json::from_str(json)?;
        tracing::debug!(?config, "loaded ORM configuration");
        Ok(config)
    }

    pub fn with_entity_cache_limit(mut self, limit: usize) -> Self {
        self.entity_cache_limit = Some(limit);
        self
    }

    pub fn with_ignore_cache_limit(mut self, ignore: bool) -> Self {
        self.ignore_cache_limit = ignore;
        self
    }

    pub fn with_default_load_method(mut self, method: LoadMethod) -> Self {
        self.default_load_method = method;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = Some(dialect);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OrmConfig::default();
        assert_eq!(config.entity_cache_limit, None);
        assert!(!config.ignore_cache_limit);
        assert_eq!(config.default_load_method, LoadMethod::Postload);
        assert_eq!(config.dialect, None);
    }

    #[test]
    fn test_config_from_json() {
        let config =
            OrmConfig::from_json(r#"{"entity_cache_limit": 2, "default_load_method": "inload"}"#)
                .unwrap();
        assert_eq!(config.entity_cache_limit, Some(2));
        assert_eq!(config.default_load_method, LoadMethod::Inload);
        assert!(!config.ignore_cache_limit);

        let config = OrmConfig::from_json(r#"{"dialect": "mysql"}"#).unwrap();
        assert_eq!(config.dialect, Some(Dialect::Mysql));
    }

    #[test]
    fn test_malformed_config_is_a_config_error() {
        let err = OrmConfig::from_json(r#"{"entity_cache_limit": "lots"}"#).unwrap_err();
        assert!(matches!(err, relmap_core::Error::Config(_)));
    }

    #[test]
    fn test_builder_setters() {
        let config = OrmConfig::default()
            .with_entity_cache_limit(10)
            .with_ignore_cache_limit(true)
            .with_default_load_method(LoadMethod::Join)
            .with_dialect(Dialect::Sqlite);
        assert_eq!(config.entity_cache_limit, Some(10));
        assert!(config.ignore_cache_limit);
        assert_eq!(config.default_load_method, LoadMethod::Join);
        assert_eq!(config.dialect, Some(Dialect::Sqlite));
    }
}
