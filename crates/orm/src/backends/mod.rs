//! Backend adapters and the registry that creates them
//!
//! Built-in backends are registered at startup; external backends register
//! a factory for their own [`BackendType::External`] name.

pub mod core;
pub mod document;
pub mod kv;
pub mod sql;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{OrmError, OrmResult};

pub use self::core::{
    wrap_error, Adapter, AdapterCapabilities, AdapterTransaction, ConnectionSettings, LiveColumn,
    LiveSchema, LiveTable, QueryOptions, SqlDialect,
};
pub use self::document::DocumentAdapter;
pub use self::kv::KvAdapter;
pub use self::sql::SqlAdapter;

/// Identifies a backend family
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendType {
    PostgreSql,
    MySql,
    Sqlite,
    /// In-process document store
    Document,
    /// In-process key-value store
    KeyValue,
    /// Externally registered backend
    External(String),
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::PostgreSql => write!(f, "postgresql"),
            BackendType::MySql => write!(f, "mysql"),
            BackendType::Sqlite => write!(f, "sqlite"),
            BackendType::Document => write!(f, "document"),
            BackendType::KeyValue => write!(f, "keyvalue"),
            BackendType::External(name) => write!(f, "{name}"),
        }
    }
}

/// Factory signature: settings in, connected-capable adapter out
pub type AdapterFactory =
    Box<dyn Fn(&ConnectionSettings) -> OrmResult<Arc<dyn Adapter>> + Send + Sync>;

/// Maps backend identifiers to adapter factories
pub struct BackendRegistry {
    factories: HashMap<BackendType, AdapterFactory>,
}

impl BackendRegistry {
    /// Empty registry, for fully custom setups
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in backend registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            BackendType::PostgreSql,
            Box::new(|_| Ok(Arc::new(SqlAdapter::postgres()) as Arc<dyn Adapter>)),
        );
        registry.register(
            BackendType::MySql,
            Box::new(|_| Ok(Arc::new(SqlAdapter::mysql()) as Arc<dyn Adapter>)),
        );
        registry.register(
            BackendType::Sqlite,
            Box::new(|_| Ok(Arc::new(SqlAdapter::sqlite()) as Arc<dyn Adapter>)),
        );
        registry.register(
            BackendType::Document,
            Box::new(|_| Ok(Arc::new(DocumentAdapter::new()) as Arc<dyn Adapter>)),
        );
        registry.register(
            BackendType::KeyValue,
            Box::new(|_| Ok(Arc::new(KvAdapter::new()) as Arc<dyn Adapter>)),
        );
        registry
    }

    pub fn register(&mut self, backend_type: BackendType, factory: AdapterFactory) {
        self.factories.insert(backend_type, factory);
    }

    /// Create an adapter for the given backend type
    pub fn create(
        &self,
        backend_type: &BackendType,
        settings: &ConnectionSettings,
    ) -> OrmResult<Arc<dyn Adapter>> {
        let factory = self.factories.get(backend_type).ok_or_else(|| {
            OrmError::Connection {
                message: format!("no backend registered for '{backend_type}'"),
                retryable: false,
            }
        })?;
        factory(settings)
    }

    /// Detect the backend family from a connection URL scheme. The scheme
    /// ends at the first colon; non-hierarchical forms like `sqlite::memory:`
    /// have no `//`.
    pub fn detect_from_url(url: &str) -> OrmResult<BackendType> {
        let scheme = url.split(':').next().unwrap_or("");
        match scheme {
            "postgres" | "postgresql" => Ok(BackendType::PostgreSql),
            "mysql" => Ok(BackendType::MySql),
            "sqlite" => Ok(BackendType::Sqlite),
            "document" | "memory" => Ok(BackendType::Document),
            "kv" | "keyvalue" => Ok(BackendType::KeyValue),
            other => Err(OrmError::Connection {
                message: format!("unable to detect backend from url scheme '{other}'"),
                retryable: false,
            }),
        }
    }

    pub fn registered_backends(&self) -> Vec<BackendType> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_all_five_backends() {
        let registry = BackendRegistry::with_builtins();
        let registered = registry.registered_backends();
        for backend in [
            BackendType::PostgreSql,
            BackendType::MySql,
            BackendType::Sqlite,
            BackendType::Document,
            BackendType::KeyValue,
        ] {
            assert!(registered.contains(&backend), "missing {backend}");
        }
    }

    #[test]
    fn url_scheme_detection() {
        assert_eq!(
            BackendRegistry::detect_from_url("postgres://localhost/app").unwrap(),
            BackendType::PostgreSql
        );
        assert_eq!(
            BackendRegistry::detect_from_url("memory://").unwrap(),
            BackendType::Document
        );
        assert_eq!(
            BackendRegistry::detect_from_url("sqlite::memory:").unwrap(),
            BackendType::Sqlite
        );
        assert_eq!(
            BackendRegistry::detect_from_url("sqlite://app.db").unwrap(),
            BackendType::Sqlite
        );
        assert!(BackendRegistry::detect_from_url("carrier-pigeon://coop").is_err());
    }

    #[test]
    fn external_registration_is_allowed() {
        let mut registry = BackendRegistry::new();
        registry.register(
            BackendType::External("sixth".to_string()),
            Box::new(|_| Ok(Arc::new(DocumentAdapter::new()) as Arc<dyn Adapter>)),
        );
        let adapter = registry
            .create(
                &BackendType::External("sixth".to_string()),
                &ConnectionSettings::default(),
            )
            .unwrap();
        assert_eq!(adapter.backend_type(), BackendType::Document);
    }
}
