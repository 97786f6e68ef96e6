// SPDX-License-Identifier: MIT

//! Error taxonomy for the repository synchronization engine.
//!
//! Entity-level errors (`IncompleteCatalogEntry`, `SchemaDrift`) are
//! recovered where they occur and only show up in the logs. Repository-level
//! errors (`MalformedCatalog`, `Transaction`, I/O) abort the current attempt
//! for one repository, which is retried on the next watch or poll cycle.

use std::path::PathBuf;
use std::sync::OnceLock;

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use regex::Regex;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The catalog document could not be parsed at all.
    #[error("malformed catalog {}: {message}", path.display())]
    MalformedCatalog { path: PathBuf, message: String },

    /// One entity of a catalog misses a node it cannot do without.
    #[error("incomplete {entity} entry '{id}': missing {missing}")]
    IncompleteCatalogEntry {
        entity: &'static str,
        id: String,
        missing: String,
    },

    /// Storage does not know a column the record carries.
    #[error("storage has no column '{column}'")]
    SchemaDrift { column: String },

    /// Unique key violation. Normally resolved with ON CONFLICT DO NOTHING.
    #[error("storage conflict: {0}")]
    StorageConflict(String),

    #[error("transaction failed: {0}")]
    Transaction(DieselError),

    #[error("storage rejected the operation: {0}")]
    Storage(String),

    #[error("database pool: {0}")]
    Pool(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("intermediate artifact {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("intermediate artifact {} does not exist", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("file watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("{0} not found")]
    NotFound(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors that only concern a single entity of a catalog.
    pub fn is_entity_level(&self) -> bool {
        matches!(
            self,
            Error::IncompleteCatalogEntry { .. }
                | Error::SchemaDrift { .. }
                | Error::StorageConflict(_)
        )
    }
}

fn unknown_column_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"column "([^"]+)"(?: of relation "[^"]+")? does not exist"#)
            .unwrap_or_else(|e| panic!("invalid built-in regex: {}", e))
    })
}

/// Extracts the column name from a PostgreSQL "undefined column" message.
pub fn unknown_column(message: &str) -> Option<String> {
    unknown_column_pattern()
        .captures(message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

impl From<DieselError> for Error {
    fn from(e: DieselError) -> Self {
        if let DieselError::DatabaseError(kind, info) = &e {
            if let DatabaseErrorKind::UniqueViolation = kind {
                return Error::StorageConflict(info.message().to_string());
            }
            if let Some(column) = unknown_column(info.message()) {
                return Error::SchemaDrift { column };
            }
        }
        Error::Transaction(e)
    }
}

impl From<diesel::r2d2::PoolError> for Error {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        Error::Pool(e.to_string())
    }
}
