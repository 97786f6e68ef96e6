// SPDX-License-Identifier: MIT

//! Storage port used by the reconciler and the coordinator.
//!
//! [`crate::db::pg::PgStore`] implements it on PostgreSQL. All writes go
//! through [`Store::transaction`]; a closure returning an error rolls the
//! whole transaction back.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;

use crate::catalog::records::{ColumnValue, SystemRecord};
use crate::error::Result;

/// One tracked repository (`xml_files` row).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRecord {
    /// Catalog path relative to the watched root, unique.
    pub file_name: String,
    /// Absolute repository directory.
    pub file_path: String,
    pub discovered_at: NaiveDateTime,
}

/// A stored system row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSystem {
    pub system_id: String,
    pub system_id_type: Option<String>,
    pub brand: Option<String>,
    pub name: Option<String>,
}

/// The slice of a stored component the listings show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredComponent {
    pub id: i64,
    pub name: Option<String>,
    pub category: Option<String>,
    pub hash_md5: String,
    pub path: Option<String>,
    pub vendor_version: Option<String>,
    pub xml_file_name: String,
}

/// A component row ready for insertion: the values already projected
/// onto the columns storage knows.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRow {
    pub hash_md5: String,
    pub columns: Vec<ColumnValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was created; `links` join rows were written.
    Inserted { id: i64, links: usize },
    /// A row with the same hash already existed; `links` missing join rows
    /// were added to it.
    Existing { id: i64, links: usize },
}

impl InsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            InsertOutcome::Inserted { id, .. } | InsertOutcome::Existing { id, .. } => *id,
        }
    }
}

/// Operations available inside one transaction.
pub trait StoreTx {
    /// Column name to type name of the components table.
    fn component_columns(&mut self) -> Result<BTreeMap<String, String>>;

    /// Inserts a system unless its `system_id` exists. Returns whether a
    /// row was created.
    fn insert_system(&mut self, system: &SystemRecord) -> Result<bool>;

    /// Inserts a component keyed by its hash and links it to `systems`.
    ///
    /// Runs in its own savepoint: an error leaves the surrounding
    /// transaction usable.
    fn insert_component(&mut self, row: &ComponentRow, systems: &BTreeSet<String>) -> Result<InsertOutcome>;

    /// Inserts a repository record unless one with the same name exists.
    fn insert_repository(&mut self, file_name: &str, file_path: &str) -> Result<bool>;

    /// Deletes every component of a repository.
    fn delete_components_for(&mut self, file_name: &str) -> Result<usize>;

    /// Deletes components of a repository whose hash is not in `keep`.
    fn delete_stale_components(&mut self, file_name: &str, keep: &BTreeSet<String>) -> Result<usize>;

    /// Deletes the system links of every component whose hash is in
    /// `hashes`, regardless of the repository that owns the row.
    fn unlink_components(&mut self, hashes: &BTreeSet<String>) -> Result<usize>;

    /// Deletes systems no component links to.
    fn delete_unreferenced_systems(&mut self) -> Result<usize>;

    fn delete_repository(&mut self, file_name: &str) -> Result<usize>;

    /// Deletes every synchronized row.
    fn wipe(&mut self) -> Result<()>;

    fn repositories(&mut self) -> Result<Vec<RepositoryRecord>>;

    fn component_count(&mut self, file_name: &str) -> Result<i64>;

    fn systems(&mut self) -> Result<Vec<StoredSystem>>;

    /// Components linked to one system.
    fn components_for_system(&mut self, system_id: &str) -> Result<Vec<StoredComponent>>;

    fn component(&mut self, id: i64) -> Result<Option<StoredComponent>>;
}

pub trait Store: Send + Sync {
    /// Runs `f` in one transaction. Commits if `f` returns `Ok`.
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>;

    fn repositories(&self) -> Result<Vec<RepositoryRecord>> {
        self.transaction(|tx| tx.repositories())
    }

    fn component_count(&self, file_name: &str) -> Result<i64> {
        self.transaction(|tx| tx.component_count(file_name))
    }

    fn systems(&self) -> Result<Vec<StoredSystem>> {
        self.transaction(|tx| tx.systems())
    }

    fn components_for_system(&self, system_id: &str) -> Result<Vec<StoredComponent>> {
        self.transaction(|tx| tx.components_for_system(system_id))
    }

    fn component(&self, id: i64) -> Result<Option<StoredComponent>> {
        self.transaction(|tx| tx.component(id))
    }
}
