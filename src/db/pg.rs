// SPDX-License-Identifier: MIT

//! PostgreSQL implementation of the storage port.

use std::collections::{BTreeMap, BTreeSet};

use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};

use crate::catalog::records::SystemRecord;
use crate::db::{functions, setup};
use crate::error::{Error, Result};
use crate::store::{
    ComponentRow, InsertOutcome, RepositoryRecord, Store, StoreTx, StoredComponent, StoredSystem,
};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn connect(url: &str, pool_size: u32) -> Result<Self> {
        let manager = ConnectionManager::<PgConnection>::new(url);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| Error::Pool(e.to_string()))?;
        Ok(PgStore { pool })
    }

    pub fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.pool.get()?;
        setup::ensure_schema(&mut conn)?;
        Ok(())
    }
}

impl Store for PgStore {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>,
    {
        let mut conn = self.pool.get()?;
        let conn: &mut PgConnection = &mut conn;
        conn.transaction::<T, Error, _>(|c| {
            let mut tx = PgTx::new(c);
            f(&mut tx)
        })
    }
}

/// One open transaction.
pub struct PgTx<'a> {
    conn: &'a mut PgConnection,
    types: Option<BTreeMap<String, String>>,
}

impl<'a> PgTx<'a> {
    pub fn new(conn: &'a mut PgConnection) -> Self {
        PgTx { conn, types: None }
    }

    fn column_types(&mut self) -> Result<BTreeMap<String, String>> {
        match &self.types {
            Some(t) => Ok(t.clone()),
            None => self.component_columns(),
        }
    }
}

impl StoreTx for PgTx<'_> {
    fn component_columns(&mut self) -> Result<BTreeMap<String, String>> {
        let columns = functions::get_component_columns(self.conn)?;
        self.types = Some(columns.clone());
        Ok(columns)
    }

    fn insert_system(&mut self, system: &SystemRecord) -> Result<bool> {
        Ok(functions::insert_system(self.conn, system)? > 0)
    }

    fn insert_component(&mut self, row: &ComponentRow, systems: &BTreeSet<String>) -> Result<InsertOutcome> {
        let types = self.column_types()?;
        // nested transaction, i.e. a savepoint
        self.conn.transaction::<InsertOutcome, Error, _>(|c| {
            match functions::insert_component(c, row, &types)? {
                Some(id) => Ok(InsertOutcome::Inserted {
                    id,
                    links: functions::link_component(c, id, systems)?,
                }),
                None => {
                    let id = functions::find_component_id(c, &row.hash_md5)?;
                    Ok(InsertOutcome::Existing {
                        id,
                        links: functions::link_component(c, id, systems)?,
                    })
                }
            }
        })
    }

    fn insert_repository(&mut self, file_name: &str, file_path: &str) -> Result<bool> {
        Ok(functions::insert_repository(self.conn, file_name, file_path)? > 0)
    }

    fn delete_components_for(&mut self, file_name: &str) -> Result<usize> {
        Ok(functions::delete_components_for(self.conn, file_name)?)
    }

    fn delete_stale_components(&mut self, file_name: &str, keep: &BTreeSet<String>) -> Result<usize> {
        Ok(functions::delete_stale_components(self.conn, file_name, keep)?)
    }

    fn unlink_components(&mut self, hashes: &BTreeSet<String>) -> Result<usize> {
        Ok(functions::unlink_components(self.conn, hashes)?)
    }

    fn delete_unreferenced_systems(&mut self) -> Result<usize> {
        Ok(functions::delete_unreferenced_systems(self.conn)?)
    }

    fn delete_repository(&mut self, file_name: &str) -> Result<usize> {
        Ok(functions::delete_repository(self.conn, file_name)?)
    }

    fn wipe(&mut self) -> Result<()> {
        Ok(functions::wipe(self.conn)?)
    }

    fn repositories(&mut self) -> Result<Vec<RepositoryRecord>> {
        Ok(functions::get_repositories(self.conn)?
            .into_iter()
            .map(RepositoryRecord::from)
            .collect())
    }

    fn component_count(&mut self, file_name: &str) -> Result<i64> {
        Ok(functions::count_components(self.conn, file_name)?)
    }

    fn systems(&mut self) -> Result<Vec<StoredSystem>> {
        Ok(functions::get_systems(self.conn)?
            .into_iter()
            .map(StoredSystem::from)
            .collect())
    }

    fn components_for_system(&mut self, system_id: &str) -> Result<Vec<StoredComponent>> {
        Ok(functions::get_components_for_system(self.conn, system_id)?
            .into_iter()
            .map(StoredComponent::from)
            .collect())
    }

    fn component(&mut self, id: i64) -> Result<Option<StoredComponent>> {
        Ok(functions::get_component(self.conn, id)?.map(StoredComponent::from))
    }
}
