// SPDX-License-Identifier: MIT

//! Applies one repository's normalized records to storage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::catalog::records::{ComponentRecord, SystemRecord};
use crate::debug::print_step;
use crate::error::{Error, Result};
use crate::store::{ComponentRow, InsertOutcome, Store, StoreTx};

/// Columns filled by storage itself.
const GENERATED_COLUMNS: &[&str] = &["id", "created_at", "updated_at"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub systems_inserted: usize,
    pub components_inserted: usize,
    /// Components whose hash was already stored, possibly by another
    /// repository.
    pub components_existing: usize,
    pub components_failed: usize,
    pub links: usize,
    /// Record fields storage has no column for.
    pub stripped: BTreeSet<String>,
    /// Components of this repository no longer in its catalog.
    pub stale_removed: usize,
    pub systems_removed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub components_removed: usize,
    /// Links of listed components that other repositories own.
    pub links_removed: usize,
    pub systems_removed: usize,
    pub repository_removed: bool,
}

/// Projects a component onto the known storage columns. Returns the row
/// and the names of the fields that were left out.
pub fn project(
    columns: &BTreeMap<String, String>,
    record: &ComponentRecord,
) -> (ComponentRow, Vec<String>) {
    let mut kept = Vec::new();
    let mut stripped = Vec::new();
    for (name, value) in record.column_values() {
        if GENERATED_COLUMNS.contains(&name.as_str()) {
            continue;
        }
        match columns.contains_key(&name) {
            true => kept.push((name, value)),
            false => stripped.push(name),
        }
    }
    (
        ComponentRow {
            hash_md5: record.hash_md5.clone(),
            columns: kept,
        },
        stripped,
    )
}

pub struct StorageReconciler<S: Store> {
    store: Arc<S>,
    columns: Mutex<Option<BTreeMap<String, String>>>,
}

impl<S: Store> StorageReconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        StorageReconciler {
            store,
            columns: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn cached_columns(&self) -> Option<BTreeMap<String, String>> {
        match self.columns.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_columns(&self, columns: BTreeMap<String, String>) {
        match self.columns.lock() {
            Ok(mut guard) => *guard = Some(columns),
            Err(poisoned) => *poisoned.into_inner() = Some(columns),
        }
    }

    fn columns(&self, tx: &mut dyn StoreTx) -> Result<BTreeMap<String, String>> {
        if let Some(c) = self.cached_columns() {
            return Ok(c);
        }
        self.refresh_columns(tx)
    }

    fn refresh_columns(&self, tx: &mut dyn StoreTx) -> Result<BTreeMap<String, String>> {
        let columns = tx.component_columns()?;
        print_step(format!("components table has {} columns", columns.len()));
        self.set_columns(columns.clone());
        Ok(columns)
    }

    /// Inserts one component, recovering once from an unknown column.
    ///
    /// Returns `None` if the component had to be dropped.
    fn insert_component(
        &self,
        tx: &mut dyn StoreTx,
        record: &ComponentRecord,
        systems: &BTreeSet<String>,
        report: &mut MergeReport,
    ) -> Result<Option<InsertOutcome>> {
        let columns = self.columns(tx)?;
        let (row, stripped) = project(&columns, record);
        for s in stripped {
            if report.stripped.insert(s.clone()) {
                warn!(column = %s, hash = %record.hash_md5, "storage has no column for field, dropping it");
            }
        }

        let column = match tx.insert_component(&row, systems) {
            Ok(outcome) => return Ok(Some(outcome)),
            Err(Error::SchemaDrift { column }) => column,
            Err(Error::StorageConflict(msg)) => {
                warn!(hash = %record.hash_md5, "conflict inserting component: {}", msg);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        warn!(column = %column, hash = %record.hash_md5, "schema drift, retrying without the column");
        let columns = self.refresh_columns(tx)?;
        let (mut row, _) = project(&columns, record);
        row.columns.retain(|(name, _)| name != &column);
        report.stripped.insert(column);

        match tx.insert_component(&row, systems) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) if e.is_entity_level() => {
                warn!(hash = %record.hash_md5, error = %e, "giving up on component");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Merges one repository in a single transaction.
    ///
    /// The repository record is created in the same transaction, so a
    /// rolled back merge leaves the repository looking new.
    pub fn merge(
        &self,
        file_name: &str,
        file_path: &str,
        systems: &[SystemRecord],
        components: &[ComponentRecord],
    ) -> Result<MergeReport> {
        let report = self.store.transaction(|tx| {
            let mut report = MergeReport::default();
            tx.insert_repository(file_name, file_path)?;

            let mut present: BTreeSet<String> = BTreeSet::new();
            for s in systems {
                if tx.insert_system(s)? {
                    report.systems_inserted += 1;
                }
                present.insert(s.system_id.clone());
            }

            let mut keep: BTreeSet<String> = BTreeSet::new();
            for c in components {
                keep.insert(c.hash_md5.clone());
                let links: BTreeSet<String> = c
                    .supported_systems
                    .iter()
                    .map(|s| s.system_id.clone())
                    .filter(|id| present.contains(id))
                    .collect();

                match self.insert_component(tx, c, &links, &mut report)? {
                    Some(InsertOutcome::Inserted { links, .. }) => {
                        report.components_inserted += 1;
                        report.links += links;
                    }
                    Some(InsertOutcome::Existing { links, .. }) => {
                        report.components_existing += 1;
                        report.links += links;
                    }
                    None => report.components_failed += 1,
                }
            }

            report.stale_removed = tx.delete_stale_components(file_name, &keep)?;
            if report.stale_removed > 0 {
                report.systems_removed = tx.delete_unreferenced_systems()?;
            }
            Ok(report)
        })?;

        info!(
            repository = file_name,
            systems = report.systems_inserted,
            components = report.components_inserted,
            existing = report.components_existing,
            failed = report.components_failed,
            links = report.links,
            stripped = report.stripped.len(),
            stale = report.stale_removed,
            "merge committed"
        );
        Ok(report)
    }

    /// Removes a repository and everything only it referenced.
    ///
    /// `listed` holds the hashes the repository's catalog declared. Their
    /// links are removed as well, so that a shared row owned by another
    /// repository does not keep systems only this one contributed. The
    /// caller re-merges the remaining repositories to restore their links.
    pub fn purge(&self, file_name: &str, listed: &BTreeSet<String>) -> Result<PurgeReport> {
        let report = self.store.transaction(|tx| {
            let components_removed = tx.delete_components_for(file_name)?;
            let links_removed = tx.unlink_components(listed)?;
            let systems_removed = tx.delete_unreferenced_systems()?;
            let repository_removed = tx.delete_repository(file_name)? > 0;
            Ok(PurgeReport {
                components_removed,
                links_removed,
                systems_removed,
                repository_removed,
            })
        })?;
        info!(
            repository = file_name,
            components = report.components_removed,
            links = report.links_removed,
            systems = report.systems_removed,
            "purge committed"
        );
        Ok(report)
    }

    /// Deletes every synchronized row.
    pub fn wipe(&self) -> Result<()> {
        self.store.transaction(|tx| tx.wipe())?;
        info!("storage wiped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::records::SupportedSystem;

    fn record() -> ComponentRecord {
        ComponentRecord {
            name: "BIOS".to_string(),
            component_type: "BIOS".to_string(),
            description: "desc".to_string(),
            category: "BI".to_string(),
            lu_category: "BIOS".to_string(),
            hash_md5: "aa".to_string(),
            package_type: None,
            path: "r440/BIOS.EXE".to_string(),
            release_date: None,
            release_id: None,
            vendor_version: None,
            dell_version: None,
            size: Some(42),
            xml_file_name: "r440/Catalog.xml".to_string(),
            package_id: None,
            date_time: None,
            schema_version: None,
            reboot_required: Some(true),
            container_power_cycle_required: None,
            revision_history: None,
            important_info: None,
            extension_fields: None,
            supported_systems: vec![SupportedSystem {
                system_id: "08D4".to_string(),
                system_id_type: "BIOS".to_string(),
                brand: None,
            }],
            extra: BTreeMap::from([("targetArch".to_string(), serde_json::json!("x86"))]),
        }
    }

    #[test]
    fn project_test() {
        let columns: BTreeMap<String, String> = [
            ("id", "int8"),
            ("hash_md5", "text"),
            ("path", "text"),
            ("size", "int8"),
            ("reboot_required", "bool"),
            ("xml_file_name", "text"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let (row, stripped) = project(&columns, &record());
        assert_eq!("aa", row.hash_md5);
        let names: Vec<&str> = row.columns.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            vec!["hash_md5", "path", "size", "xml_file_name", "reboot_required"],
            names
        );
        assert!(row
            .columns
            .contains(&("size".to_string(), Some("42".to_string()))));
        assert!(row
            .columns
            .contains(&("reboot_required".to_string(), Some("true".to_string()))));
        assert!(stripped.contains(&"target_arch".to_string()));
        assert!(stripped.contains(&"category".to_string()));
        assert!(!stripped.contains(&"id".to_string()));
    }
}
