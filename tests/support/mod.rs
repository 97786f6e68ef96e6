// SPDX-License-Identifier: MIT

//! In-memory storage and catalog fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use catalog_sync::catalog::records::SystemRecord;
use catalog_sync::catalog::CatalogWriter;
use catalog_sync::error::{Error, Result};
use catalog_sync::gate::AvailabilityGate;
use catalog_sync::reconcile::StorageReconciler;
use catalog_sync::repository::RepositoryIndex;
use catalog_sync::store::{
    ComponentRow, InsertOutcome, RepositoryRecord, Store, StoreTx, StoredComponent, StoredSystem,
};
use catalog_sync::sync::SyncCoordinator;

#[derive(Debug, Clone, PartialEq)]
pub struct MemComponent {
    pub hash_md5: String,
    pub xml_file_name: String,
    pub values: BTreeMap<String, Option<String>>,
}

impl MemComponent {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemState {
    /// Columns inserts accept.
    pub columns: BTreeMap<String, String>,
    /// What the capability query reports, if different from `columns`.
    pub advertised: Option<BTreeMap<String, String>>,
    pub repositories: Vec<RepositoryRecord>,
    pub systems: BTreeMap<String, StoredSystem>,
    pub components: BTreeMap<i64, MemComponent>,
    pub links: BTreeSet<(i64, String)>,
    pub next_id: i64,
}

impl MemState {
    pub fn component(&self, hash: &str) -> Option<(i64, &MemComponent)> {
        self.components
            .iter()
            .find(|(_, c)| c.hash_md5 == hash)
            .map(|(id, c)| (*id, c))
    }

    pub fn links_of(&self, id: i64) -> BTreeSet<String> {
        self.links
            .iter()
            .filter(|(c, _)| *c == id)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn components_of(&self, file_name: &str) -> usize {
        self.components
            .values()
            .filter(|c| c.xml_file_name == file_name)
            .count()
    }

    fn drop_components(&mut self, doomed: Vec<i64>) -> usize {
        for id in &doomed {
            self.components.remove(id);
        }
        self.links.retain(|(c, _)| !doomed.contains(c));
        doomed.len()
    }
}

pub fn default_columns() -> BTreeMap<String, String> {
    [
        ("id", "int8"),
        ("name", "text"),
        ("component_type", "text"),
        ("description", "text"),
        ("lu_category", "text"),
        ("category", "text"),
        ("revision_history", "text"),
        ("important_info", "text"),
        ("container_power_cycle_required", "bool"),
        ("date_time", "text"),
        ("dell_version", "text"),
        ("hash_md5", "text"),
        ("package_id", "text"),
        ("package_type", "text"),
        ("path", "text"),
        ("xml_file_name", "text"),
        ("reboot_required", "bool"),
        ("release_date", "text"),
        ("release_id", "text"),
        ("schema_version", "text"),
        ("size", "int8"),
        ("vendor_version", "text"),
        ("extension_fields", "jsonb"),
        ("created_at", "timestamp"),
        ("updated_at", "timestamp"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// A `Store` keeping everything in memory. A transaction works on a copy
/// of the state that is committed on success.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemState>,
    fail_hashes: Mutex<HashSet<String>>,
    gate: Mutex<Option<AvailabilityGate>>,
    gate_observed: Mutex<Vec<bool>>,
    merges: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = MemoryStore::default();
        store.state.lock().unwrap().columns = default_columns();
        store
    }

    pub fn snapshot(&self) -> MemState {
        self.state.lock().unwrap().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut MemState)) {
        f(&mut self.state.lock().unwrap())
    }

    /// Inserting a component with this hash fails like a lost connection.
    pub fn fail_on(&self, hash: &str) {
        self.fail_hashes.lock().unwrap().insert(hash.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_hashes.lock().unwrap().clear();
    }

    /// Records the gate state whenever a merge starts.
    pub fn observe_gate(&self, gate: &AvailabilityGate) {
        *self.gate.lock().unwrap() = Some(gate.clone());
    }

    pub fn gate_observed(&self) -> Vec<bool> {
        self.gate_observed.lock().unwrap().clone()
    }

    /// Number of merges that reached storage, committed or not.
    pub fn merges(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }
}

struct MemTx<'a> {
    store: &'a MemoryStore,
    state: MemState,
}

impl StoreTx for MemTx<'_> {
    fn component_columns(&mut self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .state
            .advertised
            .clone()
            .unwrap_or_else(|| self.state.columns.clone()))
    }

    fn insert_system(&mut self, system: &SystemRecord) -> Result<bool> {
        if self.state.systems.contains_key(&system.system_id) {
            return Ok(false);
        }
        self.state.systems.insert(
            system.system_id.clone(),
            StoredSystem {
                system_id: system.system_id.clone(),
                system_id_type: Some(system.system_id_type.clone()),
                brand: system.brand.clone(),
                name: system.name.clone(),
            },
        );
        Ok(true)
    }

    fn insert_component(&mut self, row: &ComponentRow, systems: &BTreeSet<String>) -> Result<InsertOutcome> {
        // everything is checked before anything changes, like a savepoint
        if self.store.fail_hashes.lock().unwrap().contains(&row.hash_md5) {
            return Err(Error::Storage(format!("injected failure for {}", row.hash_md5)));
        }
        for (name, _) in &row.columns {
            if !self.state.columns.contains_key(name) {
                return Err(Error::SchemaDrift {
                    column: name.clone(),
                });
            }
        }
        let values: BTreeMap<String, Option<String>> = row.columns.iter().cloned().collect();
        let repo = match values.get("xml_file_name").cloned().flatten() {
            Some(r) => r,
            None => return Err(Error::Storage("xml_file_name must not be null".to_string())),
        };
        if !self.state.repositories.iter().any(|r| r.file_name == repo) {
            return Err(Error::Storage(format!("no repository {}", repo)));
        }
        if let Some(s) = systems.iter().find(|s| !self.state.systems.contains_key(*s)) {
            return Err(Error::Storage(format!("no system {}", s)));
        }

        let (id, inserted) = match self.state.component(&row.hash_md5) {
            Some((id, _)) => (id, false),
            None => {
                self.state.next_id += 1;
                let id = self.state.next_id;
                self.state.components.insert(
                    id,
                    MemComponent {
                        hash_md5: row.hash_md5.clone(),
                        xml_file_name: repo,
                        values,
                    },
                );
                (id, true)
            }
        };
        let mut links = 0;
        for s in systems {
            if self.state.links.insert((id, s.clone())) {
                links += 1;
            }
        }
        Ok(match inserted {
            true => InsertOutcome::Inserted { id, links },
            false => InsertOutcome::Existing { id, links },
        })
    }

    fn insert_repository(&mut self, file_name: &str, file_path: &str) -> Result<bool> {
        self.store.merges.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.store.gate.lock().unwrap().as_ref() {
            self.store
                .gate_observed
                .lock()
                .unwrap()
                .push(gate.is_unavailable());
        }
        if self.state.repositories.iter().any(|r| r.file_name == file_name) {
            return Ok(false);
        }
        self.state.repositories.push(RepositoryRecord {
            file_name: file_name.to_string(),
            file_path: file_path.to_string(),
            discovered_at: Utc::now().naive_utc(),
        });
        Ok(true)
    }

    fn delete_components_for(&mut self, file_name: &str) -> Result<usize> {
        let doomed: Vec<i64> = self
            .state
            .components
            .iter()
            .filter(|(_, c)| c.xml_file_name == file_name)
            .map(|(id, _)| *id)
            .collect();
        Ok(self.state.drop_components(doomed))
    }

    fn delete_stale_components(&mut self, file_name: &str, keep: &BTreeSet<String>) -> Result<usize> {
        let doomed: Vec<i64> = self
            .state
            .components
            .iter()
            .filter(|(_, c)| c.xml_file_name == file_name && !keep.contains(&c.hash_md5))
            .map(|(id, _)| *id)
            .collect();
        Ok(self.state.drop_components(doomed))
    }

    fn unlink_components(&mut self, hashes: &BTreeSet<String>) -> Result<usize> {
        let ids: HashSet<i64> = self
            .state
            .components
            .iter()
            .filter(|(_, c)| hashes.contains(&c.hash_md5))
            .map(|(id, _)| *id)
            .collect();
        let before = self.state.links.len();
        self.state.links.retain(|(id, _)| !ids.contains(id));
        Ok(before - self.state.links.len())
    }

    fn delete_unreferenced_systems(&mut self) -> Result<usize> {
        let linked: HashSet<String> = self.state.links.iter().map(|(_, s)| s.clone()).collect();
        let before = self.state.systems.len();
        self.state.systems.retain(|id, _| linked.contains(id));
        Ok(before - self.state.systems.len())
    }

    fn delete_repository(&mut self, file_name: &str) -> Result<usize> {
        self.delete_components_for(file_name)?;
        let before = self.state.repositories.len();
        self.state.repositories.retain(|r| r.file_name != file_name);
        Ok(before - self.state.repositories.len())
    }

    fn wipe(&mut self) -> Result<()> {
        self.state.links.clear();
        self.state.components.clear();
        self.state.systems.clear();
        self.state.repositories.clear();
        Ok(())
    }

    fn repositories(&mut self) -> Result<Vec<RepositoryRecord>> {
        let mut r = self.state.repositories.clone();
        r.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(r)
    }

    fn component_count(&mut self, file_name: &str) -> Result<i64> {
        Ok(self.state.components_of(file_name) as i64)
    }

    fn systems(&mut self) -> Result<Vec<StoredSystem>> {
        Ok(self.state.systems.values().cloned().collect())
    }

    fn components_for_system(&mut self, system_id: &str) -> Result<Vec<StoredComponent>> {
        let ids: Vec<i64> = self
            .state
            .links
            .iter()
            .filter(|(_, s)| s == system_id)
            .map(|(c, _)| *c)
            .collect();
        let mut found = Vec::new();
        for id in ids {
            if let Some(c) = self.component(id)? {
                found.push(c);
            }
        }
        Ok(found)
    }

    fn component(&mut self, id: i64) -> Result<Option<StoredComponent>> {
        Ok(self.state.components.get(&id).map(|c| StoredComponent {
            id,
            name: c.get("name").map(str::to_string),
            category: c.get("category").map(str::to_string),
            hash_md5: c.hash_md5.clone(),
            path: c.get("path").map(str::to_string),
            vendor_version: c.get("vendor_version").map(str::to_string),
            xml_file_name: c.xml_file_name.clone(),
        }))
    }
}

impl Store for MemoryStore {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>,
    {
        let mut guard = self.state.lock().unwrap();
        let mut tx = MemTx {
            store: self,
            state: guard.clone(),
        };
        let result = f(&mut tx);
        if result.is_ok() {
            *guard = tx.state;
        }
        result
    }
}

/// One SoftwareComponent of a generated catalog.
#[derive(Debug, Clone)]
pub struct Pkg {
    pub hash: String,
    pub path: String,
    pub category: String,
    /// `(systemID, model name)`
    pub systems: Vec<(String, String)>,
    pub description: bool,
    pub extra_attribute: Option<(String, String)>,
}

pub fn pkg(hash: &str, path: &str, systems: &[(&str, &str)]) -> Pkg {
    Pkg {
        hash: hash.to_string(),
        path: path.to_string(),
        category: "BI".to_string(),
        systems: systems
            .iter()
            .map(|(i, n)| (i.to_string(), n.to_string()))
            .collect(),
        description: true,
        extra_attribute: None,
    }
}

/// Renders a catalog in the vendor layout.
pub fn catalog(pkgs: &[Pkg]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-16\"?>\n\
         <Manifest baseLocation=\"downloads.example.com\" version=\"1.00\">\n",
    );
    for p in pkgs {
        let extra = p
            .extra_attribute
            .as_ref()
            .map(|(k, v)| format!(" {}=\"{}\"", k, v))
            .unwrap_or_default();
        xml.push_str(&format!(
            "  <SoftwareComponent hashMD5=\"{}\" path=\"{}\" packageType=\"LWXP\" size=\"1024\" \
             rebootRequired=\"true\" vendorVersion=\"1.0\"{}>\n",
            p.hash, p.path, extra
        ));
        xml.push_str(&format!(
            "    <Name><Display lang=\"en\"><![CDATA[Package {}]]></Display></Name>\n",
            p.hash
        ));
        xml.push_str(
            "    <ComponentType value=\"BIOS\"><Display lang=\"en\"><![CDATA[BIOS]]></Display></ComponentType>\n",
        );
        if p.description {
            xml.push_str(
                "    <Description><Display lang=\"en\"><![CDATA[A package.]]></Display></Description>\n",
            );
        }
        xml.push_str(
            "    <LUCategory value=\"BIOS\"><Display lang=\"en\"><![CDATA[BIOS]]></Display></LUCategory>\n",
        );
        xml.push_str(&format!(
            "    <Category value=\"{}\"><Display lang=\"en\"><![CDATA[BIOS]]></Display></Category>\n",
            p.category
        ));
        xml.push_str("    <SupportedSystems>\n      <Brand key=\"3\" prefix=\"PE\">\n");
        xml.push_str("        <Display lang=\"en\"><![CDATA[PowerEdge]]></Display>\n");
        for (id, name) in &p.systems {
            xml.push_str(&format!(
                "        <Model systemID=\"{}\" systemIDType=\"BIOS\"><Display lang=\"en\"><![CDATA[{}]]></Display></Model>\n",
                id, name
            ));
        }
        xml.push_str("      </Brand>\n    </SupportedSystems>\n  </SoftwareComponent>\n");
    }
    xml.push_str("</Manifest>\n");
    xml
}

pub fn utf16le(text: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Writes `xml` as `dir/name`, UTF-16LE with BOM, creating `dir`.
pub fn write_catalog(dir: &Path, name: &str, xml: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, utf16le(xml)).unwrap();
    path
}

/// The catalog fixture shipped with the tests.
pub fn fixture() -> String {
    fs::read_to_string(Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/Catalog.xml"))
        .unwrap()
}

pub struct Harness {
    pub root: tempfile::TempDir,
    pub parsed: tempfile::TempDir,
    pub store: Arc<MemoryStore>,
    pub gate: AvailabilityGate,
    pub coordinator: SyncCoordinator<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let parsed = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let gate = AvailabilityGate::new();
        store.observe_gate(&gate);
        let coordinator = SyncCoordinator::new(
            RepositoryIndex::new(root.path(), &[]),
            CatalogWriter::new(parsed.path()),
            Arc::new(StorageReconciler::new(Arc::clone(&store))),
            gate.clone(),
        );
        Harness {
            root,
            parsed,
            store,
            gate,
            coordinator,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.coordinator = self.coordinator.with_retry_delay(delay);
        self
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    pub fn writer(&self) -> CatalogWriter {
        CatalogWriter::new(self.parsed.path())
    }
}
