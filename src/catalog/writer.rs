// SPDX-License-Identifier: MIT

//! Intermediate artifacts between parsing and the database merge.
//!
//! Each repository gets one JSON file per entity kind,
//! `{repo_id}_{kind}.json`, in the configured parsed directory. Files are
//! written to a temporary file in the same directory and renamed into
//! place, so a reader never sees a partially written artifact.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::catalog::records::{
    BundleRecord, ComponentRecord, DeviceRecord, NormalizedCatalog, SystemRecord,
};
use crate::debug::print_step;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Systems,
    Devices,
    Components,
    Bundles,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Systems,
        ArtifactKind::Devices,
        ArtifactKind::Components,
        ArtifactKind::Bundles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Systems => "systems",
            ArtifactKind::Devices => "devices",
            ArtifactKind::Components => "components",
            ArtifactKind::Bundles => "bundles",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        ArtifactKind::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits `r440_components.json` into `("r440", Components)`.
pub fn parse_artifact_name(path: &Path) -> Option<(String, ArtifactKind)> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (repo_id, kind) = stem.rsplit_once('_')?;
    if repo_id.is_empty() {
        return None;
    }
    Some((repo_id.to_string(), ArtifactKind::from_suffix(kind)?))
}

#[derive(Debug, Clone)]
pub struct CatalogWriter {
    dir: PathBuf,
}

impl CatalogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CatalogWriter { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, repo_id: &str, kind: ArtifactKind) -> PathBuf {
        self.dir.join(format!("{}_{}.json", repo_id, kind))
    }

    fn write_one<T: Serialize>(&self, repo_id: &str, kind: ArtifactKind, records: &[T]) -> Result<()> {
        let target = self.path(repo_id, kind);
        let json = serde_json::to_vec_pretty(records).map_err(|e| Error::Json {
            path: target.clone(),
            source: e,
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        tmp.write_all(&json).map_err(|e| Error::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.persist(&target)
            .map_err(|e| Error::io(&target, e.error))?;

        print_step(format!("wrote {} {}", records.len(), target.display()));
        Ok(())
    }

    /// Writes all four entity sets of one repository.
    ///
    /// Components are written last: the parsed directory watch reacts to
    /// the components artifact and expects the systems artifact to be
    /// complete by then.
    pub fn write(&self, repo_id: &str, catalog: &NormalizedCatalog) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        self.write_one(repo_id, ArtifactKind::Systems, &catalog.systems)?;
        self.write_one(repo_id, ArtifactKind::Devices, &catalog.devices)?;
        self.write_one(repo_id, ArtifactKind::Bundles, &catalog.bundles)?;
        self.write_one(repo_id, ArtifactKind::Components, &catalog.components)?;
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, repo_id: &str, kind: ArtifactKind) -> Result<Vec<T>> {
        let path = self.path(repo_id, kind);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingArtifact { path })
            }
            Err(e) => return Err(Error::io(path, e)),
        };
        serde_json::from_slice(&data).map_err(|e| Error::Json { path, source: e })
    }

    pub fn read_systems(&self, repo_id: &str) -> Result<Vec<SystemRecord>> {
        self.read(repo_id, ArtifactKind::Systems)
    }

    pub fn read_devices(&self, repo_id: &str) -> Result<Vec<DeviceRecord>> {
        self.read(repo_id, ArtifactKind::Devices)
    }

    pub fn read_components(&self, repo_id: &str) -> Result<Vec<ComponentRecord>> {
        self.read(repo_id, ArtifactKind::Components)
    }

    pub fn read_bundles(&self, repo_id: &str) -> Result<Vec<BundleRecord>> {
        self.read(repo_id, ArtifactKind::Bundles)
    }

    pub fn exists(&self, repo_id: &str, kind: ArtifactKind) -> bool {
        self.path(repo_id, kind).is_file()
    }

    /// Removes every artifact of one repository. Returns how many files
    /// were deleted.
    pub fn remove(&self, repo_id: &str) -> Result<usize> {
        let mut removed = 0;
        for kind in ArtifactKind::ALL {
            let path = self.path(repo_id, kind);
            match fs::remove_file(&path) {
                Ok(()) => {
                    print_step(format!("removed {}", path.display()));
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(path, e)),
            }
        }
        Ok(removed)
    }

    /// Repository ids that have a components artifact.
    pub fn repository_ids(&self) -> Result<Vec<String>> {
        let pattern = format!(
            "{}/*_{}.json",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            ArtifactKind::Components
        );
        let entries = glob::glob(&pattern).map_err(|e| Error::Storage(e.to_string()))?;
        let mut ids: Vec<String> = entries
            .filter_map(|p| p.ok())
            .filter_map(|p| parse_artifact_name(&p))
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::records::SupportedSystem;
    use std::collections::BTreeMap;

    fn component(hash: &str) -> ComponentRecord {
        ComponentRecord {
            name: "BIOS".to_string(),
            component_type: "BIOS".to_string(),
            description: "desc".to_string(),
            category: "BI".to_string(),
            lu_category: "BIOS".to_string(),
            hash_md5: hash.to_string(),
            package_type: Some("LWXP".to_string()),
            path: "r440/FOLDER05/BIOS.EXE".to_string(),
            release_date: None,
            release_id: None,
            vendor_version: None,
            dell_version: None,
            size: Some(10),
            xml_file_name: "r440/Catalog.xml".to_string(),
            package_id: None,
            date_time: None,
            schema_version: None,
            reboot_required: Some(true),
            container_power_cycle_required: None,
            revision_history: None,
            important_info: None,
            extension_fields: Some(serde_json::json!({"$": {"name": "fmp"}})),
            supported_systems: vec![SupportedSystem {
                system_id: "08D4".to_string(),
                system_id_type: "BIOS".to_string(),
                brand: Some("PowerEdge".to_string()),
            }],
            extra: BTreeMap::from([("vendorFlag".to_string(), serde_json::json!("yes"))]),
        }
    }

    #[test]
    fn write_read_test() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CatalogWriter::new(dir.path().join("parsed"));
        let catalog = NormalizedCatalog {
            components: vec![component("aa"), component("bb")],
            ..Default::default()
        };
        writer.write("r440", &catalog).unwrap();

        for kind in ArtifactKind::ALL {
            assert!(writer.exists("r440", kind), "{} missing", kind);
        }
        let read = writer.read_components("r440").unwrap();
        assert_eq!(catalog.components, read);
        assert!(writer.read_systems("r440").unwrap().is_empty());
        assert!(writer.read_devices("r440").unwrap().is_empty());

        // nothing but the four artifacts, no leftover temporary files
        assert_eq!(4, fs::read_dir(writer.dir()).unwrap().count());

        // the artifact is self describing
        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(writer.path("r440", ArtifactKind::Components)).unwrap())
                .unwrap();
        assert_eq!("aa", raw[0]["hashMD5"]);
        assert_eq!("BI", raw[0]["category"]);
        assert_eq!("yes", raw[0]["vendorFlag"]);
    }

    #[test]
    fn missing_artifact_test() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CatalogWriter::new(dir.path());
        assert!(matches!(
            writer.read_components("nope"),
            Err(Error::MissingArtifact { .. })
        ));
    }

    #[test]
    fn remove_and_list_test() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CatalogWriter::new(dir.path());
        writer.write("a", &NormalizedCatalog::default()).unwrap();
        writer.write("a_b", &NormalizedCatalog::default()).unwrap();
        assert_eq!(vec!["a".to_string(), "a_b".to_string()], writer.repository_ids().unwrap());

        assert_eq!(4, writer.remove("a").unwrap());
        assert_eq!(0, writer.remove("a").unwrap());
        assert_eq!(vec!["a_b".to_string()], writer.repository_ids().unwrap());
    }

    #[test]
    fn parse_artifact_name_test() {
        assert_eq!(
            Some(("r440".to_string(), ArtifactKind::Components)),
            parse_artifact_name(Path::new("/p/r440_components.json"))
        );
        assert_eq!(
            Some(("site_r440".to_string(), ArtifactKind::Systems)),
            parse_artifact_name(Path::new("site_r440_systems.json"))
        );
        assert_eq!(
            Some(("a%5Fb_r440".to_string(), ArtifactKind::Bundles)),
            parse_artifact_name(Path::new("a%5Fb_r440_bundles.json"))
        );
        assert_eq!(
            Some(("repos%2F".to_string(), ArtifactKind::Components)),
            parse_artifact_name(Path::new("repos%2F_components.json"))
        );
        assert_eq!(None, parse_artifact_name(Path::new("r440_other.json")));
        assert_eq!(None, parse_artifact_name(Path::new("r440_systems.txt")));
        assert_eq!(None, parse_artifact_name(Path::new("_systems.json")));
    }
}
