// SPDX-License-Identifier: MIT

//! Flattens a decoded catalog into systems, devices, components and bundles.
//!
//! The catalog wraps nearly every value in a child element or an attribute
//! map. Each walker below returns freshly built records; nothing is
//! accumulated in shared state, so catalogs can be normalized concurrently.
//!
//! An entity missing a node it cannot do without is skipped with an
//! `IncompleteCatalogEntry` entry in the report. The rest of the catalog is
//! still normalized.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde_json::Value;
use tracing::warn;

use crate::catalog::records::{
    BundleRecord, ComponentRecord, DeviceRecord, NormalizeReport, NormalizedCatalog,
    SupportedSystem, SystemRecord,
};
use crate::error::{Error, Result};
use crate::xml::Element;

/// Where a catalog came from.
#[derive(Debug, Clone)]
pub struct CatalogSource {
    /// Absolute path of the catalog file, for error reporting.
    pub catalog_path: PathBuf,
    /// Repository directory relative to the watched root. Component paths
    /// are prefixed with it.
    pub folder: String,
    /// Name of the repository record components reference.
    pub xml_file_name: String,
}

/// SoftwareComponent attributes with a dedicated field.
const COMPONENT_ATTRIBUTES: &[&str] = &[
    "containerPowerCycleRequired",
    "dateTime",
    "dellVersion",
    "hashMD5",
    "packageID",
    "packageType",
    "path",
    "rebootRequired",
    "releaseDate",
    "releaseID",
    "schemaVersion",
    "size",
    "vendorVersion",
];

/// SoftwareComponent children that are either mapped to a field or dropped.
const COMPONENT_CHILDREN: &[&str] = &[
    "Name",
    "ComponentType",
    "Description",
    "LUCategory",
    "Category",
    "RevisionHistory",
    "ImportantInfo",
    "Criticality",
    "ActivationRules",
    "SupportedDevices",
    "SupportedSystems",
    "SupportedOperatingSystems",
    "FMPWrappers",
];

fn incomplete(entity: &'static str, id: &str, missing: &str) -> Error {
    Error::IncompleteCatalogEntry {
        entity,
        id: id.to_string(),
        missing: missing.to_string(),
    }
}

fn required_attr(e: &Element, name: &str, entity: &'static str, id: &str) -> Result<String> {
    e.attr(name)
        .map(str::to_string)
        .ok_or_else(|| incomplete(entity, id, &format!("@{}", name)))
}

/// `<Child><Display>text</Display></Child>`
fn required_display(e: &Element, child: &str, entity: &'static str, id: &str) -> Result<String> {
    e.child(child)
        .and_then(Element::display)
        .map(str::to_string)
        .ok_or_else(|| incomplete(entity, id, &format!("{}/Display", child)))
}

/// `<Child value="..."/>`
fn required_value(e: &Element, child: &str, entity: &'static str, id: &str) -> Result<String> {
    e.child(child)
        .and_then(|c| c.attr("value"))
        .map(str::to_string)
        .ok_or_else(|| incomplete(entity, id, &format!("{}@value", child)))
}

fn optional_display(e: &Element, child: &str) -> Option<String> {
    e.child(child).and_then(Element::display).map(str::to_string)
}

fn attr_string(e: &Element, name: &str) -> Option<String> {
    e.attr(name).map(str::to_string)
}

fn attr_bool(e: &Element, name: &str) -> Option<bool> {
    e.attr(name).and_then(|v| v.trim().to_lowercase().parse::<bool>().ok())
}

/// `Brand[] -> Model[]` reduced to `{systemID, systemIDType, brand}`.
fn supported_systems(container: Option<&Element>) -> Vec<SupportedSystem> {
    let mut systems = Vec::new();
    let container = match container {
        Some(c) => c,
        None => return systems,
    };
    for brand in container.children_named("Brand") {
        let brand_name = brand.display().map(str::to_string);
        for model in brand.children_named("Model") {
            let (id, id_type) = match (model.attr("systemID"), model.attr("systemIDType")) {
                (Some(i), Some(t)) => (i, t),
                _ => continue,
            };
            systems.push(SupportedSystem {
                system_id: id.to_string(),
                system_id_type: id_type.to_string(),
                brand: brand_name.clone(),
            });
        }
    }
    systems
}

fn components_of(root: &Element) -> impl Iterator<Item = &Element> {
    root.children_named("SoftwareComponent")
}

fn parse_systems(root: &Element, report: &mut NormalizeReport) -> Vec<SystemRecord> {
    let mut seen = HashSet::new();
    let mut systems = Vec::new();

    for comp in components_of(root) {
        let supported = match comp.child("SupportedSystems") {
            Some(s) => s,
            None => continue,
        };
        for brand in supported.children_named("Brand") {
            let brand_name = brand.display().map(str::to_string);
            for model in brand.children_named("Model") {
                let system_id = match model.attr("systemID") {
                    Some(s) => s,
                    None => {
                        skip(report, incomplete("system", "?", "@systemID"));
                        continue;
                    }
                };
                let system_id_type = match model.attr("systemIDType") {
                    Some(t) => t,
                    None => {
                        skip(report, incomplete("system", system_id, "@systemIDType"));
                        continue;
                    }
                };
                if !seen.insert(system_id.to_string()) {
                    continue;
                }
                systems.push(SystemRecord {
                    system_id: system_id.to_string(),
                    system_id_type: system_id_type.to_string(),
                    brand: brand_name.clone(),
                    name: model.display().map(str::to_string),
                });
            }
        }
    }

    systems
}

fn parse_devices(root: &Element, report: &mut NormalizeReport) -> Vec<DeviceRecord> {
    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    for comp in components_of(root) {
        let supported = match comp.child("SupportedDevices") {
            Some(s) => s,
            None => continue,
        };
        for d in supported.children_named("Device") {
            let component_id = match d.attr("componentID") {
                Some(c) => c.to_string(),
                None => {
                    skip(report, incomplete("device", "?", "@componentID"));
                    continue;
                }
            };
            if !seen.insert(component_id.clone()) {
                continue;
            }
            let pci = d.child("PCIInfo");
            let pci_attr = |name: &str| pci.and_then(|p| attr_string(p, name));
            devices.push(DeviceRecord {
                embedded: attr_string(d, "embedded"),
                name: d.display().map(str::to_string),
                vendor_id: pci_attr("vendorID"),
                device_id: pci_attr("deviceID"),
                sub_vendor_id: pci_attr("subVendorID"),
                sub_device_id: pci_attr("subDeviceID"),
                component_id,
            });
        }
    }

    devices
}

/// Component path relative to the watched root.
fn repository_path(folder: &str, path: &str) -> String {
    let path = path.replace('\\', "/");
    let path = path.trim_start_matches('/');
    match folder.is_empty() {
        true => path.to_string(),
        false => format!("{}/{}", folder.trim_end_matches('/'), path),
    }
}

fn parse_component(comp: &Element, source: &CatalogSource) -> Result<ComponentRecord> {
    const E: &str = "component";
    let id = comp
        .attr("hashMD5")
        .or_else(|| comp.attr("packageID"))
        .unwrap_or("?")
        .to_string();

    let hash_md5 = required_attr(comp, "hashMD5", E, &id)?;
    let catalog_path = required_attr(comp, "path", E, &id)?;
    let name = required_display(comp, "Name", E, &id)?;
    let description = required_display(comp, "Description", E, &id)?;
    let component_type = required_value(comp, "ComponentType", E, &id)?;
    let category = required_value(comp, "Category", E, &id)?;
    let lu_category = required_value(comp, "LUCategory", E, &id)?;

    let extension_fields = comp.child("FMPWrappers").map(|w| {
        w.child("FMPWrapperInformation")
            .map(Element::to_json)
            .unwrap_or_else(|| w.to_json())
    });

    let mut extra: BTreeMap<String, Value> = BTreeMap::new();
    for (k, v) in &comp.attributes {
        if !COMPONENT_ATTRIBUTES.contains(&k.as_str()) {
            extra.insert(k.clone(), Value::String(v.clone()));
        }
    }
    for c in &comp.children {
        if !COMPONENT_CHILDREN.contains(&c.name.as_str()) && !extra.contains_key(&c.name) {
            extra.insert(c.name.clone(), c.to_json());
        }
    }

    Ok(ComponentRecord {
        name,
        component_type,
        description,
        category,
        lu_category,
        hash_md5,
        package_type: attr_string(comp, "packageType"),
        path: repository_path(&source.folder, &catalog_path),
        release_date: attr_string(comp, "releaseDate"),
        release_id: attr_string(comp, "releaseID"),
        vendor_version: attr_string(comp, "vendorVersion"),
        dell_version: attr_string(comp, "dellVersion"),
        size: comp.attr("size").and_then(|s| s.trim().parse::<i64>().ok()),
        xml_file_name: source.xml_file_name.clone(),
        package_id: attr_string(comp, "packageID"),
        date_time: attr_string(comp, "dateTime"),
        schema_version: attr_string(comp, "schemaVersion"),
        reboot_required: attr_bool(comp, "rebootRequired"),
        container_power_cycle_required: attr_bool(comp, "containerPowerCycleRequired"),
        revision_history: optional_display(comp, "RevisionHistory"),
        important_info: comp
            .child("ImportantInfo")
            .and_then(|i| i.attr("URL"))
            .map(str::to_string),
        extension_fields,
        supported_systems: supported_systems(comp.child("SupportedSystems")),
        extra,
    })
}

fn parse_bundle(bundle: &Element) -> Result<BundleRecord> {
    const E: &str = "bundle";
    let id = bundle
        .attr("bundleID")
        .or_else(|| bundle.attr("path"))
        .unwrap_or("?")
        .to_string();

    let name = required_display(bundle, "Name", E, &id)?;
    let contents = bundle
        .child("Contents")
        .ok_or_else(|| incomplete(E, &id, "Contents"))?;

    let display_or_value = |child: &str| {
        bundle
            .child(child)
            .and_then(|c| c.display().or_else(|| c.attr("value")))
            .map(str::to_string)
    };

    let target_oses = bundle
        .child("TargetOSes")
        .map(|t| {
            t.children_named("OperatingSystem")
                .filter_map(|os| os.display().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(BundleRecord {
        name,
        bundle_id: attr_string(bundle, "bundleID"),
        bundle_type: attr_string(bundle, "bundleType"),
        release_id: attr_string(bundle, "releaseID"),
        vendor_version: attr_string(bundle, "vendorVersion"),
        path: attr_string(bundle, "path"),
        description: optional_display(bundle, "Description"),
        component_type: display_or_value("ComponentType"),
        category: display_or_value("Category"),
        target_oses,
        target_systems: supported_systems(bundle.child("TargetSystems")),
        packages: contents
            .children_named("Package")
            .filter_map(|p| attr_string(p, "path"))
            .collect(),
    })
}

fn skip(report: &mut NormalizeReport, e: Error) {
    warn!(error = %e, "skipping catalog entry");
    report.skipped.push(e.to_string());
}

/// Normalizes a decoded catalog.
///
/// Fails only if the document is not a catalog at all; incomplete entities
/// are skipped and listed in the returned report.
pub fn normalize(root: &Element, source: &CatalogSource) -> Result<(NormalizedCatalog, NormalizeReport)> {
    if root.name != "Manifest" {
        return Err(Error::MalformedCatalog {
            path: source.catalog_path.clone(),
            message: format!("expected <Manifest> root element, found <{}>", root.name),
        });
    }

    let mut report = NormalizeReport::default();
    let systems = parse_systems(root, &mut report);
    let devices = parse_devices(root, &mut report);

    let mut components = Vec::new();
    for comp in components_of(root) {
        match parse_component(comp, source) {
            Ok(c) => components.push(c),
            Err(e) => skip(&mut report, e),
        }
    }

    let mut bundles = Vec::new();
    for b in root.children_named("SoftwareBundle") {
        match parse_bundle(b) {
            Ok(b) => bundles.push(b),
            Err(e) => skip(&mut report, e),
        }
    }

    Ok((
        NormalizedCatalog {
            systems,
            devices,
            components,
            bundles,
        },
        report,
    ))
}
