// SPDX-License-Identifier: MIT

use std::collections::BTreeMap;

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One hardware model a component may support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRecord {
    #[serde(rename = "systemID")]
    pub system_id: String,
    #[serde(rename = "systemIDType")]
    pub system_id_type: String,
    pub brand: Option<String>,
    pub name: Option<String>,
}

/// The `{systemID, systemIDType, brand}` projection kept on components
/// and bundles for building the join table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SupportedSystem {
    #[serde(rename = "systemID")]
    pub system_id: String,
    #[serde(rename = "systemIDType")]
    pub system_id_type: String,
    pub brand: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    #[serde(rename = "componentID")]
    pub component_id: String,
    pub embedded: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "vendorID")]
    pub vendor_id: Option<String>,
    #[serde(rename = "deviceID")]
    pub device_id: Option<String>,
    #[serde(rename = "subVendorID")]
    pub sub_vendor_id: Option<String>,
    #[serde(rename = "subDeviceID")]
    pub sub_device_id: Option<String>,
}

/// One downloadable package.
///
/// `path` is relative to the watched root, `xml_file_name` names the
/// repository record the component belongs to. Vendor fields this crate
/// does not model are kept in `extra` so they survive into the
/// intermediate artifact.
#[derive(Derivative, Clone, PartialEq, Serialize, Deserialize)]
#[derivative(Debug)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRecord {
    pub name: String,
    pub component_type: String,
    pub description: String,
    pub category: String,
    #[serde(rename = "LUCategory")]
    pub lu_category: String,
    #[serde(rename = "hashMD5")]
    pub hash_md5: String,
    pub package_type: Option<String>,
    pub path: String,
    pub release_date: Option<String>,
    #[serde(rename = "releaseID")]
    pub release_id: Option<String>,
    pub vendor_version: Option<String>,
    pub dell_version: Option<String>,
    pub size: Option<i64>,
    pub xml_file_name: String,
    #[serde(rename = "packageID")]
    pub package_id: Option<String>,
    pub date_time: Option<String>,
    pub schema_version: Option<String>,
    pub reboot_required: Option<bool>,
    pub container_power_cycle_required: Option<bool>,
    pub revision_history: Option<String>,
    pub important_info: Option<String>,
    /// The `FMPWrappers` block, kept as an opaque payload.
    #[derivative(Debug = "ignore")]
    pub extension_fields: Option<Value>,
    pub supported_systems: Vec<SupportedSystem>,
    #[derivative(Debug = "ignore")]
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRecord {
    pub name: String,
    #[serde(rename = "bundleID")]
    pub bundle_id: Option<String>,
    pub bundle_type: Option<String>,
    #[serde(rename = "releaseID")]
    pub release_id: Option<String>,
    pub vendor_version: Option<String>,
    pub path: Option<String>,
    pub description: Option<String>,
    pub component_type: Option<String>,
    pub category: Option<String>,
    pub target_oses: Vec<String>,
    pub target_systems: Vec<SupportedSystem>,
    pub packages: Vec<String>,
}

/// The four flat record sets produced from one catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedCatalog {
    pub systems: Vec<SystemRecord>,
    pub devices: Vec<DeviceRecord>,
    pub components: Vec<ComponentRecord>,
    pub bundles: Vec<BundleRecord>,
}

/// Entities left out of a normalized catalog and why.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeReport {
    pub skipped: Vec<String>,
}

impl NormalizeReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// A value bound for one storage column. `None` binds NULL.
pub type ColumnValue = (String, Option<String>);

/// camelCase / PascalCase to snake_case: `hashMD5` -> `hash_md5`,
/// `LUCategory` -> `lu_category`.
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
            let prev_upper = i > 0 && chars[i - 1].is_uppercase();
            if i > 0 && (prev_lower || (prev_upper && next_lower)) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(*c);
        }
    }
    out
}

fn json_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl ComponentRecord {
    /// All fields of the record as `(column, text)` pairs, including the
    /// vendor fields in `extra`. The reconciler drops the columns storage
    /// does not have.
    pub fn column_values(&self) -> Vec<ColumnValue> {
        let text = |s: &str| Some(s.to_string());
        let opt = |s: &Option<String>| s.clone();
        let mut values: Vec<ColumnValue> = vec![
            ("name".to_string(), text(&self.name)),
            ("component_type".to_string(), text(&self.component_type)),
            ("description".to_string(), text(&self.description)),
            ("category".to_string(), text(&self.category)),
            ("lu_category".to_string(), text(&self.lu_category)),
            ("hash_md5".to_string(), text(&self.hash_md5)),
            ("package_type".to_string(), opt(&self.package_type)),
            ("path".to_string(), text(&self.path)),
            ("release_date".to_string(), opt(&self.release_date)),
            ("release_id".to_string(), opt(&self.release_id)),
            ("vendor_version".to_string(), opt(&self.vendor_version)),
            ("dell_version".to_string(), opt(&self.dell_version)),
            ("size".to_string(), self.size.map(|s| s.to_string())),
            ("xml_file_name".to_string(), text(&self.xml_file_name)),
            ("package_id".to_string(), opt(&self.package_id)),
            ("date_time".to_string(), opt(&self.date_time)),
            ("schema_version".to_string(), opt(&self.schema_version)),
            (
                "reboot_required".to_string(),
                self.reboot_required.map(|b| b.to_string()),
            ),
            (
                "container_power_cycle_required".to_string(),
                self.container_power_cycle_required.map(|b| b.to_string()),
            ),
            ("revision_history".to_string(), opt(&self.revision_history)),
            ("important_info".to_string(), opt(&self.important_info)),
            (
                "extension_fields".to_string(),
                self.extension_fields.as_ref().map(|v| v.to_string()),
            ),
        ];
        for (k, v) in &self.extra {
            values.push((snake_case(k), json_text(v)));
        }
        values
    }
}
