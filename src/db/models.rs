// SPDX-License-Identifier: MIT

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};

use crate::db::schema::{component_systems, components, systems, xml_files};
use crate::store::{RepositoryRecord, StoredComponent, StoredSystem};

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = xml_files)]
pub struct XmlFile {
    pub id: i32,
    pub file_name: String,
    pub file_path: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<XmlFile> for RepositoryRecord {
    fn from(x: XmlFile) -> Self {
        RepositoryRecord {
            file_name: x.file_name,
            file_path: x.file_path,
            discovered_at: x.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = xml_files)]
pub struct NewXmlFile<'a> {
    pub file_name: &'a str,
    pub file_path: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = systems)]
pub struct System {
    pub system_id: String,
    pub system_id_type: Option<String>,
    pub brand: Option<String>,
    pub name: Option<String>,
}

impl From<System> for StoredSystem {
    fn from(s: System) -> Self {
        StoredSystem {
            system_id: s.system_id,
            system_id_type: s.system_id_type,
            brand: s.brand,
            name: s.name,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = systems)]
pub struct NewSystem<'a> {
    pub system_id: &'a str,
    pub system_id_type: &'a str,
    pub brand: Option<&'a str>,
    pub name: Option<&'a str>,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = components)]
pub struct ComponentSummary {
    pub id: i64,
    pub name: Option<String>,
    pub category: Option<String>,
    pub hash_md5: String,
    pub path: Option<String>,
    pub vendor_version: Option<String>,
    pub xml_file_name: String,
}

impl From<ComponentSummary> for StoredComponent {
    fn from(c: ComponentSummary) -> Self {
        StoredComponent {
            id: c.id,
            name: c.name,
            category: c.category,
            hash_md5: c.hash_md5,
            path: c.path,
            vendor_version: c.vendor_version,
            xml_file_name: c.xml_file_name,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = component_systems)]
pub struct NewComponentSystem<'a> {
    pub component_id: i64,
    pub system_id: &'a str,
}

/// One row of the `information_schema.columns` capability query.
#[derive(QueryableByName, Debug)]
pub struct ColumnInfo {
    #[diesel(sql_type = Text)]
    pub column_name: String,
    #[diesel(sql_type = Text)]
    pub udt_name: String,
}

#[derive(QueryableByName, Debug)]
pub struct IdRow {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
}
