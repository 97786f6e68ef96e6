// SPDX-License-Identifier: MIT

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use diesel::sql_types::{Nullable, Text};
use regex::Regex;

use crate::catalog::records::SystemRecord;
use crate::db::models::{
    ColumnInfo, ComponentSummary, IdRow, NewComponentSystem, NewSystem, NewXmlFile, System,
    XmlFile,
};
use crate::debug::*;
use crate::store::ComponentRow;

/// Asks storage which columns the `components` table has.
///
/// The result maps column name to the PostgreSQL type name and is used to
/// project records before insertion instead of guessing from errors.
pub fn get_component_columns(
    c: &mut PgConnection,
) -> Result<BTreeMap<String, String>, diesel::result::Error> {
    let query = diesel::sql_query(
        "SELECT column_name::text AS column_name, udt_name::text AS udt_name \
         FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name = 'components' \
         ORDER BY ordinal_position",
    );
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    Ok(query
        .load::<ColumnInfo>(c)?
        .into_iter()
        .map(|ci| (ci.column_name, ci.udt_name))
        .collect())
}

/// Inserts a system. Existing systems are left alone.
pub fn insert_system(c: &mut PgConnection, s: &SystemRecord) -> Result<usize, diesel::result::Error> {
    use crate::db::schema::systems;

    let insert = diesel::insert_into(systems::table)
        .values(NewSystem {
            system_id: &s.system_id,
            system_id_type: &s.system_id_type,
            brand: s.brand.as_deref(),
            name: s.name.as_deref(),
        })
        .on_conflict(systems::system_id)
        .do_nothing();
    let debug = diesel::debug_query::<Pg, _>(&insert);
    print_step(debug.to_string());
    insert.execute(c)
}

fn type_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^_?[a-z][a-z0-9_]*$").unwrap_or_else(|e| panic!("invalid built-in regex: {}", e))
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Type to cast a text bind to. Unknown or odd looking types fall back to
/// text and let PostgreSQL complain.
fn cast_type<'a>(types: &'a BTreeMap<String, String>, column: &str) -> &'a str {
    match types.get(column) {
        Some(t) if type_name_pattern().is_match(t) => t.as_str(),
        _ => "text",
    }
}

/// Builds the component insert for a projected row.
pub fn component_insert_sql(row: &ComponentRow, types: &BTreeMap<String, String>) -> String {
    let names = row
        .columns
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<String>>()
        .join(", ");
    let values = row
        .columns
        .iter()
        .enumerate()
        .map(|(i, (name, _))| format!("CAST(${} AS {})", i + 1, cast_type(types, name)))
        .collect::<Vec<String>>()
        .join(", ");
    format!(
        "INSERT INTO components ({}) VALUES ({}) ON CONFLICT (hash_md5) DO NOTHING RETURNING id",
        names, values
    )
}

/// Inserts a component row. Returns the new id or `None` if a component
/// with the same hash already exists.
///
/// The column set is only known at runtime, so every value is bound as
/// text and cast to the column's type.
pub fn insert_component(
    c: &mut PgConnection,
    row: &ComponentRow,
    types: &BTreeMap<String, String>,
) -> Result<Option<i64>, diesel::result::Error> {
    let sql = component_insert_sql(row, types);
    print_step(format!("{} -- {} binds", sql, row.columns.len()));

    let mut query = diesel::sql_query(sql).into_boxed::<Pg>();
    for (_, value) in &row.columns {
        query = query.bind::<Nullable<Text>, _>(value.clone());
    }
    query
        .get_result::<IdRow>(c)
        .optional()
        .map(|r| r.map(|r| r.id))
}

pub fn find_component_id(c: &mut PgConnection, hash: &str) -> Result<i64, diesel::result::Error> {
    use crate::db::schema::components::dsl::*;
    let query = components.filter(hash_md5.eq(hash)).select(id);
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.first::<i64>(c)
}

/// Links a component to systems. Existing links are kept.
pub fn link_component(
    c: &mut PgConnection,
    component: i64,
    system_ids: &BTreeSet<String>,
) -> Result<usize, diesel::result::Error> {
    use crate::db::schema::component_systems;

    if system_ids.is_empty() {
        return Ok(0);
    }
    let rows: Vec<NewComponentSystem> = system_ids
        .iter()
        .map(|s| NewComponentSystem {
            component_id: component,
            system_id: s,
        })
        .collect();
    let insert = diesel::insert_into(component_systems::table)
        .values(&rows)
        .on_conflict_do_nothing();
    let debug = diesel::debug_query::<Pg, _>(&insert);
    print_step(debug.to_string());
    insert.execute(c)
}

pub fn insert_repository(
    c: &mut PgConnection,
    name: &str,
    path: &str,
) -> Result<usize, diesel::result::Error> {
    use crate::db::schema::xml_files;

    let insert = diesel::insert_into(xml_files::table)
        .values(NewXmlFile {
            file_name: name,
            file_path: path,
        })
        .on_conflict(xml_files::file_name)
        .do_nothing();
    let debug = diesel::debug_query::<Pg, _>(&insert);
    print_step(debug.to_string());
    insert.execute(c)
}

pub fn delete_components_for(c: &mut PgConnection, repo: &str) -> Result<usize, diesel::result::Error> {
    use crate::db::schema::components::dsl::*;
    let query = diesel::delete(components.filter(xml_file_name.eq(repo)));
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.execute(c)
}

/// Deletes the components of one repository that are no longer part of
/// its catalog.
pub fn delete_stale_components(
    c: &mut PgConnection,
    repo: &str,
    keep: &BTreeSet<String>,
) -> Result<usize, diesel::result::Error> {
    use crate::db::schema::components::dsl::*;
    let keep: Vec<&str> = keep.iter().map(String::as_str).collect();
    let query = diesel::delete(
        components
            .filter(xml_file_name.eq(repo))
            .filter(hash_md5.ne_all(keep)),
    );
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.execute(c)
}

/// Deletes every system link of the components with one of `hashes`,
/// whichever repository owns the row.
pub fn unlink_components(c: &mut PgConnection, hashes: &BTreeSet<String>) -> Result<usize, diesel::result::Error> {
    use crate::db::schema::{component_systems, components};
    if hashes.is_empty() {
        return Ok(0);
    }
    let hashes: Vec<&str> = hashes.iter().map(String::as_str).collect();
    let ids = components::table
        .filter(components::hash_md5.eq_any(hashes))
        .select(components::id);
    let query = diesel::delete(component_systems::table.filter(component_systems::component_id.eq_any(ids)));
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.execute(c)
}

/// Deletes systems without any component link.
pub fn delete_unreferenced_systems(c: &mut PgConnection) -> Result<usize, diesel::result::Error> {
    let query = diesel::sql_query(
        "DELETE FROM systems s WHERE NOT EXISTS \
         (SELECT 1 FROM component_systems cs WHERE cs.system_id = s.system_id)",
    );
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.execute(c)
}

pub fn delete_repository(c: &mut PgConnection, repo: &str) -> Result<usize, diesel::result::Error> {
    use crate::db::schema::xml_files::dsl::*;
    let query = diesel::delete(xml_files.filter(file_name.eq(repo)));
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.execute(c)
}

/// Removes every synchronized row, links first.
pub fn wipe(c: &mut PgConnection) -> Result<(), diesel::result::Error> {
    use crate::db::schema::{component_systems, components, systems, xml_files};

    print_step("DELETE FROM component_systems".to_string());
    diesel::delete(component_systems::table).execute(c)?;
    print_step("DELETE FROM components".to_string());
    diesel::delete(components::table).execute(c)?;
    print_step("DELETE FROM systems".to_string());
    diesel::delete(systems::table).execute(c)?;
    print_step("DELETE FROM xml_files".to_string());
    diesel::delete(xml_files::table).execute(c)?;
    Ok(())
}

/// Retrieve the list of known repositories from the database
pub fn get_repositories(c: &mut PgConnection) -> Result<Vec<XmlFile>, diesel::result::Error> {
    use crate::db::schema::xml_files::dsl::*;
    let query = xml_files.select(XmlFile::as_select()).order(file_name);
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.load::<XmlFile>(c)
}

pub fn count_components(c: &mut PgConnection, repo: &str) -> Result<i64, diesel::result::Error> {
    use crate::db::schema::components::dsl::*;
    let query = components.filter(xml_file_name.eq(repo)).count();
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.get_result::<i64>(c)
}

pub fn get_systems(c: &mut PgConnection) -> Result<Vec<System>, diesel::result::Error> {
    use crate::db::schema::systems::dsl::*;
    let query = systems.select(System::as_select()).order(system_id);
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.load::<System>(c)
}

/// Components linked to the given system.
pub fn get_components_for_system(
    c: &mut PgConnection,
    sid: &str,
) -> Result<Vec<ComponentSummary>, diesel::result::Error> {
    use crate::db::schema::{component_systems, components};
    let query = components::table
        .inner_join(component_systems::table)
        .filter(component_systems::system_id.eq(sid))
        .select(ComponentSummary::as_select())
        .order(components::name);
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.load::<ComponentSummary>(c)
}

pub fn get_component(
    c: &mut PgConnection,
    component: i64,
) -> Result<Option<ComponentSummary>, diesel::result::Error> {
    use crate::db::schema::components::dsl::*;
    let query = components
        .filter(id.eq(component))
        .select(ComponentSummary::as_select());
    let debug = diesel::debug_query::<Pg, _>(&query);
    print_step(debug.to_string());
    query.first::<ComponentSummary>(c).optional()
}
