// SPDX-License-Identifier: MIT

use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;

use crate::debug::print_step;

/// Tables owned by the synchronizer. Every statement is idempotent.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS xml_files (
    id serial PRIMARY KEY,
    file_name text NOT NULL UNIQUE,
    file_path text NOT NULL,
    created_at timestamp NOT NULL DEFAULT now(),
    updated_at timestamp NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS systems (
    system_id text PRIMARY KEY,
    system_id_type text,
    brand text,
    name text,
    created_at timestamp NOT NULL DEFAULT now(),
    updated_at timestamp NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS components (
    id bigserial PRIMARY KEY,
    name text,
    component_type text,
    description text,
    lu_category text,
    category text,
    revision_history text,
    important_info text,
    container_power_cycle_required boolean,
    date_time text,
    dell_version text,
    hash_md5 text NOT NULL UNIQUE,
    package_id text,
    package_type text,
    path text,
    xml_file_name text NOT NULL REFERENCES xml_files (file_name) ON DELETE CASCADE,
    reboot_required boolean,
    release_date text,
    release_id text,
    schema_version text,
    size bigint,
    vendor_version text,
    extension_fields jsonb,
    created_at timestamp NOT NULL DEFAULT now(),
    updated_at timestamp NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS components_xml_file_name_idx ON components (xml_file_name);

CREATE TABLE IF NOT EXISTS component_systems (
    component_id bigint NOT NULL REFERENCES components (id) ON DELETE CASCADE,
    system_id text NOT NULL REFERENCES systems (system_id) ON DELETE CASCADE,
    created_at timestamp NOT NULL DEFAULT now(),
    PRIMARY KEY (component_id, system_id)
);

CREATE INDEX IF NOT EXISTS component_systems_system_id_idx ON component_systems (system_id);
"#;

/// Creates the tables if they do not exist yet.
pub fn ensure_schema(c: &mut PgConnection) -> Result<(), diesel::result::Error> {
    print_step("Ensuring database schema".to_string());
    c.batch_execute(SCHEMA)
}
