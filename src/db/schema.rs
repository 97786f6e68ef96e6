// SPDX-License-Identifier: MIT

diesel::table! {
    xml_files (id) {
        id -> Integer,
        file_name -> Text,
        file_path -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    systems (system_id) {
        system_id -> Text,
        system_id_type -> Nullable<Text>,
        brand -> Nullable<Text>,
        name -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    components (id) {
        id -> BigInt,
        name -> Nullable<Text>,
        component_type -> Nullable<Text>,
        description -> Nullable<Text>,
        lu_category -> Nullable<Text>,
        category -> Nullable<Text>,
        revision_history -> Nullable<Text>,
        important_info -> Nullable<Text>,
        container_power_cycle_required -> Nullable<Bool>,
        date_time -> Nullable<Text>,
        dell_version -> Nullable<Text>,
        hash_md5 -> Text,
        package_id -> Nullable<Text>,
        package_type -> Nullable<Text>,
        path -> Nullable<Text>,
        xml_file_name -> Text,
        reboot_required -> Nullable<Bool>,
        release_date -> Nullable<Text>,
        release_id -> Nullable<Text>,
        schema_version -> Nullable<Text>,
        size -> Nullable<BigInt>,
        vendor_version -> Nullable<Text>,
        extension_fields -> Nullable<Jsonb>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    component_systems (component_id, system_id) {
        component_id -> BigInt,
        system_id -> Text,
        created_at -> Timestamp,
    }
}

diesel::joinable!(component_systems -> components (component_id));
diesel::joinable!(component_systems -> systems (system_id));

diesel::allow_tables_to_appear_in_same_query!(component_systems, components, systems, xml_files);
