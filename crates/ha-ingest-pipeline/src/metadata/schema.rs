//! Relational schema of the embedded metadata store.

diesel::table! {
    devices (device_id) {
        device_id -> Text,
        name -> Text,
        manufacturer -> Nullable<Text>,
        model -> Nullable<Text>,
        sw_version -> Nullable<Text>,
        area_id -> Nullable<Text>,
        entity_count -> Integer,
    }
}

diesel::table! {
    entities (entity_id) {
        entity_id -> Text,
        device_id -> Nullable<Text>,
        domain -> Text,
        platform -> Text,
        disabled -> Bool,
    }
}

diesel::allow_tables_to_appear_in_same_query!(devices, entities);
