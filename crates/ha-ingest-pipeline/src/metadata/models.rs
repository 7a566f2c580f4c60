//! Database models for devices and entities.

use diesel::prelude::*;

use ha_ingest_core::events::{DeviceRecord, EntityRecord};

use super::schema::{devices, entities};

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = devices)]
pub struct DeviceRow {
    pub device_id: String,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub area_id: Option<String>,
    /// Materialized count, maintained by the synchronizer after entity
    /// upserts; preserved across device upserts.
    pub entity_count: i32,
}

impl From<&DeviceRecord> for DeviceRow {
    fn from(record: &DeviceRecord) -> Self {
        DeviceRow {
            device_id: record.device_id.clone(),
            name: record.name.clone(),
            manufacturer: record.manufacturer.clone(),
            model: record.model.clone(),
            sw_version: record.sw_version.clone(),
            area_id: record.area_id.clone(),
            entity_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = entities)]
pub struct EntityRow {
    pub entity_id: String,
    pub device_id: Option<String>,
    pub domain: String,
    pub platform: String,
    pub disabled: bool,
}

impl From<&EntityRecord> for EntityRow {
    fn from(record: &EntityRecord) -> Self {
        EntityRow {
            entity_id: record.entity_id.clone(),
            device_id: record.device_id.clone(),
            domain: record.domain.clone(),
            platform: record.platform.clone(),
            disabled: record.disabled,
        }
    }
}
