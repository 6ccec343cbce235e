//! Versioned schema for granules.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const GRANULE_TABLE: Table = Table {
    name: "granule",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("filename", &SqlType::Text, non_null = true),
        sqlite_column!("tileid", &SqlType::Text, non_null = true),
        sqlite_column!("size", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "checksum",
            &SqlType::Text,
            non_null = true,
            default_value = Some("''")
        ),
        sqlite_column!("beginposition", &SqlType::Integer, non_null = true),
        sqlite_column!("endposition", &SqlType::Integer, non_null = true),
        sqlite_column!("ingestiondate", &SqlType::Text, non_null = true),
        sqlite_column!("download_url", &SqlType::Text, non_null = true),
        sqlite_column!(
            "downloaded",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "in_progress",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("uploaded_granule_file_location", &SqlType::Text),
        sqlite_column!("download_started", &SqlType::Integer),
        sqlite_column!("download_finished", &SqlType::Integer),
        sqlite_column!(
            "download_retries",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "expired",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_granule_ingestiondate", "ingestiondate")],
    unique_constraints: &[],
};

const GRANULE_COUNT_TABLE: Table = Table {
    name: "granule_count",
    columns: &[
        sqlite_column!("date", &SqlType::Text, non_null = true),
        sqlite_column!("platform", &SqlType::Text, non_null = true),
        sqlite_column!("available_links", &SqlType::Integer, non_null = true),
        sqlite_column!("fetched_links", &SqlType::Integer, non_null = true),
        sqlite_column!("last_fetched_time", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["date", "platform"]],
};

const STATUS_TABLE: Table = Table {
    name: "status",
    columns: &[
        sqlite_column!("key_name", &SqlType::Text, is_primary_key = true),
        sqlite_column!("value", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

pub const GRANULE_DB_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[GRANULE_TABLE, GRANULE_COUNT_TABLE, STATUS_TABLE],
    migration: None,
}];
