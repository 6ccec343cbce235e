//! Versioned schema for queue.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const QUEUE_MESSAGE_TABLE: Table = Table {
    name: "queue_message",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("body", &SqlType::Text, non_null = true),
        sqlite_column!("visible_at", &SqlType::Integer, non_null = true),
        sqlite_column!("receipt", &SqlType::Text),
        sqlite_column!(
            "receive_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_queue_message_visible_at", "visible_at")],
    unique_constraints: &[],
};

pub const QUEUE_DB_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[QUEUE_MESSAGE_TABLE],
    migration: None,
}];
