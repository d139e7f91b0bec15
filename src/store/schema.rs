//! Database schema for grabbify.db.

use crate::sql_column;
use crate::sqlite_persistence::{Column, ForeignKey, SqlType, Table, VersionedSchema};

const BATCH_FK: ForeignKey = ForeignKey {
    foreign_table: "batches",
    foreign_column: "id",
};

const BATCHES_TABLE_V1: Table = Table {
    name: "batches",
    columns: &[
        sql_column!("id", &SqlType::Text, is_primary_key = true),
        sql_column!("state", &SqlType::Text, non_null = true),
        sql_column!("total_tracks", &SqlType::Integer, default_value = Some("0")),
        sql_column!("completed_count", &SqlType::Integer, default_value = Some("0")),
        sql_column!("failed_count", &SqlType::Integer, default_value = Some("0")),
        sql_column!("error_code", &SqlType::Text),
        sql_column!("created_at", &SqlType::Integer, non_null = true),
        sql_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_batches_state", "state")],
    unique: &[],
};

const TRACKS_TABLE_V1: Table = Table {
    name: "tracks",
    columns: &[
        sql_column!("id", &SqlType::Text, is_primary_key = true),
        sql_column!(
            "batch_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&BATCH_FK)
        ),
        sql_column!("fingerprint", &SqlType::Text, non_null = true),
        sql_column!("title", &SqlType::Text, non_null = true),
        sql_column!("artist", &SqlType::Text, non_null = true),
        sql_column!("duration_seconds", &SqlType::Integer),
        sql_column!("thumbnail_url", &SqlType::Text),
        sql_column!("source_platform", &SqlType::Text, non_null = true),
        sql_column!("source_video_id", &SqlType::Text),
        sql_column!("match_confidence", &SqlType::Real),
        sql_column!("status", &SqlType::Text, non_null = true),
        sql_column!("retry_count", &SqlType::Integer, default_value = Some("0")),
        sql_column!("bytes_downloaded", &SqlType::Integer, default_value = Some("0")),
        sql_column!("total_bytes", &SqlType::Integer, default_value = Some("0")),
        sql_column!("output_file_path", &SqlType::Text),
        sql_column!("error_code", &SqlType::Text),
        sql_column!("created_at", &SqlType::Integer, non_null = true),
        sql_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_tracks_batch", "batch_id"),
        ("idx_tracks_status_updated", "status, updated_at"),
    ],
    unique: &["batch_id, fingerprint"],
};

pub const IMPORT_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[BATCHES_TABLE_V1, TRACKS_TABLE_V1],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = &IMPORT_VERSIONED_SCHEMAS[0];
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_tables_exist() {
        let conn = Connection::open_in_memory().unwrap();
        IMPORT_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"batches".to_string()));
        assert!(tables.contains(&"tracks".to_string()));
    }

    #[test]
    fn test_fingerprint_unique_per_batch() {
        let conn = Connection::open_in_memory().unwrap();
        IMPORT_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        conn.execute(
            "INSERT INTO batches (id, state, created_at, updated_at) VALUES ('b1', 'EXTRACTING', 1, 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO tracks (id, batch_id, fingerprint, title, artist, source_platform, status, created_at, updated_at)
             VALUES ('t1', 'b1', 'fp1', 'a', 'b', 'video', 'EXTRACTED', 1, 1)",
            [],
        )
        .unwrap();

        // Same fingerprint in the same batch is rejected.
        let dup = conn.execute(
            "INSERT INTO tracks (id, batch_id, fingerprint, title, artist, source_platform, status, created_at, updated_at)
             VALUES ('t2', 'b1', 'fp1', 'a', 'b', 'video', 'EXTRACTED', 1, 1)",
            [],
        );
        assert!(dup.is_err());

        // Same fingerprint in a different batch is fine.
        conn.execute(
            "INSERT INTO batches (id, state, created_at, updated_at) VALUES ('b2', 'EXTRACTING', 1, 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO tracks (id, batch_id, fingerprint, title, artist, source_platform, status, created_at, updated_at)
             VALUES ('t3', 'b2', 'fp1', 'a', 'b', 'video', 'EXTRACTED', 1, 1)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        IMPORT_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(indexes.contains(&"idx_batches_state".to_string()));
        assert!(indexes.contains(&"idx_tracks_batch".to_string()));
        assert!(indexes.contains(&"idx_tracks_status_updated".to_string()));
    }
}
