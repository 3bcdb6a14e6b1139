//! Database schema definitions using sea-query.

use sea_query::Iden;

/// Blobs table schema.
#[derive(Iden)]
pub enum Blobs {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "data"]
    Data,
    #[iden = "created_at"]
    CreatedAt,
}

/// SQL for creating the blobs table.
pub const CREATE_BLOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS blobs (
    name TEXT NOT NULL PRIMARY KEY,
    data BLOB NOT NULL,
    created_at TEXT NOT NULL
);
"#;
