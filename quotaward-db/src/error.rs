use thiserror::Error;
use tokio_rusqlite::rusqlite;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("failed to encode or decode column `{column}`: {source}")]
    Codec {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("role {role_id} is already bound to device {device_id}")]
    RoleConflict { role_id: i64, device_id: String },
}

pub type Result<T> = std::result::Result<T, DbError>;
