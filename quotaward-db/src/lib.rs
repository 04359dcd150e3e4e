mod error;
mod models;

pub use error::{DbError, Result};
pub use models::{BanCategory, IdentityRow, PlayerRow, ServerSettingsRow, StoredPlaytime};

use models::{decode_history, decode_playtime, encode_history, encode_playtime};
use std::path::Path;
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, params};
use tracing::{debug, info};

/// Database wrapper for all quota and ban bookkeeping.
#[derive(Clone)]
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create a database at the given path.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = Connection::open(path).await.map_err(DbError::Sqlite)?;
    let db = Self { conn };
    db.initialize().await?;
    Ok(db)
  }

  /// Create an in-memory database (useful for testing).
  pub async fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .await
      .map_err(DbError::Sqlite)?;
    let db = Self { conn };
    db.initialize().await?;
    Ok(db)
  }

  /// Initialize the database schema.
  async fn initialize(&self) -> Result<()> {
    self.conn
            .call(|conn| -> rusqlite::Result<()> {
                // Enable WAL mode for better concurrent read/write performance
                conn.pragma_update(None, "journal_mode", "WAL")?;

                conn.execute_batch(
                    r#"
                    -- One table per ban dimension
                    CREATE TABLE IF NOT EXISTS ban_ip (
                        ip TEXT PRIMARY KEY,
                        banned_at INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS ban_device_id (
                        device_id TEXT PRIMARY KEY,
                        banned_at INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS ban_real_device_id (
                        real_device_id TEXT PRIMARY KEY,
                        banned_at INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS ban_device_info (
                        device_info TEXT PRIMARY KEY,
                        banned_at INTEGER NOT NULL
                    );

                    -- Single settings row, pinned to id 1
                    CREATE TABLE IF NOT EXISTS server_settings (
                        id INTEGER PRIMARY KEY CHECK (id = 1),
                        graphics_options TEXT NOT NULL,
                        misc_options TEXT NOT NULL,
                        server_ip TEXT,
                        server_port TEXT,
                        server_over_day_timestamp INTEGER NOT NULL DEFAULT 0,
                        playtime_settings TEXT NOT NULL DEFAULT '',
                        created_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL
                    );

                    -- Player accounts; the quota engine only touches playtime_data
                    CREATE TABLE IF NOT EXISTS player_data (
                        device_id TEXT PRIMARY KEY,
                        role_id INTEGER NOT NULL,
                        playtime_data TEXT NOT NULL DEFAULT ''
                    );

                    -- Identity history per device
                    CREATE TABLE IF NOT EXISTS player_info (
                        device_id TEXT PRIMARY KEY,
                        role_id INTEGER NOT NULL UNIQUE,
                        ips TEXT NOT NULL DEFAULT '[]',
                        real_device_ids TEXT NOT NULL DEFAULT '[]',
                        device_infos TEXT NOT NULL DEFAULT '[]',
                        created_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL
                    );
                    "#,
                )?;
                Ok(())
            })
            .await?;

    info!("database initialized");
    Ok(())
  }

  // ========================================================================
  // Bans
  // ========================================================================

  /// Add a ban. Banning an already banned value refreshes its timestamp.
  pub async fn ban(&self, category: BanCategory, value: String, now: i64) -> Result<()> {
    let value_log = value.clone();

    self
      .conn
      .call(move |conn| -> rusqlite::Result<()> {
        let sql = format!(
          "INSERT OR REPLACE INTO {} ({}, banned_at) VALUES (?1, ?2)",
          category.table(),
          category.column()
        );
        conn.prepare_cached(&sql)?.execute(params![&value, now])?;
        Ok(())
      })
      .await?;

    debug!(category = category.as_str(), value = %value_log, "added ban");
    Ok(())
  }

  /// Lift a ban. Returns whether anything was removed.
  pub async fn unban(&self, category: BanCategory, value: String) -> Result<bool> {
    let removed = self
      .conn
      .call(move |conn| -> rusqlite::Result<usize> {
        let sql = format!(
          "DELETE FROM {} WHERE {} = ?1",
          category.table(),
          category.column()
        );
        conn.prepare_cached(&sql)?.execute(params![&value])
      })
      .await?;

    debug!(category = category.as_str(), removed, "lifted ban");
    Ok(removed > 0)
  }

  /// Full scan of one ban table.
  pub async fn list_bans(&self, category: BanCategory) -> Result<Vec<String>> {
    let values = self
      .conn
      .call(move |conn| -> rusqlite::Result<Vec<String>> {
        let sql = format!("SELECT {} FROM {}", category.column(), category.table());
        let mut stmt = conn.prepare_cached(&sql)?;

        let values = stmt
          .query_map([], |row| row.get(0))?
          .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(values)
      })
      .await?;

    Ok(values)
  }

  // ========================================================================
  // Server Settings
  // ========================================================================

  /// Get the settings row, if one was ever written.
  pub async fn get_server_settings(&self) -> Result<Option<ServerSettingsRow>> {
    let settings = self
      .conn
      .call(|conn| -> rusqlite::Result<Option<ServerSettingsRow>> {
        conn
          .prepare_cached(
            r#"
            SELECT graphics_options, misc_options, server_ip, server_port,
                   server_over_day_timestamp, playtime_settings, created_at, updated_at
            FROM server_settings WHERE id = 1
            "#,
          )?
          .query_row([], |row| {
            Ok(ServerSettingsRow {
              graphics_options: row.get(0)?,
              misc_options: row.get(1)?,
              server_ip: row.get(2)?,
              server_port: row.get(3)?,
              server_over_day_timestamp: row.get(4)?,
              playtime_settings: row.get(5)?,
              created_at: row.get(6)?,
              updated_at: row.get(7)?,
            })
          })
          .optional()
      })
      .await?;

    Ok(settings)
  }

  /// Write the settings row unless one already exists.
  /// Returns whether this call created it.
  pub async fn create_server_settings(&self, settings: ServerSettingsRow) -> Result<bool> {
    let created = self
      .conn
      .call(move |conn| -> rusqlite::Result<usize> {
        conn
          .prepare_cached(
            r#"
            INSERT OR IGNORE INTO server_settings
              (id, graphics_options, misc_options, server_ip, server_port,
               server_over_day_timestamp, playtime_settings, created_at, updated_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
          )?
          .execute(params![
            &settings.graphics_options,
            &settings.misc_options,
            &settings.server_ip,
            &settings.server_port,
            settings.server_over_day_timestamp,
            &settings.playtime_settings,
            settings.created_at,
            settings.updated_at,
          ])
      })
      .await?;

    if created > 0 {
      info!("created default server settings");
    }
    Ok(created > 0)
  }

  /// Replace the playtime policy JSON of the settings row.
  pub async fn update_playtime_settings(&self, playtime_settings: String, now: i64) -> Result<bool> {
    let updated = self
      .conn
      .call(move |conn| -> rusqlite::Result<usize> {
        conn
          .prepare_cached(
            "UPDATE server_settings SET playtime_settings = ?1, updated_at = ?2 WHERE id = 1",
          )?
          .execute(params![&playtime_settings, now])
      })
      .await?;

    Ok(updated > 0)
  }

  // ========================================================================
  // Players
  // ========================================================================

  /// Create a player row with an empty playtime blob.
  pub async fn create_player(&self, device_id: String, role_id: i64) -> Result<()> {
    let device_id_log = device_id.clone();

    self
      .conn
      .call(move |conn| -> rusqlite::Result<()> {
        conn
          .prepare_cached("INSERT INTO player_data (device_id, role_id) VALUES (?1, ?2)")?
          .execute(params![&device_id, role_id])?;
        Ok(())
      })
      .await?;

    debug!(device_id = %device_id_log, role_id, "created player");
    Ok(())
  }

  /// Get a player by device id.
  pub async fn get_player(&self, device_id: String) -> Result<Option<PlayerRow>> {
    let row = self
      .conn
      .call(move |conn| -> rusqlite::Result<Option<(String, i64, String)>> {
        conn
          .prepare_cached(
            "SELECT device_id, role_id, playtime_data FROM player_data WHERE device_id = ?1",
          )?
          .query_row(params![&device_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
          })
          .optional()
      })
      .await?;

    Ok(row.map(|(device_id, role_id, raw)| {
      let playtime = decode_playtime(&device_id, &raw);
      PlayerRow {
        device_id,
        role_id,
        playtime,
      }
    }))
  }

  /// Full scan of all players' quota sub-fields.
  pub async fn list_players(&self) -> Result<Vec<PlayerRow>> {
    let rows = self
      .conn
      .call(|conn| -> rusqlite::Result<Vec<(String, i64, String)>> {
        let mut stmt =
          conn.prepare_cached("SELECT device_id, role_id, playtime_data FROM player_data")?;

        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
          .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
      })
      .await?;

    Ok(
      rows
        .into_iter()
        .map(|(device_id, role_id, raw)| {
          let playtime = decode_playtime(&device_id, &raw);
          PlayerRow {
            device_id,
            role_id,
            playtime,
          }
        })
        .collect(),
    )
  }

  /// Point update of a player's playtime blob.
  /// Returns whether a player row was touched.
  pub async fn update_playtime(&self, device_id: String, playtime: StoredPlaytime) -> Result<bool> {
    let blob = encode_playtime(&playtime)?;

    let updated = self
      .conn
      .call(move |conn| -> rusqlite::Result<usize> {
        conn
          .prepare_cached("UPDATE player_data SET playtime_data = ?1 WHERE device_id = ?2")?
          .execute(params![&blob, &device_id])
      })
      .await?;

    Ok(updated > 0)
  }

  // ========================================================================
  // Identity History
  // ========================================================================

  /// Full scan of the identity table.
  pub async fn list_identities(&self) -> Result<Vec<IdentityRow>> {
    let rows = self
      .conn
      .call(|conn| -> rusqlite::Result<Vec<(String, i64, String, String, String)>> {
        let mut stmt = conn.prepare_cached(
          "SELECT device_id, role_id, ips, real_device_ids, device_infos FROM player_info",
        )?;

        let rows = stmt
          .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
          })?
          .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
      })
      .await?;

    Ok(rows.into_iter().map(identity_from_columns).collect())
  }

  /// Get the identity history of one device.
  pub async fn get_identity(&self, device_id: String) -> Result<Option<IdentityRow>> {
    let row = self
      .conn
      .call(move |conn| -> rusqlite::Result<Option<(String, i64, String, String, String)>> {
        conn
          .prepare_cached(
            "SELECT device_id, role_id, ips, real_device_ids, device_infos FROM player_info WHERE device_id = ?1",
          )?
          .query_row(params![&device_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
          })
          .optional()
      })
      .await?;

    Ok(row.map(identity_from_columns))
  }

  /// Create the identity history of a device.
  /// Fails with `RoleConflict` if the role is already bound to another device.
  pub async fn create_identity(&self, identity: IdentityRow, now: i64) -> Result<()> {
    let ips = encode_history("ips", &identity.ips)?;
    let real_device_ids = encode_history("real_device_ids", &identity.real_device_ids)?;
    let device_infos = encode_history("device_infos", &identity.device_infos)?;
    let device_id = identity.device_id;
    let role_id = identity.role_id;
    let device_id_log = device_id.clone();

    self.conn
            .call(move |conn| -> rusqlite::Result<Result<()>> {
                let tx = conn.transaction()?;

                // Check if the role is already bound to a device
                let bound: Option<String> = tx
                    .prepare_cached("SELECT device_id FROM player_info WHERE role_id = ?1")?
                    .query_row(params![role_id], |row| row.get(0))
                    .optional()?;

                if let Some(bound) = bound {
                    return Ok(Err(DbError::RoleConflict { role_id, device_id: bound }));
                }

                tx.prepare_cached(
                    r#"
                    INSERT INTO player_info
                      (device_id, role_id, ips, real_device_ids, device_infos, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                    "#,
                )?
                    .execute(params![&device_id, role_id, &ips, &real_device_ids, &device_infos, now])?;

                tx.commit()?;
                Ok(Ok(()))
            })
            .await??;

    debug!(device_id = %device_id_log, role_id, "created identity");
    Ok(())
  }

  /// Overwrite the histories of an existing identity.
  pub async fn update_identity(&self, identity: IdentityRow, now: i64) -> Result<bool> {
    let ips = encode_history("ips", &identity.ips)?;
    let real_device_ids = encode_history("real_device_ids", &identity.real_device_ids)?;
    let device_infos = encode_history("device_infos", &identity.device_infos)?;
    let device_id = identity.device_id;

    let updated = self
      .conn
      .call(move |conn| -> rusqlite::Result<usize> {
        conn
          .prepare_cached(
            r#"
            UPDATE player_info
            SET ips = ?1, real_device_ids = ?2, device_infos = ?3, updated_at = ?4
            WHERE device_id = ?5
            "#,
          )?
          .execute(params![&ips, &real_device_ids, &device_infos, now, &device_id])
      })
      .await?;

    Ok(updated > 0)
  }
}

fn identity_from_columns(
  (device_id, role_id, ips, real_device_ids, device_infos): (String, i64, String, String, String),
) -> IdentityRow {
  IdentityRow {
    device_id,
    role_id,
    ips: decode_history(&ips),
    real_device_ids: decode_history(&real_device_ids),
    device_infos: decode_history(&device_infos),
  }
}
