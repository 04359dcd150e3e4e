//! Persistence seam consumed by the engine.

use async_trait::async_trait;
use quotaward_db::{
    BanCategory, Database, DbError, IdentityRow, PlayerRow, ServerSettingsRow, StoredPlaytime,
};

/// Point-query and point-update store keyed by device or role identifier.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn load_bans(&self, category: BanCategory) -> Result<Vec<String>, DbError>;

    async fn load_settings(&self) -> Result<Option<ServerSettingsRow>, DbError>;

    /// Insert the settings row unless one exists. Returns whether it was written.
    async fn create_settings(&self, row: ServerSettingsRow) -> Result<bool, DbError>;

    async fn save_playtime_settings(&self, json: String, now: i64) -> Result<bool, DbError>;

    async fn load_players(&self) -> Result<Vec<PlayerRow>, DbError>;

    async fn load_player(&self, device_id: &str) -> Result<Option<PlayerRow>, DbError>;

    /// Returns `false` when no player row exists for `device_id`.
    async fn save_playtime(
        &self,
        device_id: &str,
        playtime: StoredPlaytime,
    ) -> Result<bool, DbError>;

    async fn load_identities(&self) -> Result<Vec<IdentityRow>, DbError>;

    async fn load_identity(&self, device_id: &str) -> Result<Option<IdentityRow>, DbError>;

    async fn create_identity(&self, row: IdentityRow, now: i64) -> Result<(), DbError>;

    async fn save_identity(&self, row: IdentityRow, now: i64) -> Result<bool, DbError>;
}

#[async_trait]
impl Store for Database {
    async fn load_bans(&self, category: BanCategory) -> Result<Vec<String>, DbError> {
        self.list_bans(category).await
    }

    async fn load_settings(&self) -> Result<Option<ServerSettingsRow>, DbError> {
        self.get_server_settings().await
    }

    async fn create_settings(&self, row: ServerSettingsRow) -> Result<bool, DbError> {
        self.create_server_settings(row).await
    }

    async fn save_playtime_settings(&self, json: String, now: i64) -> Result<bool, DbError> {
        self.update_playtime_settings(json, now).await
    }

    async fn load_players(&self) -> Result<Vec<PlayerRow>, DbError> {
        self.list_players().await
    }

    async fn load_player(&self, device_id: &str) -> Result<Option<PlayerRow>, DbError> {
        self.get_player(device_id.to_string()).await
    }

    async fn save_playtime(
        &self,
        device_id: &str,
        playtime: StoredPlaytime,
    ) -> Result<bool, DbError> {
        self.update_playtime(device_id.to_string(), playtime).await
    }

    async fn load_identities(&self) -> Result<Vec<IdentityRow>, DbError> {
        self.list_identities().await
    }

    async fn load_identity(&self, device_id: &str) -> Result<Option<IdentityRow>, DbError> {
        self.get_identity(device_id.to_string()).await
    }

    async fn create_identity(&self, row: IdentityRow, now: i64) -> Result<(), DbError> {
        Database::create_identity(self, row, now).await
    }

    async fn save_identity(&self, row: IdentityRow, now: i64) -> Result<bool, DbError> {
        self.update_identity(row, now).await
    }
}
