use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use quotaward_db::ServerSettingsRow;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::RefreshError;
use crate::helpers::now;
use crate::playtime::PlaytimeSettings;
use crate::scheduler::Reload;
use crate::snapshot::Snapshot;
use crate::store::Store;

pub const DEFAULT_GRAPHICS_OPTIONS: &str = r#"[{"level":1,"isDefault":0,"shadow":0,"maxParticles":1000,"renderScale":0.8},{"level":3,"isDefault":1,"shadow":1,"maxParticles":5000,"renderScale":1}]"#;
pub const DEFAULT_MISC_OPTIONS: &str = r#"{"outline":1,"HFR":1,"BRHFR":1,"HFX":1}"#;

/// One published generation of the server settings row.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshot {
    pub graphics_options: String,
    pub misc_options: String,
    pub server_ip: Option<String>,
    pub server_port: Option<String>,
    pub server_over_day_timestamp: i64,
    pub playtime: PlaytimeSettings,
    pub updated_at: i64,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            graphics_options: DEFAULT_GRAPHICS_OPTIONS.to_string(),
            misc_options: DEFAULT_MISC_OPTIONS.to_string(),
            server_ip: None,
            server_port: None,
            server_over_day_timestamp: 0,
            playtime: PlaytimeSettings::default(),
            updated_at: 0,
        }
    }
}

impl From<ServerSettingsRow> for SettingsSnapshot {
    fn from(row: ServerSettingsRow) -> Self {
        Self {
            playtime: PlaytimeSettings::from_json(&row.playtime_settings).unwrap_or_default(),
            graphics_options: row.graphics_options,
            misc_options: row.misc_options,
            server_ip: row.server_ip,
            server_port: row.server_port,
            server_over_day_timestamp: row.server_over_day_timestamp,
            updated_at: row.updated_at,
        }
    }
}

fn default_row(now: i64) -> ServerSettingsRow {
    ServerSettingsRow {
        graphics_options: DEFAULT_GRAPHICS_OPTIONS.to_string(),
        misc_options: DEFAULT_MISC_OPTIONS.to_string(),
        server_ip: None,
        server_port: None,
        server_over_day_timestamp: 0,
        playtime_settings: PlaytimeSettings::default().to_json().unwrap_or_default(),
        created_at: now,
        updated_at: now,
    }
}

/// Parse the graphics presets, falling back to the built-in presets if malformed.
pub fn parse_graphics_options(raw: &str) -> Vec<Map<String, Value>> {
    match serde_json::from_str::<Vec<Map<String, Value>>>(raw) {
        Ok(options) if !options.is_empty() => options,
        Ok(_) => default_graphics_options(),
        Err(error) => {
            debug!(%error, "malformed graphics options, using defaults");
            default_graphics_options()
        }
    }
}

/// Parse the miscellaneous client switches, falling back to the built-in switches if malformed.
pub fn parse_misc_options(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Map<String, Value>>(raw) {
        Ok(options) => options,
        Err(error) => {
            debug!(%error, "malformed misc options, using defaults");
            default_misc_options()
        }
    }
}

fn default_graphics_options() -> Vec<Map<String, Value>> {
    serde_json::from_str(DEFAULT_GRAPHICS_OPTIONS).unwrap_or_default()
}

fn default_misc_options() -> Map<String, Value> {
    serde_json::from_str(DEFAULT_MISC_OPTIONS).unwrap_or_default()
}

/// Cached copy of the settings row.
pub struct SettingsCache {
    store: Arc<dyn Store>,
    snapshot: Snapshot<SettingsSnapshot>,
    default_written: AtomicBool,
    degraded_reported: AtomicBool,
}

impl SettingsCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            snapshot: Snapshot::default(),
            default_written: AtomicBool::new(false),
            degraded_reported: AtomicBool::new(false),
        }
    }

    pub fn get_settings(&self) -> Arc<SettingsSnapshot> {
        self.snapshot.load()
    }

    /// No row in the store: write the defaults once, then keep serving them.
    async fn publish_default(&self) {
        let row = default_row(now());

        if !self.default_written.swap(true, Ordering::AcqRel) {
            match self.store.create_settings(row.clone()).await {
                Ok(true) => info!("no server settings found, stored defaults"),
                Ok(false) => debug!("server settings were created concurrently"),
                Err(error) => warn!(%error, "failed to store default server settings"),
            }
        }

        if !self.snapshot.is_published() {
            self.snapshot.publish(row.into());
        }
    }
}

#[async_trait]
impl Reload for SettingsCache {
    fn name(&self) -> &'static str {
        "settings"
    }

    async fn reload(&self) -> Result<(), RefreshError> {
        match self.store.load_settings().await {
            Ok(Some(row)) => {
                self.snapshot.publish(row.into());
                Ok(())
            }
            Ok(None) => {
                self.publish_default().await;
                Ok(())
            }
            Err(source) => {
                if !self.snapshot.is_published() && !self.degraded_reported.swap(true, Ordering::AcqRel) {
                    warn!("server settings never loaded, serving defaults");
                }
                Err(RefreshError::new("settings", source))
            }
        }
    }
}
