use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

/// Identifier dimension a ban applies to. Each category lives in its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BanCategory {
  Ip,
  DeviceId,
  RealDeviceId,
  DeviceInfo,
}

impl BanCategory {
  pub const ALL: [BanCategory; 4] = [
    BanCategory::Ip,
    BanCategory::DeviceId,
    BanCategory::RealDeviceId,
    BanCategory::DeviceInfo,
  ];

  pub(crate) fn table(self) -> &'static str {
    match self {
      BanCategory::Ip => "ban_ip",
      BanCategory::DeviceId => "ban_device_id",
      BanCategory::RealDeviceId => "ban_real_device_id",
      BanCategory::DeviceInfo => "ban_device_info",
    }
  }

  pub(crate) fn column(self) -> &'static str {
    match self {
      BanCategory::Ip => "ip",
      BanCategory::DeviceId => "device_id",
      BanCategory::RealDeviceId => "real_device_id",
      BanCategory::DeviceInfo => "device_info",
    }
  }

  pub fn as_str(self) -> &'static str {
    self.column()
  }
}

/// The single authoritative server settings row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettingsRow {
  /// JSON array of graphics presets
  pub graphics_options: String,
  /// JSON object of miscellaneous client switches
  pub misc_options: String,
  pub server_ip: Option<String>,
  pub server_port: Option<String>,
  /// Unix timestamp the client uses as the day boundary
  pub server_over_day_timestamp: i64,
  /// JSON playtime policy, empty when never written
  pub playtime_settings: String,
  pub created_at: i64,
  pub updated_at: i64,
}

/// Persisted quota sub-fields of a player, stored as a JSON blob.
///
/// The session anchor is deliberately absent: it only lives in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPlaytime {
  #[serde(default)]
  pub played_time: i64,
  #[serde(rename = "isVIP", default)]
  pub is_vip: bool,
  #[serde(default)]
  pub daily_play_time: i64,
  #[serde(default)]
  pub today_extra_time: i64,
  #[serde(default)]
  pub last_update_time: i64,
}

/// A player row as seen by the quota engine.
#[derive(Debug, Clone)]
pub struct PlayerRow {
  pub device_id: String,
  pub role_id: i64,
  /// `None` when the blob is empty or could not be decoded.
  pub playtime: Option<StoredPlaytime>,
}

/// Identity history of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRow {
  pub device_id: String,
  pub role_id: i64,
  pub ips: Vec<String>,
  pub real_device_ids: Vec<String>,
  pub device_infos: Vec<String>,
}

/// Placeholder values older clients wrote into history columns.
const EMPTY_MARKERS: [&str; 3] = ["", "Invalid value.", "null"];

/// Decode a history column.
///
/// Current rows hold a JSON array. Rows written by older builds hold the
/// entries separated by blank lines, which are still accepted.
pub(crate) fn decode_history(raw: &str) -> Vec<String> {
  if EMPTY_MARKERS.contains(&raw) {
    return Vec::new();
  }

  if let Ok(entries) = serde_json::from_str::<Vec<String>>(raw) {
    return entries;
  }

  raw
    .split("\n\n")
    .filter(|part| !part.is_empty())
    .map(str::to_owned)
    .collect()
}

pub(crate) fn encode_history(column: &'static str, entries: &[String]) -> Result<String> {
  serde_json::to_string(entries).map_err(|source| DbError::Codec { column, source })
}

/// Decode a playtime blob; empty or malformed blobs yield `None`.
pub(crate) fn decode_playtime(device_id: &str, raw: &str) -> Option<StoredPlaytime> {
  if raw.trim().is_empty() {
    return None;
  }

  match serde_json::from_str(raw) {
    Ok(playtime) => Some(playtime),
    Err(error) => {
      tracing::warn!(%device_id, %error, "malformed playtime blob, treating as absent");
      None
    }
  }
}

pub(crate) fn encode_playtime(playtime: &StoredPlaytime) -> Result<String> {
  serde_json::to_string(playtime).map_err(|source| DbError::Codec {
    column: "playtime_data",
    source,
  })
}
