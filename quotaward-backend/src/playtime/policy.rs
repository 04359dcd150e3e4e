use chrono::{DateTime, Days, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::Store;
use quotaward_db::DbError;

pub const DEFAULT_FREE_PLAYTIME_SECONDS: i64 = 90 * 60;
pub const DEFAULT_VIP_PLAYTIME_SECONDS: i64 = 10 * 60 * 60;
pub const DEFAULT_RESET_HOUR: u32 = 1;

/// The daily boundary is a civil hour in UTC+8.
const RESET_OFFSET_SECS: i32 = 8 * 60 * 60;

/// Daily allotments and the reset hour, stored as JSON in the settings row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaytimeSettings {
    pub free_playtime_seconds: i64,
    pub vip_playtime_seconds: i64,
    pub reset_hour: u32,
}

impl Default for PlaytimeSettings {
    fn default() -> Self {
        Self {
            free_playtime_seconds: DEFAULT_FREE_PLAYTIME_SECONDS,
            vip_playtime_seconds: DEFAULT_VIP_PLAYTIME_SECONDS,
            reset_hour: DEFAULT_RESET_HOUR,
        }
    }
}

impl PlaytimeSettings {
    /// Parse the stored JSON. `None` for an empty column.
    ///
    /// Unparseable JSON degrades to the defaults, an out-of-range hour to the default hour.
    pub fn from_json(raw: &str) -> Option<Self> {
        if raw.trim().is_empty() {
            return None;
        }

        let mut settings: Self = match serde_json::from_str(raw) {
            Ok(settings) => settings,
            Err(error) => {
                warn!(%error, "invalid playtime settings, using defaults");
                return Some(Self::default());
            }
        };

        if settings.reset_hour > 23 {
            warn!(
                reset_hour = settings.reset_hour,
                "reset hour out of range, using default"
            );
            settings.reset_hour = DEFAULT_RESET_HOUR;
        }

        Some(settings)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn allotment(&self, is_vip: bool) -> i64 {
        if is_vip {
            self.vip_playtime_seconds
        } else {
            self.free_playtime_seconds
        }
    }
}

/// Read the policy from the settings row.
///
/// A missing row yields the defaults without writing. An empty column is
/// filled with the defaults, which are persisted.
pub async fn load_policy(store: &dyn Store, now: i64) -> Result<PlaytimeSettings, DbError> {
    let Some(row) = store.load_settings().await? else {
        return Ok(PlaytimeSettings::default());
    };

    if let Some(settings) = PlaytimeSettings::from_json(&row.playtime_settings) {
        return Ok(settings);
    }

    let settings = PlaytimeSettings::default();
    match settings.to_json() {
        Ok(json) => match store.save_playtime_settings(json, now).await {
            Ok(_) => info!("stored default playtime settings"),
            Err(error) => warn!(%error, "failed to store default playtime settings"),
        },
        Err(error) => warn!(%error, "failed to encode playtime settings"),
    }

    Ok(settings)
}

/// First instant strictly after `now` at which the UTC+8 clock reads `reset_hour:00:00`.
pub fn next_reset_after(now: DateTime<Utc>, reset_hour: u32) -> DateTime<Utc> {
    let offset = FixedOffset::east_opt(RESET_OFFSET_SECS).unwrap_or_else(|| Utc.fix());
    let reset_time = NaiveTime::from_hms_opt(reset_hour.min(23), 0, 0).unwrap_or_default();

    let local_now = now.with_timezone(&offset);
    let today = local_now.date_naive().and_time(reset_time);

    // A fixed offset has no gaps or folds, so the local time always maps to one instant
    let candidate = offset
        .from_local_datetime(&today)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now);

    if candidate > now {
        return candidate;
    }

    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    offset
        .from_local_datetime(&tomorrow)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}
