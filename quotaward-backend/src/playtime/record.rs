use quotaward_db::StoredPlaytime;

use super::policy::PlaytimeSettings;

/// Per-device quota state held in memory.
///
/// The remaining time is always derived from the two allotments and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaytimeRecord {
    /// Cumulative seconds played, informational only.
    pub played_time: i64,
    pub is_vip: bool,
    /// Fixed daily allotment left today.
    pub daily_play_time: i64,
    /// Bonus left today, spent before the daily allotment.
    pub today_extra_time: i64,
    pub last_update_time: i64,
    /// Session anchor, zero when no session is running. Never persisted.
    pub last_login_time: i64,
    /// Changed since the last successful flush.
    pub dirty: bool,
}

impl PlaytimeRecord {
    /// A record with a full allotment for its tier.
    pub fn fresh(settings: &PlaytimeSettings, is_vip: bool, now: i64) -> Self {
        Self {
            played_time: 0,
            is_vip,
            daily_play_time: settings.allotment(is_vip),
            today_extra_time: 0,
            last_update_time: now,
            last_login_time: 0,
            dirty: true,
        }
    }

    pub fn from_stored(stored: StoredPlaytime) -> Self {
        Self {
            played_time: stored.played_time,
            is_vip: stored.is_vip,
            daily_play_time: stored.daily_play_time,
            today_extra_time: stored.today_extra_time,
            last_update_time: stored.last_update_time,
            last_login_time: 0,
            dirty: false,
        }
    }

    pub fn to_stored(&self) -> StoredPlaytime {
        StoredPlaytime {
            played_time: self.played_time,
            is_vip: self.is_vip,
            daily_play_time: self.daily_play_time,
            today_extra_time: self.today_extra_time,
            last_update_time: self.last_update_time,
        }
    }

    pub fn remaining_time(&self) -> i64 {
        self.daily_play_time + self.today_extra_time
    }

    pub fn is_exhausted(&self) -> bool {
        self.daily_play_time <= 0 && self.today_extra_time <= 0
    }

    pub fn in_session(&self) -> bool {
        self.last_login_time != 0
    }

    pub fn start_session(&mut self, now: i64) {
        self.last_login_time = now;
        self.last_update_time = now;
        self.dirty = true;
    }

    /// Charge the wall-clock time since the session anchor and move the anchor to `now`.
    ///
    /// Bonus time is drained before the daily allotment and both are clamped at
    /// zero. Does nothing outside a session. Returns whether the quota is exhausted.
    pub fn consume_elapsed(&mut self, now: i64) -> bool {
        if !self.in_session() {
            return self.is_exhausted();
        }

        let elapsed = (now - self.last_login_time).max(0);
        self.consume(elapsed);
        self.played_time += elapsed;
        self.last_login_time = now;
        self.last_update_time = now;
        self.dirty = true;

        self.is_exhausted()
    }

    fn consume(&mut self, elapsed: i64) {
        let from_bonus = elapsed.min(self.today_extra_time.max(0));
        self.today_extra_time = (self.today_extra_time - from_bonus).max(0);
        self.daily_play_time = (self.daily_play_time - (elapsed - from_bonus)).max(0);
    }

    /// Start of a new day: top the daily allotment up to the tier's allotment and drop any bonus.
    ///
    /// A daily allotment above the tier's allotment is left alone.
    pub fn daily_reset(&mut self, settings: &PlaytimeSettings, now: i64) {
        self.daily_play_time = self.daily_play_time.max(settings.allotment(self.is_vip));
        self.today_extra_time = 0;
        self.last_update_time = now;
        self.dirty = true;
    }

    pub fn add_bonus(&mut self, seconds: i64, now: i64) {
        self.today_extra_time += seconds;
        self.last_update_time = now;
        self.dirty = true;
    }

    /// Switch tier. An upgrade raises the daily allotment to the VIP allotment if below it.
    pub fn set_vip(&mut self, is_vip: bool, settings: &PlaytimeSettings, now: i64) {
        self.is_vip = is_vip;
        if is_vip {
            self.daily_play_time = self.daily_play_time.max(settings.vip_playtime_seconds);
        }
        self.last_update_time = now;
        self.dirty = true;
    }
}
