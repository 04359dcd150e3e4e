//! The cache and quota engine as one service object.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bans::BanRegistry;
use crate::device_info::{DEFAULT_VOLATILE_PATTERN, DeviceInfoNormalizer, VolatileTokenNormalizer};
use crate::error::QuotaError;
use crate::helpers::now;
use crate::playtime::{
    BonusReport, FlushReport, LoginAttempt, PlaytimeLedger, PlaytimeRecord, spawn_daily_reset,
};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::settings::{SettingsCache, SettingsSnapshot};
use crate::store::Store;

/// Refresh cadence per cache.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bans: SchedulerConfig,
    pub settings: SchedulerConfig,
    pub playtime: SchedulerConfig,
    /// Regex of the volatile device-info token.
    pub device_info_pattern: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let grace = Duration::from_secs(900);
        Self {
            bans: SchedulerConfig {
                period: Duration::from_secs(55),
                grace,
            },
            settings: SchedulerConfig {
                period: Duration::from_secs(55),
                grace,
            },
            playtime: SchedulerConfig {
                period: Duration::from_secs(6 * 60 * 60),
                grace,
            },
            device_info_pattern: DEFAULT_VOLATILE_PATTERN.to_string(),
        }
    }
}

pub struct Engine {
    bans: Arc<Scheduler<BanRegistry>>,
    settings: Arc<Scheduler<SettingsCache>>,
    playtime: Arc<Scheduler<PlaytimeLedger>>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Result<Self, regex::Error> {
        let normalizer = Arc::new(VolatileTokenNormalizer::new(&config.device_info_pattern)?);
        Ok(Self::with_normalizer(store, config, normalizer))
    }

    /// Build an engine with a custom device-info normalizer. The pattern in `config` is ignored.
    pub fn with_normalizer(
        store: Arc<dyn Store>,
        config: EngineConfig,
        normalizer: Arc<dyn DeviceInfoNormalizer>,
    ) -> Self {
        let bans = BanRegistry::new(store.clone(), normalizer.clone());
        let settings = SettingsCache::new(store.clone());
        let playtime = PlaytimeLedger::new(store, normalizer);

        Self {
            bans: Arc::new(Scheduler::new(Arc::new(bans), config.bans)),
            settings: Arc::new(Scheduler::new(Arc::new(settings), config.settings)),
            playtime: Arc::new(Scheduler::new(Arc::new(playtime), config.playtime)),
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load every cache once, then start the schedulers and the daily reset.
    ///
    /// A failed initial load is logged and the cache starts out degraded.
    pub async fn start(&self) {
        let now = Instant::now();
        tokio::join!(
            self.bans.force_reload(now),
            self.settings.force_reload(now),
            self.playtime.force_reload(now),
        );

        let token = self.cancellation_token.clone();
        let handles = [
            self.bans.spawn(token.clone()),
            self.settings.spawn(token.clone()),
            self.playtime.spawn(token.clone()),
            spawn_daily_reset(self.playtime.target().clone(), token, Utc::now),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        info!("engine started");
    }

    /// Stop every background task and write back unsaved playtime.
    pub async fn shutdown(&self) -> FlushReport {
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(%error, "background task failed");
            }
        }

        let report = self.playtime.target().flush().await;
        info!(
            written = report.written,
            failed = report.failed,
            "engine stopped"
        );
        report
    }

    /// Mark every cache as in use.
    pub fn notify_activity(&self) {
        self.bans.notify_activity();
        self.settings.notify_activity();
        self.playtime.notify_activity();
    }

    /// Reload any cache whose last reload attempt is older than its period.
    pub async fn check_and_refresh_if_stale(&self) {
        let now = Instant::now();
        tokio::join!(
            self.bans.check_and_refresh_if_stale(now),
            self.settings.check_and_refresh_if_stale(now),
            self.playtime.check_and_refresh_if_stale(now),
        );
    }

    pub fn check_ip_banned(&self, ip: &str) -> bool {
        self.bans.target().check_ip_banned(ip)
    }

    pub fn check_device_id_banned(&self, device_id: &str) -> bool {
        self.bans.target().check_device_id_banned(device_id)
    }

    pub fn check_real_device_id_banned(&self, real_device_id: &str) -> bool {
        self.bans.target().check_real_device_id_banned(real_device_id)
    }

    pub fn check_device_info_banned(&self, device_info: &str) -> bool {
        self.bans.target().check_device_info_banned(device_info)
    }

    pub fn get_settings(&self) -> Arc<SettingsSnapshot> {
        self.settings.target().get_settings()
    }

    pub fn ledger(&self) -> &PlaytimeLedger {
        self.playtime.target()
    }

    pub async fn get_or_create_playtime(&self, device_id: &str) -> Result<PlaytimeRecord, QuotaError> {
        self.ledger().get_or_create(device_id, now()).await
    }

    pub async fn consume_elapsed(&self, device_id: &str) -> Result<PlaytimeRecord, QuotaError> {
        self.ledger().consume_elapsed(device_id, now()).await
    }

    pub async fn verify_and_authorize_login(
        &self,
        attempt: &LoginAttempt<'_>,
    ) -> Result<PlaytimeRecord, QuotaError> {
        self.ledger().verify_and_authorize_login(attempt, now()).await
    }

    pub async fn grant_bonus(&self, device_id: &str, seconds: i64) -> Result<PlaytimeRecord, QuotaError> {
        self.ledger().grant_bonus(device_id, seconds, now()).await
    }

    pub async fn grant_bonus_many(&self, device_ids: &[String], seconds: i64) -> BonusReport {
        self.ledger().grant_bonus_many(device_ids, seconds, now()).await
    }

    pub async fn set_vip(&self, device_id: &str, is_vip: bool) -> Result<PlaytimeRecord, QuotaError> {
        self.ledger().set_vip(device_id, is_vip, now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotaward_db::{BanCategory, Database};

    async fn engine() -> (Database, Engine) {
        let db = Database::open_in_memory().await.unwrap();
        let engine = Engine::new(Arc::new(db.clone()), EngineConfig::default()).unwrap();
        (db, engine)
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let config = EngineConfig {
            device_info_pattern: "(".to_string(),
            ..Default::default()
        };
        assert!(Engine::new(Arc::new(db), config).is_err());
    }

    #[tokio::test]
    async fn test_start_loads_every_cache() {
        let (db, engine) = engine().await;
        db.ban(BanCategory::Ip, "6.6.6.6".to_string(), 0).await.unwrap();
        db.ban(BanCategory::DeviceInfo, "Pixel_7_5120MB_8".to_string(), 0)
            .await
            .unwrap();
        db.create_player("D1".to_string(), 1).await.unwrap();

        engine.start().await;

        assert!(engine.check_ip_banned("6.6.6.6"));
        assert!(engine.check_device_info_banned("Pixel_7_3900MB_8"));
        assert!(!engine.check_device_id_banned("D1"));
        assert!(!engine.get_settings().graphics_options.is_empty());
        // The empty settings row was created with defaults
        assert!(db.get_server_settings().await.unwrap().is_some());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_playtime() {
        let (db, engine) = engine().await;
        db.create_player("D1".to_string(), 1).await.unwrap();
        engine.start().await;

        engine.grant_bonus("D1", 60).await.unwrap();
        let attempt = LoginAttempt {
            device_id: "D1",
            ip: "",
            real_device_id: "",
            device_info: "",
        };
        engine.verify_and_authorize_login(&attempt).await.unwrap();

        let report = engine.shutdown().await;
        assert_eq!(report.failed, 0);

        let player = db.get_player("D1".to_string()).await.unwrap().unwrap();
        let stored = player.playtime.unwrap();
        assert_eq!(stored.today_extra_time, 60);
        assert_eq!(engine.get_or_create_playtime("D1").await.unwrap().to_stored(), stored);
    }
}
