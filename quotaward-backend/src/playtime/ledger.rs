use std::sync::Arc;

use async_trait::async_trait;
use quotaward_db::PlayerRow;
use scc::HashMap;
use scc::hash_map::Entry;
use tracing::{debug, info, warn};

use super::policy::{PlaytimeSettings, load_policy};
use super::record::PlaytimeRecord;
use crate::device_info::DeviceInfoNormalizer;
use crate::error::{QuotaError, RefreshError};
use crate::helpers::now;
use crate::identity::IdentityRegistry;
use crate::scheduler::Reload;
use crate::snapshot::Snapshot;
use crate::store::Store;

/// Outcome of one batch write.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    /// Dirty records whose player row has since been deleted.
    pub skipped: usize,
    pub failed: usize,
}

/// Outcome of a bulk bonus grant.
#[derive(Debug, Default)]
pub struct BonusReport {
    pub granted: usize,
    pub last_error: Option<QuotaError>,
}

/// Per-device playtime quota, mirrored in memory and written back in batches.
pub struct PlaytimeLedger {
    pub(super) store: Arc<dyn Store>,
    pub(super) normalizer: Arc<dyn DeviceInfoNormalizer>,
    records: HashMap<String, PlaytimeRecord>,
    policy: Snapshot<PlaytimeSettings>,
    pub(super) identities: IdentityRegistry,
}

impl PlaytimeLedger {
    pub fn new(store: Arc<dyn Store>, normalizer: Arc<dyn DeviceInfoNormalizer>) -> Self {
        Self {
            store,
            normalizer,
            records: HashMap::new(),
            policy: Snapshot::default(),
            identities: IdentityRegistry::new(),
        }
    }

    pub fn policy(&self) -> Arc<PlaytimeSettings> {
        self.policy.load()
    }

    pub fn identities(&self) -> &IdentityRegistry {
        &self.identities
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Cached record, loading it from the store on a miss.
    ///
    /// A player row without a playtime blob gets a fresh record with the free
    /// allotment. Devices without a player row are never cached.
    pub async fn get_or_create(&self, device_id: &str, now: i64) -> Result<PlaytimeRecord, QuotaError> {
        if let Some(record) = self.records.read_async(device_id, |_, record| *record).await {
            return Ok(record);
        }

        let loaded = match self.store.load_player(device_id).await? {
            Some(PlayerRow {
                playtime: Some(stored),
                ..
            }) => PlaytimeRecord::from_stored(stored),
            Some(_) => PlaytimeRecord::fresh(&self.policy(), false, now),
            None => return Err(QuotaError::UnknownDevice),
        };

        // Someone else may have loaded it while we were reading the store
        let record = match self.records.entry_async(device_id.to_string()).await {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                entry.insert_entry(loaded);
                loaded
            }
        };

        debug!(%device_id, remaining = record.remaining_time(), "loaded playtime record");
        Ok(record)
    }

    /// Apply `f` to the cached record, loading it first if needed.
    pub(super) async fn modify<T>(
        &self,
        device_id: &str,
        now: i64,
        f: impl FnOnce(&mut PlaytimeRecord) -> T,
    ) -> Result<(PlaytimeRecord, T), QuotaError> {
        self.get_or_create(device_id, now).await?;
        self.records
            .update_async(device_id, |_, record| {
                let output = f(record);
                (*record, output)
            })
            .await
            .ok_or(QuotaError::UnknownDevice)
    }

    /// Charge the time since the session anchor. Fails once the quota is used up.
    pub async fn consume_elapsed(&self, device_id: &str, now: i64) -> Result<PlaytimeRecord, QuotaError> {
        let (record, exhausted) = self
            .modify(device_id, now, |record| record.consume_elapsed(now))
            .await?;

        if exhausted {
            debug!(%device_id, "playtime used up");
            return Err(QuotaError::QuotaExhausted);
        }
        Ok(record)
    }

    /// Add bonus time for today and write the record through immediately.
    pub async fn grant_bonus(&self, device_id: &str, seconds: i64, now: i64) -> Result<PlaytimeRecord, QuotaError> {
        let record = self
            .persist_change(device_id, now, |record| record.add_bonus(seconds, now))
            .await?;

        info!(%device_id, seconds, remaining = record.remaining_time(), "granted bonus playtime");
        Ok(record)
    }

    /// Grant the same bonus to many devices. Failures are logged and skipped.
    pub async fn grant_bonus_many(&self, device_ids: &[String], seconds: i64, now: i64) -> BonusReport {
        let mut report = BonusReport::default();

        for device_id in device_ids {
            match self.grant_bonus(device_id, seconds, now).await {
                Ok(_) => report.granted += 1,
                Err(error) => {
                    warn!(%device_id, %error, "failed to grant bonus playtime");
                    report.last_error = Some(error);
                }
            }
        }

        info!(
            granted = report.granted,
            requested = device_ids.len(),
            "bulk bonus grant finished"
        );
        report
    }

    /// Change a device's tier and write the record through immediately.
    pub async fn set_vip(&self, device_id: &str, is_vip: bool, now: i64) -> Result<PlaytimeRecord, QuotaError> {
        let policy = self.policy();
        let record = self
            .persist_change(device_id, now, |record| record.set_vip(is_vip, &policy, now))
            .await?;

        info!(%device_id, is_vip, "updated vip status");
        Ok(record)
    }

    /// Write `change` to the store first and only then apply it in memory.
    ///
    /// Fails with `UnknownDevice` when there is no player row to write into.
    async fn persist_change(
        &self,
        device_id: &str,
        now: i64,
        change: impl Fn(&mut PlaytimeRecord),
    ) -> Result<PlaytimeRecord, QuotaError> {
        let mut updated = self.get_or_create(device_id, now).await?;
        change(&mut updated);

        if !self.store.save_playtime(device_id, updated.to_stored()).await? {
            return Err(QuotaError::UnknownDevice);
        }

        let stored = updated.to_stored();
        self.records
            .update_async(device_id, |_, record| {
                change(record);
                // Concurrent consumption since the read means memory is ahead of the store
                record.dirty = record.to_stored() != stored;
                *record
            })
            .await
            .ok_or(QuotaError::UnknownDevice)
    }

    /// Start of a new day for every cached record, then a batch write.
    pub async fn daily_reset(&self, now: i64) -> usize {
        let policy = self.policy();
        let mut reset = 0;

        self.records
            .retain_async(|_, record| {
                record.daily_reset(&policy, now);
                reset += 1;
                true
            })
            .await;

        info!(records = reset, "daily playtime reset");
        self.flush().await;
        reset
    }

    /// Write every dirty record. Failures are logged per record and retried next cycle.
    pub async fn flush(&self) -> FlushReport {
        let mut dirty = Vec::new();
        self.records
            .iter_async(|device_id, record| {
                if record.dirty {
                    dirty.push((device_id.clone(), *record));
                }
                true
            })
            .await;

        let mut report = FlushReport::default();
        for (device_id, record) in dirty {
            let stored = record.to_stored();
            match self.store.save_playtime(&device_id, stored).await {
                Ok(written) => {
                    if written {
                        report.written += 1;
                    } else {
                        report.skipped += 1;
                    }
                    // Leave it dirty if it changed while we were writing
                    self.records
                        .update_async(&device_id, |_, current| {
                            if current.to_stored() == stored {
                                current.dirty = false;
                            }
                        })
                        .await;
                }
                Err(error) => {
                    warn!(%device_id, %error, "failed to persist playtime, will retry");
                    report.failed += 1;
                }
            }
        }

        if report != FlushReport::default() {
            info!(
                written = report.written,
                skipped = report.skipped,
                failed = report.failed,
                "flushed playtime records"
            );
        }
        report
    }

    /// Refresh the policy, all persisted records and the identity table from the store.
    ///
    /// Session anchors survive. Records still dirty keep their in-memory values.
    pub async fn reload_from_store(&self, now: i64) -> Result<(), RefreshError> {
        let mut first_error = None;

        match load_policy(self.store.as_ref(), now).await {
            Ok(policy) => self.policy.publish(policy),
            Err(source) => {
                first_error.get_or_insert(RefreshError::new("playtime policy", source));
            }
        }
        let policy = self.policy();

        match self.store.load_players().await {
            Ok(players) => {
                let count = players.len();
                for player in players {
                    self.merge_player(player, &policy, now).await;
                }
                info!(players = count, "loaded playtime records");
            }
            Err(source) => {
                first_error.get_or_insert(RefreshError::new("playtime records", source));
            }
        }

        match self.store.load_identities().await {
            Ok(rows) => {
                self.identities.replace_all(rows).await;
                debug!(identities = self.identities.len(), "loaded identity records");
            }
            Err(source) => {
                first_error.get_or_insert(RefreshError::new("identity records", source));
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn merge_player(&self, player: PlayerRow, policy: &PlaytimeSettings, now: i64) {
        let loaded = match player.playtime {
            Some(stored) => PlaytimeRecord::from_stored(stored),
            None => PlaytimeRecord::fresh(policy, false, now),
        };

        match self.records.entry_async(player.device_id).await {
            Entry::Occupied(mut entry) => {
                let current = entry.get_mut();
                if !current.dirty {
                    let last_login_time = current.last_login_time;
                    *current = loaded;
                    current.last_login_time = last_login_time;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert_entry(loaded);
            }
        }
    }
}

#[async_trait]
impl Reload for PlaytimeLedger {
    fn name(&self) -> &'static str {
        "playtime"
    }

    /// Write back first so the reload doesn't clobber unsaved consumption.
    async fn reload(&self) -> Result<(), RefreshError> {
        self.flush().await;
        self.reload_from_store(now()).await
    }
}
