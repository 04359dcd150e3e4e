use quotaward_db::DbError;
use tracing::{debug, info, warn};

use super::ledger::PlaytimeLedger;
use super::record::PlaytimeRecord;
use crate::error::QuotaError;
use crate::identity::{IdentityRecord, Probe, SCORE_THRESHOLD};

/// Aliases with less than this many seconds left are logged as likely evasion.
const LOW_ALIAS_QUOTA_SECS: i64 = 600;

/// Identifying data sent with a login request.
#[derive(Debug, Clone, Copy)]
pub struct LoginAttempt<'a> {
    pub device_id: &'a str,
    pub ip: &'a str,
    pub real_device_id: &'a str,
    /// Raw device info, normalized before use.
    pub device_info: &'a str,
}

impl PlaytimeLedger {
    /// Decide whether a login may start a session, and start it.
    ///
    /// When the device's identity history doesn't vouch for the login strongly
    /// enough, every other device sharing the IP or hardware id is checked and an
    /// exhausted one rejects the login. The observed values join the history only
    /// once the login is authorized.
    #[tracing::instrument(skip_all, fields(device_id = %attempt.device_id))]
    pub async fn verify_and_authorize_login(
        &self,
        attempt: &LoginAttempt<'_>,
        now: i64,
    ) -> Result<PlaytimeRecord, QuotaError> {
        let device_info = self.normalizer.normalize(attempt.device_info);
        let probe = Probe {
            ip: attempt.ip,
            real_device_id: attempt.real_device_id,
            device_info: &device_info,
        };

        let player = self
            .store
            .load_player(attempt.device_id)
            .await?
            .ok_or(QuotaError::UnknownDevice)?;
        let known = match self.identities.get(attempt.device_id).await {
            Some(record) => Some(record),
            None => self
                .store
                .load_identity(attempt.device_id)
                .await?
                .map(IdentityRecord::from),
        };

        let observed = match known {
            Some(record) => {
                if player.role_id != record.role_id {
                    return Err(QuotaError::IdentityAnomaly(format!(
                        "device {} is bound to role {} but its player has role {}",
                        attempt.device_id, record.role_id, player.role_id
                    )));
                }

                let score = record.own_score(&probe);
                let mut observed = record;
                let changed = observed.observe(&probe)?;

                if score >= SCORE_THRESHOLD {
                    debug!(score, "identity matches own history");
                } else {
                    debug!(score, "weak identity match, checking aliases");
                    self.check_aliases(attempt.device_id, &probe, now).await?;
                }
                changed.then_some(observed)
            }
            None => {
                self.provision(attempt.device_id, player.role_id, &probe, now)
                    .await?;
                None
            }
        };

        let record = self.get_or_create(attempt.device_id, now).await?;
        if record.remaining_time() <= 0 {
            debug!("own playtime used up");
            return Err(QuotaError::QuotaExhausted);
        }

        let (record, ()) = self
            .modify(attempt.device_id, now, |record| record.start_session(now))
            .await?;
        if let Some(observed) = observed {
            self.remember(observed, now).await;
        }
        info!(remaining = record.remaining_time(), "login authorized");
        Ok(record)
    }

    /// Reject the login if any plausible alias has used up its quota.
    async fn check_aliases(&self, device_id: &str, probe: &Probe<'_>, now: i64) -> Result<(), QuotaError> {
        for (alias, score) in self.identities.aliases(device_id, probe).await {
            debug!(%alias, score, "possible alias");

            let alias_record = match self.get_or_create(&alias, now).await {
                Ok(record) => record,
                Err(error) => {
                    debug!(%alias, %error, "skipping alias without playtime");
                    continue;
                }
            };

            let remaining = alias_record.remaining_time();
            if remaining <= 0 {
                warn!(%alias, score, "alias has used up its playtime, rejecting login");
                return Err(QuotaError::QuotaExhausted);
            }
            if remaining < LOW_ALIAS_QUOTA_SECS {
                warn!(%alias, remaining, "alias almost out of playtime, possible evasion");
            }
        }
        Ok(())
    }

    async fn remember(&self, observed: IdentityRecord, now: i64) {
        if let Err(error) = self.store.save_identity(observed.clone().into(), now).await {
            warn!(%error, "failed to persist identity history");
        }
        self.identities.upsert(observed).await;
    }

    /// First login of a device: create its identity history.
    async fn provision(&self, device_id: &str, role_id: i64, probe: &Probe<'_>, now: i64) -> Result<(), QuotaError> {
        if probe.ip.is_empty() && probe.real_device_id.is_empty() {
            return Ok(());
        }

        let mut record = IdentityRecord::new(device_id, role_id);
        record.observe(probe)?;

        match self.store.create_identity(record.clone().into(), now).await {
            Ok(()) => debug!(role_id, "created identity history"),
            Err(DbError::RoleConflict { role_id, device_id: bound }) => {
                return Err(QuotaError::IdentityAnomaly(format!(
                    "role {role_id} is already bound to device {bound}"
                )));
            }
            Err(error) => warn!(%error, "failed to persist identity history"),
        }

        self.identities.upsert(record).await;
        Ok(())
    }
}
