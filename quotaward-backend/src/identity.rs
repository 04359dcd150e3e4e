//! Identity correlation between devices.
//!
//! Every device keeps a short history of the IPs, hardware ids and device-info
//! strings it logged in with. A login is scored against that history to decide
//! whether the quota on file is authoritative, and against every other device
//! to find aliases that should share its quota.

use quotaward_db::IdentityRow;
use scc::HashMap;
use scc::hash_map::Entry;

use crate::error::QuotaError;

pub const IP_WEIGHT: u32 = 35;
pub const REAL_DEVICE_ID_WEIGHT: u32 = 40;
pub const DEVICE_ID_WEIGHT: u32 = 25;

/// Own-record score at which the device's own quota is authoritative.
pub const SCORE_THRESHOLD: u32 = 60;

/// Score another device needs to count as an alias. The device-id weight can't apply across devices.
pub const RELATION_THRESHOLD: u32 = SCORE_THRESHOLD - DEVICE_ID_WEIGHT;

/// Distinct values kept per history dimension.
pub const MAX_HISTORY: usize = 10;

/// Identifying data observed on one login. `device_info` is already normalized.
#[derive(Debug, Clone, Copy, Default)]
pub struct Probe<'a> {
    pub ip: &'a str,
    pub real_device_id: &'a str,
    pub device_info: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRecord {
    pub device_id: String,
    pub role_id: i64,
    pub ips: Vec<String>,
    pub real_device_ids: Vec<String>,
    pub device_infos: Vec<String>,
}

impl IdentityRecord {
    pub fn new(device_id: impl Into<String>, role_id: i64) -> Self {
        Self {
            device_id: device_id.into(),
            role_id,
            ..Default::default()
        }
    }

    /// Score of a login against this record when it is for a different device.
    pub fn relation_score(&self, probe: &Probe<'_>) -> u32 {
        let mut score = 0;
        if seen(&self.ips, probe.ip) {
            score += IP_WEIGHT;
        }
        if seen(&self.real_device_ids, probe.real_device_id) {
            score += REAL_DEVICE_ID_WEIGHT;
        }
        score
    }

    /// Score of a login against this record when it is for the same device.
    pub fn own_score(&self, probe: &Probe<'_>) -> u32 {
        DEVICE_ID_WEIGHT + self.relation_score(probe)
    }

    /// Append the probe's values to the histories. Returns whether anything changed.
    ///
    /// A new distinct value in a dimension that already holds [`MAX_HISTORY`]
    /// values is an anomaly and leaves the record untouched.
    pub fn observe(&mut self, probe: &Probe<'_>) -> Result<bool, QuotaError> {
        let dimensions = [
            (&self.ips, probe.ip, "ip"),
            (&self.real_device_ids, probe.real_device_id, "realDeviceID"),
            (&self.device_infos, probe.device_info, "deviceInfo"),
        ];
        for (history, value, dimension) in dimensions {
            if is_new(history, value) && history.len() >= MAX_HISTORY {
                return Err(QuotaError::IdentityAnomaly(format!(
                    "device {} exceeded {MAX_HISTORY} distinct {dimension} values",
                    self.device_id
                )));
            }
        }

        let mut changed = false;
        changed |= push_new(&mut self.ips, probe.ip);
        changed |= push_new(&mut self.real_device_ids, probe.real_device_id);
        changed |= push_new(&mut self.device_infos, probe.device_info);
        Ok(changed)
    }
}

fn seen(history: &[String], value: &str) -> bool {
    !value.is_empty() && history.iter().any(|known| known == value)
}

fn is_new(history: &[String], value: &str) -> bool {
    !value.is_empty() && !history.iter().any(|known| known == value)
}

fn push_new(history: &mut Vec<String>, value: &str) -> bool {
    if is_new(history, value) {
        history.push(value.to_string());
        true
    } else {
        false
    }
}

impl From<IdentityRow> for IdentityRecord {
    fn from(row: IdentityRow) -> Self {
        Self {
            device_id: row.device_id,
            role_id: row.role_id,
            ips: row.ips,
            real_device_ids: row.real_device_ids,
            device_infos: row.device_infos,
        }
    }
}

impl From<IdentityRecord> for IdentityRow {
    fn from(record: IdentityRecord) -> Self {
        Self {
            device_id: record.device_id,
            role_id: record.role_id,
            ips: record.ips,
            real_device_ids: record.real_device_ids,
            device_infos: record.device_infos,
        }
    }
}

/// In-memory identity table used for the alias scan.
#[derive(Default)]
pub struct IdentityRegistry {
    records: HashMap<String, IdentityRecord>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, device_id: &str) -> Option<IdentityRecord> {
        self.records
            .read_async(device_id, |_, record| record.clone())
            .await
    }

    pub async fn upsert(&self, record: IdentityRecord) {
        match self.records.entry_async(record.device_id.clone()).await {
            Entry::Occupied(mut entry) => *entry.get_mut() = record,
            Entry::Vacant(entry) => {
                entry.insert_entry(record);
            }
        }
    }

    /// Replace the table with a full scan from the store.
    pub async fn replace_all(&self, rows: Vec<IdentityRow>) {
        let fresh: std::collections::HashSet<String> =
            rows.iter().map(|row| row.device_id.clone()).collect();

        self.records
            .retain_async(|device_id, _| fresh.contains(device_id))
            .await;

        for row in rows {
            self.upsert(row.into()).await;
        }
    }

    /// Other devices whose relation score reaches [`RELATION_THRESHOLD`], with their scores.
    pub async fn aliases(&self, device_id: &str, probe: &Probe<'_>) -> Vec<(String, u32)> {
        let mut aliases = Vec::new();

        self.records
            .iter_async(|other, record| {
                if other != device_id {
                    let score = record.relation_score(probe);
                    if score >= RELATION_THRESHOLD {
                        aliases.push((other.clone(), score));
                    }
                }
                true
            })
            .await;

        aliases
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
