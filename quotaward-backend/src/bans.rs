use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use quotaward_db::BanCategory;
use tracing::{debug, warn};

use crate::device_info::DeviceInfoNormalizer;
use crate::error::RefreshError;
use crate::scheduler::Reload;
use crate::snapshot::Snapshot;
use crate::store::Store;

/// One ban dimension: its current set plus whether a load ever succeeded.
struct BanSet {
    category: BanCategory,
    values: Snapshot<HashSet<String>>,
    degraded_reported: AtomicBool,
}

impl BanSet {
    fn new(category: BanCategory) -> Self {
        Self {
            category,
            values: Snapshot::default(),
            degraded_reported: AtomicBool::new(false),
        }
    }

    fn contains(&self, value: &str) -> bool {
        !value.is_empty() && self.values.load().contains(value)
    }
}

/// In-memory mirror of the four ban tables.
pub struct BanRegistry {
    store: Arc<dyn Store>,
    normalizer: Arc<dyn DeviceInfoNormalizer>,
    sets: [BanSet; 4],
}

impl BanRegistry {
    pub fn new(store: Arc<dyn Store>, normalizer: Arc<dyn DeviceInfoNormalizer>) -> Self {
        Self {
            store,
            normalizer,
            sets: BanCategory::ALL.map(BanSet::new),
        }
    }

    fn set(&self, category: BanCategory) -> &BanSet {
        // Same order as `BanCategory::ALL`
        let index = match category {
            BanCategory::Ip => 0,
            BanCategory::DeviceId => 1,
            BanCategory::RealDeviceId => 2,
            BanCategory::DeviceInfo => 3,
        };
        &self.sets[index]
    }

    pub fn check_ip_banned(&self, ip: &str) -> bool {
        self.set(BanCategory::Ip).contains(ip)
    }

    pub fn check_device_id_banned(&self, device_id: &str) -> bool {
        self.set(BanCategory::DeviceId).contains(device_id)
    }

    pub fn check_real_device_id_banned(&self, real_device_id: &str) -> bool {
        self.set(BanCategory::RealDeviceId).contains(real_device_id)
    }

    /// Compares the normalized form against the normalized ban set.
    pub fn check_device_info_banned(&self, device_info: &str) -> bool {
        if device_info.is_empty() {
            return false;
        }
        let normalized = self.normalizer.normalize(device_info);
        self.set(BanCategory::DeviceInfo).contains(&normalized)
    }

    /// Reload one category, keeping the previous generation on failure.
    async fn reload_category(&self, set: &BanSet) -> Result<usize, RefreshError> {
        let values = match self.store.load_bans(set.category).await {
            Ok(values) => values,
            Err(source) => {
                if !set.values.is_published() && !set.degraded_reported.swap(true, Ordering::AcqRel)
                {
                    warn!(
                        category = set.category.as_str(),
                        "ban list never loaded, serving an empty set"
                    );
                }
                return Err(RefreshError::new("bans", source));
            }
        };

        let values: HashSet<String> = match set.category {
            BanCategory::DeviceInfo => values
                .iter()
                .map(|raw| self.normalizer.normalize(raw).into_owned())
                .collect(),
            _ => values.into_iter().collect(),
        };

        let count = values.len();
        set.values.publish(values);
        Ok(count)
    }
}

#[async_trait]
impl Reload for BanRegistry {
    fn name(&self) -> &'static str {
        "bans"
    }

    /// Each category is replaced independently; one failing table doesn't hold back the others.
    async fn reload(&self) -> Result<(), RefreshError> {
        let mut first_error = None;

        for set in &self.sets {
            match self.reload_category(set).await {
                Ok(count) => debug!(category = set.category.as_str(), count, "ban list loaded"),
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
