//! Daily playtime quotas.

mod ledger;
mod login;
mod policy;
mod record;
mod reset;

pub use ledger::{BonusReport, FlushReport, PlaytimeLedger};
pub use login::LoginAttempt;
pub use policy::{PlaytimeSettings, load_policy, next_reset_after};
pub use record::PlaytimeRecord;
pub use reset::spawn_daily_reset;
