use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ledger::PlaytimeLedger;
use super::policy::next_reset_after;

/// Spawn the loop that resets every cached record at the configured hour each day.
///
/// The reset hour is re-read from the ledger's policy before every wait. The next
/// boundary is always after the one just handled, even if `clock` lags behind.
pub fn spawn_daily_reset<C>(
    ledger: Arc<PlaytimeLedger>,
    cancellation_token: CancellationToken,
    clock: C,
) -> JoinHandle<()>
where
    C: Fn() -> DateTime<Utc> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut previous: Option<DateTime<Utc>> = None;
        loop {
            let now = clock();
            let from = previous.map_or(now, |boundary| now.max(boundary));
            let next = next_reset_after(from, ledger.policy().reset_hour);
            let wait = (next - now).to_std().unwrap_or_default();
            debug!(%next, "scheduled daily playtime reset");

            if cancellation_token
                .run_until_cancelled(sleep(wait))
                .await
                .is_none()
            {
                break;
            }

            let reset = ledger.daily_reset(clock().timestamp()).await;
            info!(records = reset, "daily playtime reset done");
            previous = Some(next);
        }

        debug!("daily reset loop stopped");
    })
}
