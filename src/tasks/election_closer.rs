use crate::db::VoteStore;
use chrono::Utc;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Closes elections whose end time has passed, every `every`, until cancelled.
pub async fn check_expired_elections_task(store: Arc<dyn VoteStore>, every: Duration, cancel: CancellationToken) {
    info!("Starting background task to close expired elections...");
    let mut interval = interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Stopping expired election task");
                break;
            }
            _ = interval.tick() => {}
        }
        let now = Utc::now();
        debug!("Checking for expired elections at {}", now.to_rfc3339());

        match store.close_expired_elections(now).await {
            Ok(closed) => {
                if !closed.is_empty() {
                    info!("Closed {} expired election(s).", closed.len());
                }
                for election_id in closed {
                    info!("Election {} has ended", election_id);
                }
            }
            Err(e) => {
                error!("Failed to close expired elections: {}", e);
            }
        }
    }
}
