use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Run `job` every `period` until `shutdown` flips to true. The first run is
/// immediate and a running job is never interrupted.
pub async fn every<F, Fut>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(task = name, period_secs = period.as_secs(), "Scheduled task started");

    loop {
        let stopping = *shutdown.borrow();
        if stopping {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => job().await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(task = name, "Scheduled task stopped");
}
