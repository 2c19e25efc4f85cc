//! Delivery of probe events to the event sink.

use std::sync::Arc;
use std::time::Duration;

use kbagent_proto::ProbeEvent;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::EventSender;

/// Delay between attempts to deliver an event the sink rejected.
pub const SEND_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Forwards the latest event of one probe to `sender`.
///
/// A newer event supersedes one still being retried. With a heartbeat
/// period, the last delivered event is re-sent on that period.
pub async fn run_reporter(
    probe: String,
    mut events: watch::Receiver<Option<ProbeEvent>>,
    sender: Arc<dyn EventSender>,
    heartbeat: Option<Duration>,
    retry_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut heartbeat = heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let mut pending: Option<ProbeEvent> = None;
    let mut delivered: Option<ProbeEvent> = None;

    loop {
        let retrying = pending.is_some();
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(probe = %probe, "probe reporter shutting down");
                return;
            }
            changed = events.changed() => {
                if changed.is_err() {
                    return;
                }
                pending = events.borrow_and_update().clone();
            }
            _ = next_tick(&mut heartbeat), if !retrying => {
                pending = delivered.clone();
            }
            _ = tokio::time::sleep(retry_interval), if retrying => {}
        }

        let Some(event) = pending.take() else {
            continue;
        };
        match send(sender.as_ref(), &probe, &event).await {
            Ok(()) => delivered = Some(event),
            Err(e) => {
                warn!(probe = %probe, error = %e, "failed to send probe event, will retry");
                pending = Some(event);
            }
        }
    }
}

async fn send(sender: &dyn EventSender, probe: &str, event: &ProbeEvent) -> anyhow::Result<()> {
    let message = serde_json::to_string(event)?;
    sender.send(probe, &message).await
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
