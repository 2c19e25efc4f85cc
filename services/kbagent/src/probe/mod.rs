//! Probe service.
//!
//! Each probe gets two tasks: a runner that invokes the probe's action on a
//! fixed period and debounces the results through [`ProbeState`], and a
//! reporter that delivers the latest event to the [`EventSender`]. The two
//! share a single-slot `watch` channel, so a slow sink only ever sees the
//! newest event.

mod reporter;
mod state;

use std::sync::Arc;

use kbagent_proto::{ActionRequest, Probe, ProbeEvent, ProtoError, RetryPolicy};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::action::ActionService;
use crate::event::EventSender;

pub use reporter::{run_reporter, SEND_RETRY_INTERVAL};
pub use state::ProbeState;

pub struct ProbeService {
    instance: String,
    probes: Vec<Probe>,
    actions: Arc<ActionService>,
    sender: Arc<dyn EventSender>,
}

impl ProbeService {
    /// Fails if a probe references an action that is not registered.
    pub fn new(
        instance: impl Into<String>,
        probes: Vec<Probe>,
        actions: Arc<ActionService>,
        sender: Arc<dyn EventSender>,
    ) -> Result<Self, ProtoError> {
        for probe in &probes {
            if !actions.contains(&probe.action) {
                return Err(ProtoError::UndefinedProbeAction {
                    probe: probe.name().to_string(),
                    action: probe.action.clone(),
                });
            }
        }
        Ok(Self {
            instance: instance.into(),
            probes,
            actions,
            sender,
        })
    }

    /// Spawns the runner and reporter of every probe.
    pub fn start(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.probes.len() * 2);
        for probe in &self.probes {
            let (tx, rx) = watch::channel(None);
            let state = ProbeState::new(
                self.instance.clone(),
                probe.name(),
                probe.success_threshold(),
                probe.failure_threshold(),
            );

            info!(
                probe = %probe.name(),
                period_secs = probe.period().as_secs(),
                initial_delay_secs = probe.initial_delay().as_secs(),
                "starting probe"
            );

            handles.push(tokio::spawn(run_probe(
                probe.clone(),
                Arc::clone(&self.actions),
                state,
                tx,
                shutdown.clone(),
            )));
            handles.push(tokio::spawn(run_reporter(
                probe.name().to_string(),
                rx,
                Arc::clone(&self.sender),
                probe.report_period(),
                SEND_RETRY_INTERVAL,
                shutdown.clone(),
            )));
        }
        handles
    }
}

/// Ticks one probe until shutdown.
///
/// Ticks are sequential; each invokes the action once without retries.
pub async fn run_probe(
    probe: Probe,
    actions: Arc<ActionService>,
    mut state: ProbeState,
    events: watch::Sender<Option<ProbeEvent>>,
    shutdown: CancellationToken,
) {
    tokio::select! {
        _ = tokio::time::sleep(probe.initial_delay()) => {}
        _ = shutdown.cancelled() => return,
    }

    let mut ticker = tokio::time::interval(probe.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let request = ActionRequest {
        action: probe.action.clone(),
        retry_policy: Some(RetryPolicy::NONE),
        ..Default::default()
    };

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => {
                debug!(probe = %probe.name(), "probe shutting down");
                return;
            }
        }

        let event = match actions.handle_request(&request).await {
            Ok(output) => state.on_success(output),
            Err(err) => {
                debug!(probe = %probe.name(), error = %err, "probe failed");
                state.on_failure(err.to_string())
            }
        };

        if let Some(event) = event {
            debug!(probe = %probe.name(), code = event.code, "probe event");
            events.send_replace(Some(event));
        }
    }
}
