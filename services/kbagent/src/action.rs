//! Action registry and dispatcher.
//!
//! Owns the immutable set of actions the agent was started with and routes
//! requests to the executor, applying retry policies and the non-blocking
//! mode.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use kbagent_proto::{Action, ActionError, ActionRequest, ProtoError, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{ActionExecutor, ActionHandle, ActionIo};

/// Dispatches requests to the registered actions.
pub struct ActionService {
    actions: HashMap<String, Action>,
    executor: ActionExecutor,
    /// Actions with a non-blocking call in flight.
    in_flight: Arc<Mutex<HashSet<String>>>,
    shutdown: CancellationToken,
}

impl ActionService {
    /// Builds the registry. Action names must be unique and every action
    /// must be well formed.
    pub fn new(
        actions: Vec<Action>,
        executor: ActionExecutor,
        shutdown: CancellationToken,
    ) -> Result<Self, ProtoError> {
        let mut registry = HashMap::with_capacity(actions.len());
        for action in actions {
            action.validate()?;
            if registry.contains_key(&action.name) {
                return Err(ProtoError::DuplicateAction(action.name));
            }
            registry.insert(action.name.clone(), action);
        }

        info!(actions = registry.len(), "action service initialized");

        Ok(Self {
            actions: registry,
            executor,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    fn lookup(&self, name: &str) -> Result<&Action, ActionError> {
        self.actions
            .get(name)
            .ok_or_else(|| ActionError::not_defined(format!("action {name} is not defined")))
    }

    /// Handles a request/response call.
    ///
    /// Blocking requests return the action's stdout. Non-blocking requests
    /// start the action and return empty output at once; a second
    /// non-blocking request for the same action while the first is running
    /// is rejected as in progress.
    pub async fn handle_request(&self, request: &ActionRequest) -> Result<Vec<u8>, ActionError> {
        let action = self.lookup(&request.action)?;

        if request.is_non_blocking() {
            return self.start_non_blocking(action, request);
        }

        let policy = request
            .retry_policy
            .or(action.retry_policy)
            .unwrap_or(RetryPolicy::NONE);
        let attempts = policy.attempts();

        let mut attempt = 1;
        loop {
            let result = self
                .executor
                .blocking_call_action(
                    action,
                    &request.parameters,
                    request.timeout_seconds,
                    &self.shutdown,
                )
                .await;

            match result {
                Ok(output) => return Ok(output),
                Err(err) if attempt < attempts && err.is_retryable() => {
                    warn!(
                        action = %action.name,
                        attempt,
                        attempts,
                        error = %err,
                        "action call failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(policy.interval()) => {}
                        _ = self.shutdown.cancelled() => {
                            return Err(ActionError::internal("action call canceled"));
                        }
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn start_non_blocking(
        &self,
        action: &Action,
        request: &ActionRequest,
    ) -> Result<Vec<u8>, ActionError> {
        let name = action.name.clone();
        if !lock(&self.in_flight).insert(name.clone()) {
            return Err(ActionError::in_progress(format!(
                "action {name} is already running"
            )));
        }

        let handle = match self.executor.call_action_x(
            action,
            &request.parameters,
            request.timeout_seconds,
            ActionIo::default(),
            &self.shutdown,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                lock(&self.in_flight).remove(&name);
                return Err(err);
            }
        };

        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(()) => debug!(action = %name, "non-blocking action finished"),
                Err(err) => warn!(action = %name, error = %err, "non-blocking action failed"),
            }
            lock(&in_flight).remove(&name);
        });

        Ok(Vec::new())
    }

    /// Starts a registered action with caller-supplied streams.
    pub fn call_action_with_io(
        &self,
        name: &str,
        parameters: &HashMap<String, String>,
        timeout_seconds: Option<i32>,
        io: ActionIo,
    ) -> Result<ActionHandle, ActionError> {
        let action = self.lookup(name)?;
        self.executor
            .call_action_x(action, parameters, timeout_seconds, io, &self.shutdown)
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}
