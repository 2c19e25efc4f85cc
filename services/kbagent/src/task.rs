//! Task runner.
//!
//! The only task so far is `newReplica`: stream a donor's `dataDump` output
//! into the local `dataLoad` action.

use std::sync::Arc;

use chrono::Utc;
use kbagent_proto::{
    ActionError, ActionRequest, NewReplicaTask, Task, TaskEvent, DATA_DUMP_ACTION,
    DATA_LOAD_ACTION, PROBE_FAILURE_CODE, PROBE_SUCCESS_CODE, TASK_EVENT_REASON,
};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::action::ActionService;
use crate::event::EventSender;
use crate::executor::{ActionIo, OutputBuffer};
use crate::streaming;

/// Completion of a task.
pub type TaskResult = oneshot::Receiver<Result<(), ActionError>>;

#[derive(Clone)]
pub struct TaskService {
    instance: String,
    actions: Arc<ActionService>,
    sender: Arc<dyn EventSender>,
}

impl TaskService {
    pub fn new(
        instance: impl Into<String>,
        actions: Arc<ActionService>,
        sender: Arc<dyn EventSender>,
    ) -> Self {
        Self {
            instance: instance.into(),
            actions,
            sender,
        }
    }

    /// Starts `task` in the background.
    ///
    /// Malformed tasks are rejected before anything runs.
    pub fn run(&self, task: Task) -> Result<TaskResult, ActionError> {
        let replica = task.new_replica.clone().ok_or_else(|| {
            ActionError::not_implemented(format!("task {} is not supported", task.task))
        })?;
        if replica.remote.is_empty() || replica.port <= 0 {
            return Err(ActionError::bad_request(
                "new replica task requires a remote host and port",
            ));
        }
        let port = u16::try_from(replica.port)
            .map_err(|_| ActionError::bad_request(format!("invalid port {}", replica.port)))?;
        if !self.actions.contains(DATA_LOAD_ACTION) {
            return Err(ActionError::not_defined(format!(
                "action {DATA_LOAD_ACTION} is not defined"
            )));
        }

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let start_time = Utc::now();
            info!(task = %task.task, uid = %task.uid, remote = %replica.remote, "task started");

            let result = this.new_replica(&replica, port).await;
            match &result {
                Ok(()) => info!(task = %task.task, uid = %task.uid, "task finished"),
                Err(err) => warn!(task = %task.task, uid = %task.uid, error = %err, "task failed"),
            }

            if task.notify_at_finish {
                let event = TaskEvent {
                    instance: this.instance.clone(),
                    task: task.task.clone(),
                    uid: task.uid.clone(),
                    replicas: replica.replicas.clone(),
                    start_time,
                    end_time: Some(Utc::now()),
                    code: if result.is_ok() {
                        PROBE_SUCCESS_CODE
                    } else {
                        PROBE_FAILURE_CODE
                    },
                    message: result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
                };
                this.notify(&event).await;
            }

            let _ = tx.send(result);
        });
        Ok(rx)
    }

    /// Starts every task, logging the ones that cannot run.
    pub fn start(&self, tasks: Vec<Task>) {
        for task in tasks {
            let name = task.task.clone();
            if let Err(err) = self.run(task) {
                warn!(task = %name, error = %err, "failed to start task");
            }
        }
    }

    async fn new_replica(&self, replica: &NewReplicaTask, port: u16) -> Result<(), ActionError> {
        let handshake = ActionRequest {
            action: DATA_DUMP_ACTION.to_string(),
            parameters: replica.parameters.clone(),
            timeout_seconds: replica.timeout_seconds,
            ..Default::default()
        };
        let stream = streaming::connect(&replica.remote, port, &handshake).await?;

        let stderr = OutputBuffer::default();
        let io = ActionIo::default()
            .with_stdin(stream)
            .with_stderr(stderr.clone());
        let handle = self.actions.call_action_with_io(
            DATA_LOAD_ACTION,
            &replica.parameters,
            replica.timeout_seconds,
            io,
        )?;

        handle.wait().await.map_err(|err| {
            let stderr = stderr.to_string_lossy();
            if stderr.is_empty() {
                err
            } else {
                err.context(format_args!("stderr: {stderr}"))
            }
        })
    }

    async fn notify(&self, event: &TaskEvent) {
        let message = match serde_json::to_string(event) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to encode task event");
                return;
            }
        };
        if let Err(e) = self.sender.send(TASK_EVENT_REASON, &message).await {
            warn!(task = %event.task, uid = %event.uid, error = %e, "failed to send task event");
        }
    }
}
