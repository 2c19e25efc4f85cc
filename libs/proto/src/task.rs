//! Tasks run by the agent on behalf of the controller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Action a donor runs to stream its data out.
pub const DATA_DUMP_ACTION: &str = "dataDump";

/// Action a new replica runs to consume a donor's stream.
pub const DATA_LOAD_ACTION: &str = "dataLoad";

/// Reason attached to task completion events.
pub const TASK_EVENT_REASON: &str = "task";

/// A unit of work scheduled on the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default)]
    pub instance: String,

    /// Task name, e.g. `newReplica`.
    pub task: String,

    #[serde(default)]
    pub uid: String,

    /// Report completion through the event sink.
    #[serde(default)]
    pub notify_at_finish: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_replica: Option<NewReplicaTask>,
}

/// Seeds a new replica from a donor over the streaming protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReplicaTask {
    /// Donor host.
    #[serde(default)]
    pub remote: String,

    /// Donor streaming port.
    #[serde(default)]
    pub port: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub replicas: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
}

/// Completion report of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub instance: String,

    pub task: String,

    pub uid: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub replicas: String,

    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    pub code: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_deserialization() {
        let json = r#"{
            "task": "newReplica",
            "uid": "3f1c",
            "notifyAtFinish": true,
            "newReplica": {
                "remote": "mysql-0.mysql-headless",
                "port": 3502,
                "replicas": "mysql-2",
                "parameters": {"KB_ACCOUNT_NAME": "root"}
            }
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert!(task.notify_at_finish);
        let replica = task.new_replica.unwrap();
        assert_eq!(replica.remote, "mysql-0.mysql-headless");
        assert_eq!(replica.port, 3502);
        assert_eq!(replica.parameters["KB_ACCOUNT_NAME"], "root");
    }
}
