//! Action definitions and the request/response envelope.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ActionError, ErrorKind, ProtoError};

/// A named unit of work with exactly one transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<GrpcAction>,

    /// Default deadline for a call, overridable per request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,

    /// Default retry policy, overridable per request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

/// Borrowed view of the single transport an action uses.
#[derive(Debug, Clone, Copy)]
pub enum Transport<'a> {
    Exec(&'a ExecAction),
    Http(&'a HttpAction),
    Grpc(&'a GrpcAction),
}

impl Transport<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Exec(_) => "exec",
            Transport::Http(_) => "http",
            Transport::Grpc(_) => "grpc",
        }
    }
}

impl Action {
    /// Returns the configured transport, or `None` unless exactly one is set.
    pub fn transport(&self) -> Option<Transport<'_>> {
        match (&self.exec, &self.http, &self.grpc) {
            (Some(exec), None, None) => Some(Transport::Exec(exec)),
            (None, Some(http), None) => Some(Transport::Http(http)),
            (None, None, Some(grpc)) => Some(Transport::Grpc(grpc)),
            _ => None,
        }
    }

    /// Checks the invariants an action must hold before it is registered.
    pub fn validate(&self) -> Result<(), ProtoError> {
        let invalid = |reason: &str| ProtoError::InvalidAction {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("name is required"));
        }
        match self.transport() {
            None => Err(invalid("exactly one of exec, http or grpc must be set")),
            Some(Transport::Exec(exec)) if exec.commands.is_empty() => {
                Err(invalid("exec action has no command"))
            }
            Some(Transport::Http(http)) if http.port.is_empty() => {
                Err(invalid("http action has no port"))
            }
            Some(Transport::Grpc(grpc))
                if grpc.port.is_empty() || grpc.service.is_empty() || grpc.method.is_empty() =>
            {
                Err(invalid("grpc action requires port, service and method"))
            }
            Some(_) => Ok(()),
        }
    }
}

/// Runs a command inside the agent's container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecAction {
    /// Program followed by its leading arguments.
    #[serde(default)]
    pub commands: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Issues an HTTP request against a local or remote endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpAction {
    pub port: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    /// Header values may reference parameters with `{{ .NAME }}`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeader>,

    /// Request body; may reference parameters with `{{ .NAME }}`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// Calls a unary gRPC method resolved through server reflection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcAction {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    pub port: String,

    /// Fully qualified service name, e.g. `pkg.v1.Engine`.
    pub service: String,

    pub method: String,

    /// Request field name to templated value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request: BTreeMap<String, String>,

    #[serde(default)]
    pub response: GrpcResponse,
}

/// Names of the response fields the agent interprets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrpcResponse {
    /// A non-empty value in this field marks the call as failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    /// Field copied to the action output.
    #[serde(default, alias = "message", skip_serializing_if = "String::is_empty")]
    pub output: String,
}

/// Retry behaviour around a single invocation.
///
/// `max_retries` counts retries, so a call is attempted `max_retries + 1`
/// times in total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: i32,

    /// Delay between attempts, in milliseconds.
    #[serde(default)]
    pub retry_interval: i64,
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub const NONE: RetryPolicy = RetryPolicy {
        max_retries: 0,
        retry_interval: 0,
    };

    pub fn attempts(&self) -> u32 {
        self.max_retries.max(0) as u32 + 1
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval.max(0) as u64)
    }
}

/// Body of `POST /v1.0/action` and of a streaming handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_blocking: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking.unwrap_or(false)
    }
}

/// Response of `POST /v1.0/action`. An empty `error` means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(
        default,
        with = "crate::base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub output: Vec<u8>,
}

impl ActionResponse {
    pub fn success(output: Vec<u8>) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn failure(err: &ActionError) -> Self {
        Self {
            error: err.kind.as_str().to_string(),
            message: err.message.clone(),
            output: Vec::new(),
        }
    }

    /// Converts back into the caller-facing result.
    pub fn into_result(self) -> Result<Vec<u8>, ActionError> {
        if self.error.is_empty() {
            Ok(self.output)
        } else {
            Err(ActionError::new(ErrorKind::parse(&self.error), self.message))
        }
    }
}

impl From<Result<Vec<u8>, ActionError>> for ActionResponse {
    fn from(result: Result<Vec<u8>, ActionError>) -> Self {
        match result {
            Ok(output) => ActionResponse::success(output),
            Err(err) => ActionResponse::failure(&err),
        }
    }
}
