//! Action executor.
//!
//! Runs a single [`Action`] over its transport (exec, HTTP or gRPC) on a
//! spawned task and hands back an [`ActionHandle`] that yields exactly one
//! result.
//!
//! ## Deadlines and cancellation
//!
//! Every call is bounded. The deadline is the per-call override, else the
//! action's own `timeoutSeconds`, else [`DEFAULT_ACTION_CALL_TIMEOUT`], and is
//! never longer than [`MAX_ACTION_CALL_TIMEOUT`]. When the deadline passes, or
//! the caller's token is cancelled, the transport future is dropped: the
//! subprocess is killed and in-flight HTTP/gRPC requests are aborted.

mod exec;
mod grpc;
mod http;
mod template;

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use kbagent_proto::{Action, ActionError, ErrorKind, Transport};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use grpc::{ReflectionInvoker, RpcFields, RpcInvoker, RpcTarget};
pub use template::render_template;

/// Deadline applied when neither the request nor the action sets one.
pub const DEFAULT_ACTION_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on any action call.
pub const MAX_ACTION_CALL_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_MAX_IDLE_CONNECTIONS_PER_HOST: usize = 20;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Streams wired to an action. Absent streams are treated as null devices.
#[derive(Default)]
pub struct ActionIo {
    pub stdin: Option<BoxReader>,
    pub stdout: Option<BoxWriter>,
    pub stderr: Option<BoxWriter>,
}

impl ActionIo {
    pub fn with_stdin(mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn with_stdout(mut self, stdout: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    pub fn with_stderr(mut self, stderr: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }
}

/// Handle to an action running in the background.
pub struct ActionHandle {
    rx: oneshot::Receiver<Result<(), ActionError>>,
    cancel: CancellationToken,
}

impl ActionHandle {
    /// Waits for the action to finish.
    pub async fn wait(self) -> Result<(), ActionError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(closed_unexpectedly()))
    }

    /// Returns the result if the action has finished, without waiting.
    ///
    /// The result is handed out once; later calls report an internal error.
    pub fn try_result(&mut self) -> Option<Result<(), ActionError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(closed_unexpectedly())),
        }
    }

    /// Aborts the action, releasing whatever it holds.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn closed_unexpectedly() -> ActionError {
    ActionError::internal("runtime error: result channel closed unexpectedly")
}

/// In-memory sink collecting an action's output.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl AsyncWrite for OutputBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Resolves the effective deadline of a call.
///
/// Non-positive values select the upper bound.
pub fn call_timeout(timeout_seconds: Option<i32>) -> Duration {
    match timeout_seconds {
        None => DEFAULT_ACTION_CALL_TIMEOUT,
        Some(secs) if secs > 0 => Duration::from_secs(secs as u64).min(MAX_ACTION_CALL_TIMEOUT),
        Some(_) => MAX_ACTION_CALL_TIMEOUT,
    }
}

/// Runs actions over their transports.
///
/// Clients are injected so tests can substitute the gRPC invoker.
#[derive(Clone)]
pub struct ActionExecutor {
    http: reqwest::Client,
    rpc: Arc<dyn RpcInvoker>,
}

impl ActionExecutor {
    pub fn new(http: reqwest::Client, rpc: Arc<dyn RpcInvoker>) -> Self {
        Self { http, rpc }
    }

    /// Creates an executor with the default HTTP client and the
    /// reflection-backed gRPC invoker.
    pub fn with_defaults() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .tcp_keepalive(DEFAULT_KEEP_ALIVE)
            .pool_idle_timeout(DEFAULT_IDLE_CONN_TIMEOUT)
            .pool_max_idle_per_host(DEFAULT_MAX_IDLE_CONNECTIONS_PER_HOST)
            .build()?;
        Ok(Self::new(http, Arc::new(ReflectionInvoker::new())))
    }

    /// Starts `action` in the background.
    ///
    /// Errors detected before anything runs (bad templates, malformed
    /// requests) are returned directly; everything else arrives through the
    /// handle.
    pub fn call_action_x(
        &self,
        action: &Action,
        parameters: &HashMap<String, String>,
        timeout_seconds: Option<i32>,
        io: ActionIo,
        parent: &CancellationToken,
    ) -> Result<ActionHandle, ActionError> {
        let transport = action
            .transport()
            .ok_or_else(|| ActionError::bad_request("invalid action type"))?;
        let deadline = call_timeout(timeout_seconds.or(action.timeout_seconds));

        let call: BoxFuture<'static, Result<(), ActionError>> = match transport {
            Transport::Exec(spec) => {
                let command = exec::command(spec, parameters, &io)?;
                Box::pin(exec::run(command, io))
            }
            Transport::Http(spec) => {
                let request = http::request(&self.http, spec, parameters)?;
                Box::pin(http::run(self.http.clone(), request, io))
            }
            Transport::Grpc(spec) => {
                let call = grpc::GrpcCall::new(spec, parameters)?;
                Box::pin(call.run(Arc::clone(&self.rpc), io))
            }
        };

        let (tx, rx) = oneshot::channel();
        let cancel = parent.child_token();
        let token = cancel.clone();
        let name = action.name.clone();
        let kind = transport.as_str();

        tokio::spawn(async move {
            let result = tokio::select! {
                result = call => result,
                _ = tokio::time::sleep(deadline) => Err(ActionError::timed_out()),
                _ = token.cancelled() => Err(ActionError::internal("action call canceled")),
            };
            match &result {
                Ok(()) => debug!(action = %name, transport = kind, "action call finished"),
                Err(err) => debug!(action = %name, transport = kind, error = %err, "action call failed"),
            }
            let _ = tx.send(result);
        });

        Ok(ActionHandle { rx, cancel })
    }

    /// Runs `action` and waits for its output.
    ///
    /// Anything the action wrote to stderr is attached to the error.
    pub async fn blocking_call_action(
        &self,
        action: &Action,
        parameters: &HashMap<String, String>,
        timeout_seconds: Option<i32>,
        parent: &CancellationToken,
    ) -> Result<Vec<u8>, ActionError> {
        let stdout = OutputBuffer::default();
        let stderr = OutputBuffer::default();
        let io = ActionIo::default()
            .with_stdout(stdout.clone())
            .with_stderr(stderr.clone());

        let handle = self.call_action_x(action, parameters, timeout_seconds, io, parent)?;
        match handle.wait().await {
            Ok(()) => Ok(stdout.contents()),
            Err(err) => {
                let stderr = stderr.to_string_lossy();
                if stderr.is_empty() || err.kind == ErrorKind::TimedOut {
                    Err(err)
                } else {
                    Err(err.context(format_args!("stderr: {stderr}")))
                }
            }
        }
    }
}

/// Writes `bytes` to an optional sink.
async fn write_sink(sink: &mut Option<BoxWriter>, bytes: &[u8]) -> io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(sink) = sink.as_mut() {
        if !bytes.is_empty() {
            sink.write_all(bytes).await?;
            sink.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use kbagent_proto::ExecAction;

    use super::*;

    fn exec_action(name: &str, commands: &[&str]) -> Action {
        Action {
            name: name.to_string(),
            exec: Some(ExecAction {
                commands: commands.iter().map(|s| s.to_string()).collect(),
                args: Vec::new(),
            }),
            ..Default::default()
        }
    }

    async fn poll_until_done(handle: &mut ActionHandle) -> Result<(), ActionError> {
        loop {
            if let Some(result) = handle.try_result() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_call_timeout_resolution() {
        assert_eq!(call_timeout(None), DEFAULT_ACTION_CALL_TIMEOUT);
        assert_eq!(call_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(call_timeout(Some(600)), MAX_ACTION_CALL_TIMEOUT);
        assert_eq!(call_timeout(Some(0)), MAX_ACTION_CALL_TIMEOUT);
        assert_eq!(call_timeout(Some(-1)), MAX_ACTION_CALL_TIMEOUT);
    }

    #[tokio::test]
    async fn test_output_buffer_collects_writes() {
        use tokio::io::AsyncWriteExt;

        let buffer = OutputBuffer::default();
        let mut writer = buffer.clone();
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        assert_eq!(buffer.to_string_lossy(), "hello world");
    }

    #[tokio::test]
    async fn test_try_result_polls_until_finished() {
        let executor = ActionExecutor::with_defaults().unwrap();
        let action = exec_action("nap", &["/bin/sleep", "0.2"]);
        let mut handle = executor
            .call_action_x(
                &action,
                &HashMap::new(),
                None,
                ActionIo::default(),
                &CancellationToken::new(),
            )
            .unwrap();

        assert!(handle.try_result().is_none());
        poll_until_done(&mut handle).await.unwrap();

        // The result is handed out once.
        let err = handle.try_result().unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_call() {
        let executor = ActionExecutor::with_defaults().unwrap();
        let action = exec_action("nap", &["/bin/sleep", "10"]);
        let mut handle = executor
            .call_action_x(
                &action,
                &HashMap::new(),
                None,
                ActionIo::default(),
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(handle.try_result().is_none());

        handle.cancel();
        let err = tokio::time::timeout(Duration::from_secs(2), poll_until_done(&mut handle))
            .await
            .expect("canceled call did not finish")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert_eq!(err.message, "action call canceled");
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_the_call() {
        let executor = ActionExecutor::with_defaults().unwrap();
        let action = exec_action("nap", &["/bin/sleep", "10"]);
        let parent = CancellationToken::new();
        let handle = executor
            .call_action_x(&action, &HashMap::new(), None, ActionIo::default(), &parent)
            .unwrap();

        parent.cancel();
        let err = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("canceled call did not finish")
            .unwrap_err();
        assert_eq!(err.message, "action call canceled");
    }
}
