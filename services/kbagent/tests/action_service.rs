//! Integration tests for the action service over the exec transport.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use kbagent::{ActionExecutor, ActionService};
use kbagent_proto::{Action, ActionRequest, ActionResponse, ErrorKind, ExecAction, RetryPolicy};
use rstest::rstest;
use tokio_util::sync::CancellationToken;

fn exec_action(name: &str, commands: &[&str], args: &[&str]) -> Action {
    Action {
        name: name.to_string(),
        exec: Some(ExecAction {
            commands: commands.iter().map(|s| s.to_string()).collect(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }),
        ..Default::default()
    }
}

fn service(actions: Vec<Action>) -> ActionService {
    ActionService::new(
        actions,
        ActionExecutor::with_defaults().unwrap(),
        CancellationToken::new(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_echo_action_returns_stdout() {
    let service = service(vec![exec_action("echo", &["/bin/echo"], &["hello"])]);

    let output = service
        .handle_request(&ActionRequest::new("echo"))
        .await
        .unwrap();
    assert_eq!(output, b"hello\n");

    let response = ActionResponse::success(output);
    assert!(response.error.is_empty());
}

#[tokio::test]
async fn test_false_action_fails() {
    let service = service(vec![exec_action("fail", &["/bin/false"], &[])]);

    let err = service
        .handle_request(&ActionRequest::new("fail"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Failed);
    assert!(err.message.contains("exit code: 1"));

    let response = ActionResponse::failure(&err);
    assert_eq!(response.error, "failed");
    assert!(response.output.is_empty());
}

#[tokio::test]
async fn test_stderr_attached_to_failure() {
    let service = service(vec![exec_action(
        "noisy",
        &["/bin/sh", "-c"],
        &["echo replica not ready >&2; exit 2"],
    )]);

    let err = service
        .handle_request(&ActionRequest::new("noisy"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Failed);
    assert_eq!(err.message, "exit code: 2, stderr: replica not ready\n");
}

#[tokio::test]
async fn test_parameters_reach_exec_environment() {
    let service = service(vec![exec_action(
        "whoami",
        &["/bin/sh", "-c"],
        &["printf %s \"$KB_ACCOUNT_NAME\""],
    )]);

    let request = ActionRequest::new("whoami").with_parameters(HashMap::from([(
        "KB_ACCOUNT_NAME".to_string(),
        "root".to_string(),
    )]));
    let output = service.handle_request(&request).await.unwrap();
    assert_eq!(output, b"root");
}

#[rstest]
#[case::request_override(None, Some(1))]
#[case::action_default(Some(1), None)]
#[tokio::test]
async fn test_timeout_is_enforced(
    #[case] action_timeout: Option<i32>,
    #[case] request_timeout: Option<i32>,
) {
    let mut action = exec_action("sleepy", &["/bin/sleep"], &["10"]);
    action.timeout_seconds = action_timeout;
    let service = service(vec![action]);

    let mut request = ActionRequest::new("sleepy");
    request.timeout_seconds = request_timeout;

    let started = Instant::now();
    let err = service.handle_request(&request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_not_retryable_errors_are_not_retried() {
    let service = service(vec![]);
    let mut request = ActionRequest::new("missing");
    request.retry_policy = Some(RetryPolicy {
        max_retries: 5,
        retry_interval: 1000,
    });

    let started = Instant::now();
    let err = service.handle_request(&request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotDefined);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_retries_exhaust_attempts() {
    let counter = std::env::temp_dir().join(format!("kbagent-attempts-{}", std::process::id()));
    let _ = std::fs::remove_file(&counter);
    let script = format!("echo x >> {}; exit 1", counter.display());
    let service = service(vec![exec_action("alwaysFails", &["/bin/sh", "-c"], &[&script])]);

    let mut request = ActionRequest::new("alwaysFails");
    request.retry_policy = Some(RetryPolicy {
        max_retries: 2,
        retry_interval: 10,
    });
    let err = service.handle_request(&request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Failed);

    let attempts = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(attempts, 3);
    let _ = std::fs::remove_file(&counter);
}

#[tokio::test]
async fn test_repeated_requests_are_independent() {
    let service = service(vec![exec_action("echo", &["/bin/echo"], &["same"])]);
    let request = ActionRequest::new("echo");

    let first = service.handle_request(&request).await.unwrap();
    let second = service.handle_request(&request).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_shutdown_cancels_running_action() {
    let shutdown = CancellationToken::new();
    let service = ActionService::new(
        vec![exec_action("sleepy", &["/bin/sleep"], &["10"])],
        ActionExecutor::with_defaults().unwrap(),
        shutdown.clone(),
    )
    .unwrap();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
    });

    let err = service
        .handle_request(&ActionRequest::new("sleepy"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InternalError);
    canceller.await.unwrap();
}
