//! Subprocess transport.

use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};

use kbagent_proto::{ActionError, ExecAction};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::task::AbortOnDropHandle;

use super::{ActionIo, BoxWriter};

/// Builds the command for `spec`.
///
/// Parameters are exported into the child's environment with upper-cased
/// names, on top of the agent's own environment.
pub(super) fn command(
    spec: &ExecAction,
    parameters: &HashMap<String, String>,
    io: &ActionIo,
) -> Result<Command, ActionError> {
    let (program, leading) = spec
        .commands
        .split_first()
        .ok_or_else(|| ActionError::bad_request("exec action has no command"))?;

    let mut command = Command::new(program);
    command
        .args(leading)
        .args(&spec.args)
        .envs(parameters.iter().map(|(k, v)| (k.to_uppercase(), v)))
        .stdin(piped_if(io.stdin.is_some()))
        .stdout(piped_if(io.stdout.is_some()))
        .stderr(piped_if(io.stderr.is_some()))
        .kill_on_drop(true);
    Ok(command)
}

fn piped_if(wired: bool) -> Stdio {
    if wired {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// Runs the command to completion.
///
/// Dropping the returned future kills the child and stops feeding its stdin.
/// A stdin source that fails mid-transfer fails the call even when the child
/// exits cleanly on the truncated input.
pub(super) async fn run(mut command: Command, io: ActionIo) -> Result<(), ActionError> {
    let mut child = command
        .spawn()
        .map_err(|e| ActionError::failed(format!("failed to start command: {e}")))?;

    let stdin = match (io.stdin, child.stdin.take()) {
        (Some(mut reader), Some(mut pipe)) => Some(AbortOnDropHandle::new(tokio::spawn(
            async move {
                let copied = tokio::io::copy(&mut reader, &mut pipe).await;
                let _ = pipe.shutdown().await;
                copied
            },
        ))),
        _ => None,
    };

    let stdout = forward(child.stdout.take(), io.stdout);
    let stderr = forward(child.stderr.take(), io.stderr);
    let (status, stdout, stderr) = tokio::join!(child.wait(), stdout, stderr);

    let status =
        status.map_err(|e| ActionError::failed(format!("failed to wait for command: {e}")))?;
    if let Some(stdin) = stdin {
        match stdin.await {
            Ok(Ok(_)) => {}
            // The child stopped reading.
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(ActionError::failed(format!("failed to copy stdin: {e}"))),
            Err(e) => return Err(ActionError::internal(format!("stdin copy task failed: {e}"))),
        }
    }
    stdout.map_err(|e| ActionError::failed(format!("failed to copy stdout: {e}")))?;
    stderr.map_err(|e| ActionError::failed(format!("failed to copy stderr: {e}")))?;

    if status.success() {
        Ok(())
    } else {
        Err(ActionError::failed(exit_message(status)))
    }
}

async fn forward<R>(src: Option<R>, dst: Option<BoxWriter>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    match (src, dst) {
        (Some(mut src), Some(mut dst)) => {
            tokio::io::copy(&mut src, &mut dst).await?;
            dst.flush().await
        }
        _ => Ok(()),
    }
}

fn exit_message(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code: {code}"),
        None => format!("command terminated: {status}"),
    }
}
