//! Streaming data pipe.
//!
//! A peer connects to the streaming port and writes one JSON
//! [`ActionRequest`] naming a streaming-enabled action. After the handshake
//! the connection carries raw bytes: the socket is the action's stdin and
//! stdout. Used for dump/load pipes between replicas.

use std::collections::HashSet;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kbagent_proto::{ActionError, ActionRequest, MAX_HANDSHAKE_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::ActionService;
use crate::executor::{call_timeout, ActionIo, OutputBuffer, DEFAULT_ACTION_CALL_TIMEOUT};

const READ_CHUNK: usize = 1024;

/// Serves streaming actions over TCP.
pub struct StreamingService {
    actions: Arc<ActionService>,
    allowed: HashSet<String>,
    handshake_timeout: Duration,
}

impl StreamingService {
    /// Names not present in the registry are dropped from the allow-list.
    pub fn new(actions: Arc<ActionService>, streaming: &[String]) -> Self {
        let mut allowed = HashSet::new();
        for name in streaming {
            if actions.contains(name) {
                allowed.insert(name.clone());
            } else {
                warn!(action = %name, "streaming action is not defined, ignoring");
            }
        }
        Self {
            actions,
            allowed,
            handshake_timeout: DEFAULT_ACTION_CALL_TIMEOUT,
        }
    }

    /// Bounds how long a connected peer may take to send its handshake.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Accepts connections until shutdown, one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %listener.local_addr()?, actions = self.allowed.len(), "streaming server listening");

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.cancelled() => {
                    info!("streaming server shutting down");
                    return Ok(());
                }
            };

            let service = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = service.handle_connection(stream, peer).await {
                    warn!(error = %e, peer = %peer, "streaming connection failed");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ActionError> {
        let (mut reader, writer) = stream.into_split();
        let (request, leftover) =
            tokio::time::timeout(self.handshake_timeout, read_handshake(&mut reader))
                .await
                .map_err(|_| ActionError::timed_out().context("no handshake received"))??;
        self.authorize(&request.action)?;

        info!(action = %request.action, peer = %peer, "streaming action started");

        let stderr = OutputBuffer::default();
        let io = ActionIo::default()
            .with_stdin(Cursor::new(leftover).chain(reader))
            .with_stdout(writer)
            .with_stderr(stderr.clone());

        let handle = self.actions.call_action_with_io(
            &request.action,
            &request.parameters,
            request.timeout_seconds,
            io,
        )?;

        match handle.wait().await {
            Ok(()) => {
                debug!(action = %request.action, peer = %peer, "streaming action finished");
                Ok(())
            }
            Err(err) => {
                let stderr = stderr.to_string_lossy();
                if stderr.is_empty() {
                    Err(err)
                } else {
                    Err(err.context(format_args!("stderr: {stderr}")))
                }
            }
        }
    }

    fn authorize(&self, action: &str) -> Result<(), ActionError> {
        if !self.actions.contains(action) {
            return Err(ActionError::not_defined(format!(
                "action {action} is not defined"
            )));
        }
        if !self.allowed.contains(action) {
            return Err(ActionError::not_implemented(format!(
                "streaming action {action} is not supported"
            )));
        }
        Ok(())
    }
}

/// Reads one JSON request off `reader`.
///
/// Returns the request and any bytes read past its end.
pub async fn read_handshake<R>(reader: &mut R) -> Result<(ActionRequest, Vec<u8>), ActionError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if !buf.is_empty() {
            let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<ActionRequest>();
            match values.next() {
                Some(Ok(request)) => {
                    let rest = buf[values.byte_offset()..].to_vec();
                    return Ok((request, rest));
                }
                Some(Err(e)) if !e.is_eof() => {
                    return Err(ActionError::bad_request(format!("invalid handshake: {e}")));
                }
                _ => {}
            }
        }

        let room = MAX_HANDSHAKE_SIZE - buf.len();
        if room == 0 {
            return Err(ActionError::bad_request(format!(
                "handshake exceeds {MAX_HANDSHAKE_SIZE} bytes"
            )));
        }

        let n = reader
            .read(&mut chunk[..room.min(READ_CHUNK)])
            .await
            .map_err(|e| ActionError::internal(format!("failed to read handshake: {e}")))?;
        if n == 0 {
            return Err(ActionError::bad_request("connection closed before handshake"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Connects to a peer's streaming port and performs the handshake.
///
/// The returned stream is the raw data channel.
pub async fn connect(remote: &str, port: u16, request: &ActionRequest) -> Result<TcpStream, ActionError> {
    let payload = serde_json::to_vec(request)
        .map_err(|e| ActionError::bad_request(format!("failed to encode handshake: {e}")))?;
    if payload.len() > MAX_HANDSHAKE_SIZE {
        return Err(ActionError::bad_request(format!(
            "handshake exceeds {MAX_HANDSHAKE_SIZE} bytes"
        )));
    }

    let mut stream = tokio::time::timeout(
        call_timeout(request.timeout_seconds),
        TcpStream::connect((remote, port)),
    )
    .await
    .map_err(|_| ActionError::timed_out().context(format_args!("connecting to {remote}:{port}")))?
    .map_err(|e| ActionError::internal(format!("failed to connect to {remote}:{port}: {e}")))?;
    stream
        .write_all(&payload)
        .await
        .map_err(|e| ActionError::internal(format!("failed to send handshake: {e}")))?;
    Ok(stream)
}
