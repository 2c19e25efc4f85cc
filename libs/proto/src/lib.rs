//! # kbagent-proto
//!
//! Wire types shared between the kbagent sidecar and the cluster controller
//! that calls it.
//!
//! ## Contents
//!
//! - Actions (`exec`, `http`, `grpc`) and the request/response envelope used
//!   by `POST /v1.0/action`
//! - Probes and the events they produce
//! - Tasks (replica bootstrap)
//! - The closed error taxonomy every surfaced error maps to
//! - The startup environment codec used to hand the action, probe, streaming
//!   and task lists to the agent process
//!
//! All types serialize as camelCase JSON. Byte payloads travel as base64
//! strings.

mod action;
mod error;
mod probe;
mod startup;
mod task;

pub use action::*;
pub use error::{ActionError, ErrorKind, ProtoError};
pub use probe::*;
pub use startup::*;
pub use task::*;

/// URI of the request/response action endpoint.
pub const ACTION_URI: &str = "/v1.0/action";

/// Default port of the request/response server.
pub const DEFAULT_HTTP_PORT: u16 = 3501;

/// Default port of the streaming server.
pub const DEFAULT_STREAMING_PORT: u16 = 3502;

/// Maximum size in bytes of a streaming handshake.
pub const MAX_HANDSHAKE_SIZE: usize = 4096;

/// Base64 (de)serialization for byte payloads.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
