//! Configuration for the agent.
//!
//! Server settings come from flags with environment fallbacks. The action,
//! probe, streaming and task lists are JSON environment variables written by
//! the controller and decoded with [`kbagent_proto::decode_startup_envs`].

use anyhow::{Context, Result};
use clap::Parser;
use kbagent_proto::{decode_startup_envs, StartupConfig, DEFAULT_HTTP_PORT, DEFAULT_STREAMING_PORT};

use crate::event::PodIdentity;

pub const POD_NAME_ENV: &str = "KB_AGENT_POD_NAME";
pub const POD_UID_ENV: &str = "KB_AGENT_POD_UID";
pub const NAMESPACE_ENV: &str = "KB_AGENT_NAMESPACE";
pub const NODE_NAME_ENV: &str = "KB_AGENT_NODE_NAME";

/// Command line of the agent.
#[derive(Debug, Clone, Parser)]
#[command(name = "kbagent", version, about = "Lifecycle action sidecar for database replicas")]
pub struct Config {
    /// Address the servers bind to.
    #[arg(long, env = "KB_AGENT_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// Port of the request/response server.
    #[arg(long, env = "KB_AGENT_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub port: u16,

    /// Port of the streaming server.
    #[arg(long, env = "KB_AGENT_STREAMING_PORT", default_value_t = DEFAULT_STREAMING_PORT)]
    pub streaming_port: u16,

    /// Maximum concurrent request/response calls.
    #[arg(long, env = "KB_AGENT_MAX_CONCURRENCY", default_value_t = 8)]
    pub max_concurrency: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "KB_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn streaming_addr(&self) -> String {
        format!("{}:{}", self.address, self.streaming_port)
    }
}

/// Decodes the startup lists from the process environment.
pub fn startup_from_env() -> Result<StartupConfig> {
    decode_startup_envs(|name| std::env::var(name).ok())
        .context("invalid startup configuration")
}

/// Reads the pod identity from the process environment.
pub fn pod_identity_from_env() -> PodIdentity {
    let var = |name: &str| std::env::var(name).unwrap_or_default();
    PodIdentity {
        pod_name: var(POD_NAME_ENV),
        pod_uid: var(POD_UID_ENV),
        namespace: var(NAMESPACE_ENV),
        node_name: var(NODE_NAME_ENV),
    }
}
