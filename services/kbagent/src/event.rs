//! Event sinks for probe and task reports.
//!
//! In a cluster, events are recorded as Kubernetes core/v1 Events against the
//! agent's pod. Repeated reports with the same reason and message map to the
//! same Event object, whose `count` is bumped instead of creating a new one.

use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const COMPONENT: &str = "kbagent";
const EVENT_HASH_LEN: usize = 16;

/// Sends a report to wherever events are recorded.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, reason: &str, message: &str) -> Result<()>;
}

/// Identity of the pod the agent runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodIdentity {
    pub pod_name: String,
    pub pod_uid: String,
    pub namespace: String,
    pub node_name: String,
}

/// Name of the Event recording `reason`/`message` for this pod.
pub fn event_name(pod: &PodIdentity, reason: &str, message: &str) -> String {
    let digest = Sha256::digest(format!("{}.{}.{}", pod.pod_uid, reason, message));
    let hash = hex::encode(digest);
    format!("{}.{}", pod.pod_name, &hash[..EVENT_HASH_LEN])
}

/// Records events through the Kubernetes API server.
pub struct ClusterEventSender {
    client: reqwest::Client,
    api_server: String,
    token: String,
    pod: PodIdentity,
}

impl ClusterEventSender {
    pub fn new(client: reqwest::Client, api_server: String, token: String, pod: PodIdentity) -> Self {
        Self {
            client,
            api_server: api_server.trim_end_matches('/').to_string(),
            token,
            pod,
        }
    }

    /// Builds a sender from the in-cluster service account.
    ///
    /// Returns `None` when not running inside a cluster.
    pub fn from_service_account(pod: PodIdentity) -> Result<Option<Self>> {
        let (Ok(host), Ok(port)) = (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) else {
            return Ok(None);
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))
            .context("failed to read service account token")?;
        let ca = std::fs::read(dir.join("ca.crt")).context("failed to read cluster CA")?;

        let client = reqwest::Client::builder()
            .add_root_certificate(
                reqwest::Certificate::from_pem(&ca).context("invalid cluster CA certificate")?,
            )
            .build()
            .context("failed to build kubernetes client")?;

        let api_server = if host.contains(':') {
            format!("https://[{host}]:{port}")
        } else {
            format!("https://{host}:{port}")
        };
        Ok(Some(Self::new(client, api_server, token.trim().to_string(), pod)))
    }

    fn events_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/events",
            self.api_server, self.pod.namespace
        )
    }

    fn event(&self, name: &str, reason: &str, message: &str) -> Value {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        json!({
            "apiVersion": "v1",
            "kind": "Event",
            "metadata": {
                "name": name,
                "namespace": self.pod.namespace,
            },
            "involvedObject": {
                "apiVersion": "v1",
                "kind": "Pod",
                "name": self.pod.pod_name,
                "namespace": self.pod.namespace,
                "uid": self.pod.pod_uid,
            },
            "reason": reason,
            "message": message,
            "source": {
                "component": COMPONENT,
                "host": self.pod.node_name,
            },
            "firstTimestamp": now,
            "lastTimestamp": now,
            "count": 1,
            "type": "Normal",
            "reportingComponent": COMPONENT,
            "reportingInstance": self.pod.pod_name,
        })
    }

    async fn bump(&self, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.events_url(), name);
        let mut event: Value = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let count = event.get("count").and_then(Value::as_i64).unwrap_or(1);
        event["count"] = json!(count + 1);
        event["lastTimestamp"] = json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

        self.client
            .put(&url)
            .bearer_auth(&self.token)
            .json(&event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl EventSender for ClusterEventSender {
    async fn send(&self, reason: &str, message: &str) -> Result<()> {
        let name = event_name(&self.pod, reason, message);
        let response = self
            .client
            .post(self.events_url())
            .bearer_auth(&self.token)
            .json(&self.event(&name, reason, message))
            .send()
            .await
            .context("failed to send event")?;

        match response.status() {
            status if status.is_success() => {
                debug!(event = %name, reason, "event created");
                Ok(())
            }
            StatusCode::CONFLICT => {
                self.bump(&name)
                    .await
                    .with_context(|| format!("failed to update event {name}"))?;
                debug!(event = %name, reason, "event updated");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("failed to create event {name}: {status}: {body}")
            }
        }
    }
}

/// Writes events to the log. Used outside a cluster.
#[derive(Debug, Default)]
pub struct LogEventSender;

#[async_trait]
impl EventSender for LogEventSender {
    async fn send(&self, reason: &str, message: &str) -> Result<()> {
        info!(reason, message, "event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn pod() -> PodIdentity {
        PodIdentity {
            pod_name: "mysql-0".to_string(),
            pod_uid: "6f1c2d".to_string(),
            namespace: "default".to_string(),
            node_name: "node-1".to_string(),
        }
    }

    #[test]
    fn test_event_name_is_stable() {
        let a = event_name(&pod(), "roleProbe", "{\"code\":0}");
        let b = event_name(&pod(), "roleProbe", "{\"code\":0}");
        let c = event_name(&pod(), "roleProbe", "{\"code\":-1}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("mysql-0."));
        assert_eq!(a.len(), "mysql-0.".len() + EVENT_HASH_LEN);
    }

    #[tokio::test]
    async fn test_send_creates_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/default/events"))
            .and(header("authorization", "Bearer token"))
            .and(body_partial_json(json!({
                "reason": "roleProbe",
                "message": "leader",
                "involvedObject": {"kind": "Pod", "name": "mysql-0"},
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let sender = ClusterEventSender::new(
            reqwest::Client::new(),
            server.uri(),
            "token".to_string(),
            pod(),
        );
        sender.send("roleProbe", "leader").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_bumps_existing_event() {
        let server = MockServer::start().await;
        let name = event_name(&pod(), "roleProbe", "leader");
        let url = format!("/api/v1/namespaces/default/events/{name}");

        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/default/events"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(url.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": {"name": name, "resourceVersion": "7"},
                "count": 3,
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(url.as_str()))
            .and(body_partial_json(json!({"count": 4, "metadata": {"resourceVersion": "7"}})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = ClusterEventSender::new(
            reqwest::Client::new(),
            server.uri(),
            "token".to_string(),
            pod(),
        );
        sender.send("roleProbe", "leader").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_reports_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let sender = ClusterEventSender::new(
            reqwest::Client::new(),
            server.uri(),
            "token".to_string(),
            pod(),
        );
        let err = sender.send("roleProbe", "leader").await.unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
