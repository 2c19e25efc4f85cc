//! HTTP transport.

use std::collections::{HashMap, HashSet};

use kbagent_proto::{ActionError, HttpAction};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Request};

use super::{render_template, write_sink, ActionIo};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_SCHEME: &str = "http";
const DEFAULT_METHOD: &str = "GET";
const DEFAULT_PATH: &str = "/";

/// Target URL of `spec` with defaults applied.
pub(super) fn url(spec: &HttpAction) -> String {
    let scheme = or_default(&spec.scheme, DEFAULT_SCHEME).to_lowercase();
    let host = or_default(&spec.host, DEFAULT_HOST);
    let path = or_default(&spec.path, DEFAULT_PATH);
    let slash = if path.starts_with('/') { "" } else { "/" };
    format!("{scheme}://{host}:{}{slash}{path}", spec.port)
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

/// Builds the request for `spec`.
///
/// Parameters are sent as headers unless the action sets a header of the
/// same name. Header values and the body are rendered as templates.
pub(super) fn request(
    client: &Client,
    spec: &HttpAction,
    parameters: &HashMap<String, String>,
) -> Result<Request, ActionError> {
    let method = Method::from_bytes(or_default(&spec.method, DEFAULT_METHOD).to_uppercase().as_bytes())
        .map_err(|e| ActionError::bad_request(format!("invalid http method: {e}")))?;

    let mut action_headers = Vec::with_capacity(spec.headers.len());
    for header in &spec.headers {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| {
            ActionError::bad_request(format!("invalid http header {}: {e}", header.name))
        })?;
        let value = render_template("http header", &header.value, parameters)?;
        let value = HeaderValue::from_str(&value).map_err(|e| {
            ActionError::bad_request(format!("invalid value of http header {}: {e}", header.name))
        })?;
        action_headers.push((name, value));
    }

    let overridden: HashSet<&HeaderName> = action_headers.iter().map(|(name, _)| name).collect();
    let mut headers = HeaderMap::new();
    for (key, value) in parameters {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        if !overridden.contains(&name) {
            headers.insert(name, value);
        }
    }
    for (name, value) in action_headers {
        headers.append(name, value);
    }

    let body = render_template("http body", &spec.body, parameters)?;

    client
        .request(method, url(spec))
        .headers(headers)
        .body(body)
        .build()
        .map_err(|e| ActionError::bad_request(format!("failed to build http request: {e}")))
}

/// Issues the request. A 2xx body goes to stdout; anything else goes to
/// stderr and fails the call.
pub(super) async fn run(client: Client, request: Request, mut io: ActionIo) -> Result<(), ActionError> {
    let response = client.execute(request).await.map_err(|e| {
        if e.is_timeout() {
            ActionError::timed_out()
        } else if e.is_connect() {
            ActionError::internal(format!("failed to connect: {e}"))
        } else {
            ActionError::failed(format!("failed to issue http request: {e}"))
        }
    })?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| ActionError::failed(format!("failed to read http response: {e}")))?;

    if status.is_success() {
        write_sink(&mut io.stdout, &body)
            .await
            .map_err(|e| ActionError::failed(format!("failed to write output: {e}")))?;
        Ok(())
    } else {
        let _ = write_sink(&mut io.stderr, &body).await;
        Err(ActionError::failed(format!(
            "http request failed, status: {}",
            status.as_u16()
        )))
    }
}

#[cfg(test)]
mod tests {
    use kbagent_proto::HttpHeader;

    use super::*;

    #[test]
    fn test_url_defaults() {
        let spec = HttpAction {
            port: "8080".to_string(),
            ..Default::default()
        };
        assert_eq!(url(&spec), "http://127.0.0.1:8080/");

        let spec = HttpAction {
            port: "8443".to_string(),
            host: "db.local".to_string(),
            scheme: "HTTPS".to_string(),
            path: "health".to_string(),
            ..Default::default()
        };
        assert_eq!(url(&spec), "https://db.local:8443/health");
    }

    #[test]
    fn test_request_headers_and_body() {
        let spec = HttpAction {
            port: "8080".to_string(),
            method: "post".to_string(),
            path: "/role".to_string(),
            headers: vec![HttpHeader {
                name: "X-Role".to_string(),
                value: "{{ .ROLE }}".to_string(),
            }],
            body: r#"{"role":"{{ .ROLE }}"}"#.to_string(),
            ..Default::default()
        };
        let parameters = HashMap::from([
            ("ROLE".to_string(), "leader".to_string()),
            ("x-role".to_string(), "ignored".to_string()),
            ("KB_POD".to_string(), "mysql-0".to_string()),
        ]);

        let request = request(&Client::new(), &spec, &parameters).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().as_str(), "http://127.0.0.1:8080/role");
        assert_eq!(request.headers()["x-role"], "leader");
        assert_eq!(request.headers().get_all("x-role").iter().count(), 1);
        assert_eq!(request.headers()["kb_pod"], "mysql-0");
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(body, br#"{"role":"leader"}"#);
    }

    #[test]
    fn test_request_missing_template_key() {
        let spec = HttpAction {
            port: "8080".to_string(),
            body: "{{ .NOPE }}".to_string(),
            ..Default::default()
        };
        let err = request(&Client::new(), &spec, &HashMap::new()).unwrap_err();
        assert_eq!(err.kind, kbagent_proto::ErrorKind::BadRequest);
    }
}
