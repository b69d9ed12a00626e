//! JSON over HTTP scanner and monitor
//!
//! The scanner posts the image to `<endpoint>/scan` and expects a
//! [`Vulnerabilities`] document back. The monitor posts to
//! `<endpoint>/push` and `<endpoint>/resolve`.

use crate::backends::{BackendConfig, Image, ImageStack, Monitor, MonitorStatus, Scan, Vulnerabilities};
use anyhow::{anyhow, Context, Result};
use base64::prelude::*;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Shared request plumbing for both HTTP backends
#[derive(Debug, Clone)]
struct HttpEndpoint {
    client: Client,
    base: String,
    authorization: Option<String>,
}

impl HttpEndpoint {
    fn new(config: &BackendConfig) -> Result<Self> {
        let base = config.endpoint.trim().trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(anyhow!("{} backend requires an endpoint", config.kind));
        }

        let timeout = match config.options.get("timeout_secs") {
            Some(value) => value
                .parse::<u64>()
                .with_context(|| format!("Invalid timeout_secs '{}'", value))?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let authorization = config.username.as_ref().map(|username| {
            let password = config.password.as_deref().unwrap_or_default();
            let credentials = BASE64_STANDARD.encode(format!("{}:{}", username, password));
            format!("Basic {}", credentials)
        });

        Ok(Self {
            client,
            base,
            authorization,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> RequestBuilder {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(ref authorization) = self.authorization {
            request = request.header("Authorization", authorization);
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .context("Failed to send HTTP request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "HTTP request failed with status {}: {}",
                status,
                body
            ));
        }
        Ok(response)
    }
}

/// Scanner reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpScanner {
    endpoint: HttpEndpoint,
}

impl HttpScanner {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(config)?,
        })
    }
}

#[async_trait::async_trait]
impl Scan for HttpScanner {
    async fn scan(&self, image: &Image) -> Result<Vulnerabilities> {
        debug!(tag = %image.tag, image_id = %image.image_id, "Requesting scan");
        let response = self
            .endpoint
            .send(self.endpoint.post("scan", image))
            .await?;
        response
            .json::<Vulnerabilities>()
            .await
            .context("Failed to decode scan result")
    }
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    stack: &'a ImageStack,
    status: MonitorStatus,
    code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_assignee: Option<&'a str>,
    create_tickets: bool,
}

#[derive(Debug, Serialize)]
struct ResolveRequest<'a> {
    stack: &'a ImageStack,
}

/// Monitor reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpMonitor {
    endpoint: HttpEndpoint,
    default_assignee: Option<String>,
    create_tickets: bool,
}

impl HttpMonitor {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(config)?,
            default_assignee: config.default_assignee.clone(),
            create_tickets: config.create_tickets,
        })
    }
}

#[async_trait::async_trait]
impl Monitor for HttpMonitor {
    async fn push(&self, stack: &ImageStack, status: MonitorStatus) -> Result<()> {
        let body = PushRequest {
            stack,
            status,
            code: status.code(),
            default_assignee: self.default_assignee.as_deref(),
            create_tickets: self.create_tickets,
        };
        self.endpoint
            .send(self.endpoint.post("push", &body))
            .await
            .with_context(|| format!("Failed to push {}", stack.metadata.tag))?;
        Ok(())
    }

    async fn resolve(&self, stack: &ImageStack) -> Result<()> {
        self.endpoint
            .send(self.endpoint.post("resolve", &ResolveRequest { stack }))
            .await
            .with_context(|| format!("Failed to resolve {}", stack.metadata.tag))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Cve, Severity};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(endpoint: &str) -> BackendConfig {
        BackendConfig {
            kind: "http".to_string(),
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_endpoint_required() {
        assert!(HttpScanner::new(&config("")).is_err());
        assert!(HttpMonitor::new(&config("   ")).is_err());
    }

    #[test]
    fn test_invalid_timeout_option() {
        let mut config = config("http://localhost:1");
        config.options.insert("timeout_secs".to_string(), "soon".to_string());
        assert!(HttpScanner::new(&config).is_err());
    }

    #[test]
    fn test_basic_auth_header() {
        let mut config = config("http://localhost:1/");
        config.username = Some("user".to_string());
        config.password = Some("pass".to_string());
        let endpoint = HttpEndpoint::new(&config).unwrap();

        assert_eq!(endpoint.url("scan"), "http://localhost:1/scan");
        assert_eq!(endpoint.authorization.as_deref(), Some("Basic dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn test_scan_roundtrip() {
        let router = Router::new().route(
            "/scan",
            post(|Json(image): Json<Image>| async move {
                Json(Vulnerabilities {
                    digest: image.image_id,
                    scanner: "mock".to_string(),
                    cves: vec![Cve {
                        fix: String::new(),
                        package: "openssl".to_string(),
                        severity: Severity::High,
                        url: String::new(),
                        vuln: "CVE-2024-0001".to_string(),
                        description: String::new(),
                    }],
                })
            }),
        );
        let base = spawn(router).await;

        let scanner = HttpScanner::new(&config(&base)).unwrap();
        let image = Image {
            tag: "nginx:1.25".to_string(),
            image_id: "sha256:nginx".to_string(),
            ..Default::default()
        };
        let result = scanner.scan(&image).await.unwrap();
        assert_eq!(result.digest, "sha256:nginx");
        assert_eq!(result.cves.len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_push_and_failure() {
        let seen = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));
        let recorder = Arc::clone(&seen);
        let router = Router::new()
            .route(
                "/push",
                post(move |Json(body): Json<serde_json::Value>| {
                    let recorder = Arc::clone(&recorder);
                    async move {
                        recorder.lock().unwrap().push(body);
                        "ok"
                    }
                }),
            )
            .route(
                "/resolve",
                post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            );
        let base = spawn(router).await;

        let mut config = config(&base);
        config.default_assignee = Some("secops".to_string());
        let monitor = HttpMonitor::new(&config).unwrap();

        let stack = ImageStack::default();
        monitor.push(&stack, MonitorStatus::Error).await.unwrap();
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0]["code"], 2);
            assert_eq!(seen[0]["status"], "error");
            assert_eq!(seen[0]["default_assignee"], "secops");
        }

        assert!(monitor.resolve(&stack).await.is_err());
    }
}
