//! Prometheus metrics and the HTTP endpoint exposing them

use crate::image::Action;
use anyhow::{Context, Result};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Task outcomes tracked by `vigil_tasks_total`
pub const TASK_SUCCEEDED: &str = "succeeded";
pub const TASK_RETRIED: &str = "retried";
pub const TASK_DROPPED: &str = "dropped";

/// Server metrics, registered on a private registry
pub struct Metrics {
    registry: Registry,
    pub cycles_total: IntCounter,
    pub cycles_skipped_total: IntCounter,
    pub cycles_failed_total: IntCounter,
    pub tasks_total: IntCounterVec,
    pub reconcile_actions_total: IntCounterVec,
    pub monitored_images: IntGauge,
    pub active_agents: IntGauge,
    pub cycle_duration_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cycles_total = IntCounter::new("vigil_cycles_total", "Completed scheduling cycles")?;
        let cycles_skipped_total = IntCounter::new(
            "vigil_cycles_skipped_total",
            "Ticks skipped because a cycle was still running",
        )?;
        let cycles_failed_total =
            IntCounter::new("vigil_cycles_failed_total", "Cycles aborted by an error")?;
        let tasks_total = IntCounterVec::new(
            Opts::new("vigil_tasks_total", "Task executions by outcome"),
            &["outcome"],
        )?;
        let reconcile_actions_total = IntCounterVec::new(
            Opts::new("vigil_reconcile_actions_total", "Reconciliation actions executed"),
            &["action"],
        )?;
        let monitored_images =
            IntGauge::new("vigil_monitored_images", "Images currently in the monitored model")?;
        let active_agents = IntGauge::new("vigil_active_agents", "Agents tracked as active")?;
        let cycle_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "vigil_cycle_duration_seconds",
            "Wall time of a scheduling cycle",
        ))?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(cycles_skipped_total.clone()))?;
        registry.register(Box::new(cycles_failed_total.clone()))?;
        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(reconcile_actions_total.clone()))?;
        registry.register(Box::new(monitored_images.clone()))?;
        registry.register(Box::new(active_agents.clone()))?;
        registry.register(Box::new(cycle_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            cycles_total,
            cycles_skipped_total,
            cycles_failed_total,
            tasks_total,
            reconcile_actions_total,
            monitored_images,
            active_agents,
            cycle_duration_seconds,
        })
    }

    pub fn record_task(&self, outcome: &str) {
        self.tasks_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_actions(&self, action: Action, count: usize) {
        if count > 0 {
            self.reconcile_actions_total
                .with_label_values(&[action.as_str()])
                .inc_by(count as u64);
        }
    }

    pub fn task_count(&self, outcome: &str) -> u64 {
        self.tasks_total.with_label_values(&[outcome]).get()
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics are not valid UTF-8")
    }
}

fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move {
                    match metrics.render() {
                        Ok(body) => (
                            StatusCode::OK,
                            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
                            body,
                        )
                            .into_response(),
                        Err(e) => {
                            error!(error = %e, "Error rendering metrics");
                            Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .body("# Error rendering metrics\n".into())
                                .unwrap_or_default()
                        }
                    }
                }
            }),
        )
        .route(
            "/health",
            get(|| async {
                Json(serde_json::json!({
                    "status": "ok",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                }))
            }),
        )
        .layer(CorsLayer::permissive())
}

/// Bind the metrics endpoint and serve it in the background
pub async fn serve(metrics: Arc<Metrics>, port: u16) -> Result<JoinHandle<()>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;
    info!(%addr, "Starting metrics server");

    let app = router(metrics);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Metrics server stopped");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.cycles_total.inc();
        metrics.record_task(TASK_DROPPED);
        metrics.record_actions(Action::FullyResolve, 2);
        metrics.record_actions(Action::Update, 0);

        let body = metrics.render().unwrap();
        assert!(body.contains("vigil_cycles_total 1"));
        assert!(body.contains("vigil_tasks_total{outcome=\"dropped\"} 1"));
        assert!(body.contains("vigil_reconcile_actions_total{action=\"fully_resolve\"} 2"));
        assert!(!body.contains("action=\"update\""));
        assert_eq!(metrics.task_count(TASK_DROPPED), 1);
    }

    #[tokio::test]
    async fn test_endpoints() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.active_agents.set(3);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&metrics));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("vigil_active_agents 3"));

        let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
    }
}
