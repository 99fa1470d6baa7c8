//! Integration tests for the agent API endpoints

use agent_lib::{
    api::{create_router, AppState},
    health::{components, HealthRegistry},
    observability::AgentMetrics,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::REPORTER).await;
    health_registry.register(components::REGISTRY).await;

    let metrics = AgentMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    tokio_test::assert_ok!(app.oneshot(request).await)
}

async fn body_text(response: Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let response = get(app, "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let health = body_json(response).await;
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_registry_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::REGISTRY, "registry file unreadable")
        .await;

    // Degraded still returns 200 (collection continues)
    let response = get(app, "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let health = body_json(response).await;
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["registry"]["message"],
        "registry file unreadable"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_reporter_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::REPORTER, "connection refused")
        .await;

    let response = get(app, "/healthz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = body_json(response).await;
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_before_running() {
    let (app, _state) = setup_test_app().await;

    let response = get(app, "/readyz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let readiness = body_json(response).await;
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["reason"], "Agent not running");
}

#[tokio::test]
async fn test_readyz_returns_ok_when_running() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;

    let response = get(app, "/readyz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let readiness = body_json(response).await;
    assert_eq!(readiness["ready"], true);
    assert!(readiness.get("reason").is_none());
}

#[tokio::test]
async fn test_readyz_returns_503_when_running_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::REPORTER, "connection lost")
        .await;

    let response = get(app, "/readyz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_tick(0.004, Some(2));
    state.metrics.inc_samples_sent("cpu");
    state.metrics.inc_read_errors("memory");
    state.metrics.set_workload_cpu_percent("api-test-app", 37.5);

    let response = get(app, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let metrics_text = body_text(response).await;
    assert!(metrics_text.contains("usage_agent_ticks_total"));
    assert!(metrics_text.contains("usage_agent_local_workloads"));
    assert!(metrics_text.contains("usage_agent_samples_sent_total{kind=\"cpu\"}"));
    assert!(metrics_text.contains("usage_agent_read_errors_total{kind=\"memory\"}"));
    assert!(metrics_text.contains("usage_agent_workload_cpu_percent{workload=\"api-test-app\"}"));
}

#[tokio::test]
async fn test_metrics_contains_histogram_buckets() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_tick(0.001, Some(0));
    state.metrics.observe_tick(0.02, None);

    let metrics_text = body_text(get(app, "/metrics").await).await;
    assert!(metrics_text.contains("usage_agent_tick_latency_seconds_bucket"));
    assert!(metrics_text.contains("usage_agent_tick_latency_seconds_count"));
    assert!(metrics_text.contains("usage_agent_tick_latency_seconds_sum"));
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let (app, _state) = setup_test_app().await;

    let health = body_json(get(app, "/healthz").await).await;

    assert!(health["components"].is_object());
    assert!(health["components"]["scheduler"].is_object());
    assert!(health["components"]["reporter"].is_object());
    assert!(health["components"]["registry"].is_object());
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, _state) = setup_test_app().await;

    let response = get(app, "/status").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
