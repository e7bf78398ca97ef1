//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 收集指标，
//! 通过独立的 HTTP 端口暴露 `/metrics` 供 Prometheus 抓取。
//! 未安装 recorder 时所有记录函数都是空操作，单元测试无需初始化。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 安装 Prometheus recorder 并启动指标 HTTP 服务
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    describe_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

fn describe_metrics(service_name: &str) {
    metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );

    metrics::describe_counter!("payment_approvals_total", "Payment approvals by outcome");
    metrics::describe_histogram!(
        "payment_approval_duration_seconds",
        "Payment approval transaction duration in seconds"
    );
    metrics::describe_counter!(
        "events_published_total",
        "Outbox events published to the broker"
    );
    metrics::describe_gauge!("outbox_pending_events", "Outbox events not yet published");

    metrics::describe_counter!(
        "messages_consumed_total",
        "Consumed messages by final disposition"
    );
    metrics::describe_counter!(
        "order_status_transitions_total",
        "Delivery order status transition attempts"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 全局 Prometheus handle
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 记录函数
// ============================================================================

/// 记录 HTTP 请求，`path` 应为路由模板而不是实际路径
#[inline]
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str.clone()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str
    )
    .record(duration_secs);
}

/// 记录一次支付审批
#[inline]
pub fn record_payment_approval(outcome: &str, duration_secs: f64) {
    metrics::counter!("payment_approvals_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!("payment_approval_duration_seconds").record(duration_secs);
}

/// 记录一次事件发布尝试，`path` 区分审批后立即发布与后台中继
#[inline]
pub fn record_event_published(path: &str, success: bool) {
    metrics::counter!(
        "events_published_total",
        "path" => path.to_string(),
        "status" => if success { "ok" } else { "failed" }
    )
    .increment(1);
}

#[inline]
pub fn set_outbox_pending(count: i64) {
    metrics::gauge!("outbox_pending_events").set(count as f64);
}

/// 记录消息的最终处置（created / duplicate / discarded / requeued / dead_lettered）
#[inline]
pub fn record_message_consumed(disposition: &str) {
    metrics::counter!(
        "messages_consumed_total",
        "disposition" => disposition.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_status_transition(target: &str, accepted: bool) {
    metrics::counter!(
        "order_status_transitions_total",
        "target" => target.to_string(),
        "result" => if accepted { "accepted" } else { "rejected" }
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        record_http_request("POST", "/approve", 200, 0.1);
        record_payment_approval("approved", 0.02);
        record_event_published("inline", true);
        set_outbox_pending(3);
        record_message_consumed("duplicate");
        record_status_transition("SHIPPING", false);
        assert!(get_handle().is_none());
    }
}
