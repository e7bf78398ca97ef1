//! 支付服务入口
//!
//! 启动顺序：配置 → 可观测性 → 数据库（可选迁移）→ Kafka 生产者 → outbox 中继 → HTTP。
//! 关闭时先停 HTTP，再等中继退出，最后刷出生产者队列并关闭连接池。

use std::sync::Arc;
use std::time::Duration;

use fulfillment_shared::{
    config::AppConfig,
    database::Database,
    kafka::{KafkaProducer, Topology},
    observability,
};
use payment_service::{
    MIGRATOR, SERVICE_NAME, outbox::OutboxRelay, publisher::KafkaEventPublisher, routes,
    service::ApprovalService, state::AppState,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// 关闭时等待生产者队列刷出的上限
const PRODUCER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.observability).await?;

    info!(
        environment = %config.environment,
        "Starting {} on {}",
        SERVICE_NAME,
        config.server_addr()
    );

    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations(&MIGRATOR).await?;
    }

    let producer = KafkaProducer::new(&config.kafka)?;
    let topology = Topology::new(&config.kafka, &[config.kafka.topic.as_str()]);
    let publisher = Arc::new(KafkaEventPublisher::new(
        producer.clone(),
        topology,
        &config.kafka.topic,
    ));

    let relay = OutboxRelay::new(db.pool().clone(), publisher, config.outbox.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay_handle = if config.outbox.enabled {
        Some(tokio::spawn(relay.clone().run(shutdown_rx)))
    } else {
        warn!("outbox 中继已禁用，发布失败的事件不会自动补发");
        None
    };

    let approval = Arc::new(ApprovalService::new(db.pool().clone(), Arc::new(relay)));
    let app = routes::router(AppState::new(db.clone(), approval));

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = relay_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "outbox 中继任务异常退出");
        }
    }

    producer.flush(PRODUCER_FLUSH_TIMEOUT);
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
