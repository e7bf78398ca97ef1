//! 配送服务入口
//!
//! HTTP 服务与支付事件消费者运行在同一进程，共用一个关闭信号。
//! 消费者因 Kafka 故障退出时按退避策略重建，HTTP 接口不受影响。

use std::sync::Arc;
use std::time::{Duration, Instant};

use delivery_service::{
    MIGRATOR, SERVICE_NAME, consumer::FulfillmentConsumer, processor::PaidOrderProcessor,
    routes, service::StatusService, state::AppState,
};
use fulfillment_shared::{
    config::{AppConfig, KafkaConfig},
    database::Database,
    kafka::KafkaProducer,
    observability,
    retry::{RestartBackoff, RetryPolicy},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// 关闭时等待生产者队列刷出的上限
const PRODUCER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// 消费者连续运行超过该时长后，下一次异常退出从最短退避开始
const CONSUMER_HEALTHY_AFTER: Duration = Duration::from_secs(60);

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

    // 生产者用于重新入队与死信
    let producer = KafkaProducer::new(&config.kafka)?;
    let processor = Arc::new(PaidOrderProcessor::new(db.pool().clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_handle = tokio::spawn(supervise_consumer(
        config.kafka.clone(),
        processor,
        producer.clone(),
        shutdown_rx,
    ));

    let status = Arc::new(StatusService::new(db.pool().clone()));
    let app = routes::router(AppState::new(db.clone(), status));

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "消费者任务异常退出");
    }

    producer.flush(PRODUCER_FLUSH_TIMEOUT);
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// 运行消费者，异常退出后退避重建，直到收到关闭信号
async fn supervise_consumer(
    config: KafkaConfig,
    processor: Arc<PaidOrderProcessor>,
    producer: KafkaProducer,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RestartBackoff::new(RetryPolicy::default(), CONSUMER_HEALTHY_AFTER);

    loop {
        let started = Instant::now();
        let outcome = match FulfillmentConsumer::new(&config, processor.clone(), producer.clone()) {
            Ok(consumer) => consumer.run(shutdown.clone()).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => break,
            Err(e) => {
                let delay = backoff.on_failure(started.elapsed());
                warn!(
                    error = %e,
                    failures = backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "消费者异常退出，稍后重建"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait_for(|stopping| *stopping) => break,
                }
            }
        }
    }

    info!("消费者已关闭");
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
