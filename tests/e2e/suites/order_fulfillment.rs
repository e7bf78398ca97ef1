//! 订单履约全链路

use delivery_service::consumer::{AckOutcome, Disposition};
use delivery_service::error::DeliveryError;
use fulfillment_shared::events::{IncomingEvent, decode_event};
use fulfillment_shared::status::DeliveryStatus;
use payment_service::dto::ApproveCommand;
use payment_service::service::ApprovalOutcome;
use uuid::Uuid;

use crate::TestEnvironment;

fn approve_command(order_number: &str) -> ApproveCommand {
    ApproveCommand {
        order_number: order_number.to_string(),
        provider: "mockpay".to_string(),
    }
}

fn is_conflict(err: &DeliveryError) -> bool {
    err.error_code() == "INVALID_TRANSITION"
}

#[tokio::test]
#[ignore] // 需要数据库连接
async fn test_paid_order_flows_to_delivery() {
    let env = TestEnvironment::setup().await;
    let order_number = format!("ORD-1-{}", Uuid::new_v4());
    env.create_order(&order_number, Some(1), 12000, &[("SKU-A", 2)])
        .await;

    // 1. 支付审批，事件即时发布
    let outcome = env
        .approval
        .approve(&approve_command(&order_number))
        .await
        .unwrap();
    let ApprovalOutcome::Approved {
        event_id,
        published,
        ..
    } = outcome
    else {
        panic!("expected Approved, got {outcome:?}");
    };
    assert!(published);

    // 2. 消息体按线上格式往返
    let deliveries = env.bridge.deliveries().await;
    assert_eq!(deliveries.len(), 1);
    let (msg, disposition) = &deliveries[0];
    assert_eq!(
        *disposition,
        Disposition::Ack {
            outcome: AckOutcome::Created
        }
    );
    let IncomingEvent::OrderPaid(event) = decode_event(&msg.payload).unwrap() else {
        panic!("expected order paid event");
    };
    assert_eq!(event.event_id(), event_id);
    assert_eq!(event.data().total_amount, 12000);
    assert_eq!(event.data().items[0].skuid, "SKU-A");
    assert_eq!(event.data().items[0].qty, 2);

    // 3. 配送侧已生成 READY 订单
    let order = env.status.get_order(&order_number).await.unwrap();
    assert_eq!(order.order_status, "READY");
    assert_eq!(order.unit, 2);
    assert_eq!(order.cost, Some(12000));

    // 4. 状态流转
    assert_eq!(
        env.status
            .update_status(&order_number, "SHIPPING")
            .await
            .unwrap(),
        DeliveryStatus::Shipping
    );
    let err = env
        .status
        .update_status(&order_number, "READY")
        .await
        .unwrap_err();
    assert!(is_conflict(&err));
    let err = env
        .status
        .update_status(&order_number, "SHIPPING")
        .await
        .unwrap_err();
    assert!(is_conflict(&err));

    let order = env.status.get_order(&order_number).await.unwrap();
    assert_eq!(order.order_status, "SHIPPING");
}

#[tokio::test]
#[ignore] // 需要数据库连接
async fn test_redelivery_and_repeated_approval_have_no_effect() {
    let env = TestEnvironment::setup().await;
    let order_number = format!("ORD-{}", Uuid::new_v4());
    env.create_order(&order_number, None, 800, &[("SKU-B", 1)])
        .await;

    env.approval
        .approve(&approve_command(&order_number))
        .await
        .unwrap();

    // 重复审批不会产生新事件
    let second = env
        .approval
        .approve(&approve_command(&order_number))
        .await
        .unwrap();
    assert!(matches!(second, ApprovalOutcome::AlreadyPaid { .. }));

    let deliveries = env.bridge.deliveries().await;
    assert_eq!(deliveries.len(), 1);

    // broker 重投同一条消息
    let (msg, _) = &deliveries[0];
    for _ in 0..3 {
        assert_eq!(
            env.bridge.redeliver(msg).await,
            Disposition::Ack {
                outcome: AckOutcome::Duplicate
            }
        );
    }

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE order_number = $1")
        .bind(&order_number)
        .fetch_one(&env.delivery_pool)
        .await
        .unwrap();
    assert_eq!(count, 1);

    let order = env.status.get_order(&order_number).await.unwrap();
    assert!(order.customer_id.is_none());
}
