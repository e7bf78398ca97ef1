//! 测试套件

mod order_fulfillment;
