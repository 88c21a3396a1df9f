//! Handlers bundled with the binary.

pub mod payment;

use std::sync::Arc;
use std::time::Duration;

use shuttle_core::WorkerBuilder;

pub use self::payment::{PAYMENT_TOPIC, PaymentHandler};

/// Register every bundled handler, honouring `[topics.*]` overrides.
pub fn register(builder: WorkerBuilder) -> WorkerBuilder {
    let config = builder.config();
    let mut topic = config.topic_config(PAYMENT_TOPIC);
    let lock_overridden = config
        .topics
        .get(PAYMENT_TOPIC)
        .is_some_and(|t| t.lock_duration_ms.is_some());
    if !lock_overridden {
        topic.lock_duration = Duration::from_millis(PaymentHandler::LOCK_DURATION_MS);
    }
    builder
        .register(PAYMENT_TOPIC, Arc::new(PaymentHandler::default()), topic)
        .expect_topics(&[PAYMENT_TOPIC])
}
