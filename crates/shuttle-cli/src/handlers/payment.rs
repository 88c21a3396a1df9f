//! `process-payment`: validates the payment variables and settles the payment.

use std::time::Duration;

use async_trait::async_trait;
use shuttle_core::domain::{ExecutionResult, ExternalTask};
use shuttle_core::ExternalTaskHandler;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const PAYMENT_TOPIC: &str = "process-payment";
pub const PAYMENT_FAILED: &str = "PAYMENT_FAILED";

pub struct PaymentHandler {
    processing_time: Duration,
}

impl PaymentHandler {
    pub const LOCK_DURATION_MS: u64 = 60_000;

    pub fn with_processing_time(processing_time: Duration) -> Self {
        Self { processing_time }
    }
}

impl Default for PaymentHandler {
    fn default() -> Self {
        Self::with_processing_time(Duration::from_secs(1))
    }
}

#[async_trait]
impl ExternalTaskHandler for PaymentHandler {
    async fn handle(
        &self,
        task: &ExternalTask,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionResult> {
        // a variable of the wrong type is a technical failure and goes through retries
        let amount: Option<f64> = task.variable("amount")?;
        let customer_id: Option<String> = task.variable("customerId")?;
        info!(
            task_id = %task.id,
            amount = ?amount,
            customer_id = ?customer_id,
            retries = ?task.retries,
            "processing payment"
        );

        let valid_amount = amount.filter(|a| *a > 0.0);
        let customer_id = customer_id.filter(|c| !c.trim().is_empty());
        let (Some(amount), Some(customer_id)) = (valid_amount, customer_id) else {
            warn!(task_id = %task.id, "payment rejected");
            return Ok(ExecutionResult::bpmn_error(
                PAYMENT_FAILED,
                "Payment processing failed",
            ));
        };

        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("payment for task {} interrupted", task.id),
            _ = tokio::time::sleep(self.processing_time) => {}
        }

        info!(task_id = %task.id, amount, %customer_id, "payment processed");
        Ok(ExecutionResult::complete().with_variable("paymentStatus", "completed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;
    use shuttle_core::domain::{TaskId, Topic, VariableValue, WorkerId, variables};

    fn task(vars: Vec<(&str, VariableValue)>) -> ExternalTask {
        ExternalTask::new(
            TaskId::new("t-1"),
            Topic::new(PAYMENT_TOPIC),
            WorkerId::new("w"),
            Utc::now() + chrono::Duration::seconds(60),
        )
        .with_variables(variables(vars))
    }

    fn handler() -> PaymentHandler {
        PaymentHandler::with_processing_time(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn valid_payment_completes() {
        let task = task(vec![
            ("amount", VariableValue::Double(150.75)),
            ("customerId", VariableValue::String("C-42".into())),
        ]);
        let result = handler()
            .handle(&task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result,
            ExecutionResult::complete().with_variable("paymentStatus", "completed")
        );
    }

    #[rstest]
    #[case::no_amount(vec![("customerId", VariableValue::String("C-42".into()))])]
    #[case::zero_amount(vec![
        ("amount", VariableValue::Double(0.0)),
        ("customerId", VariableValue::String("C-42".into())),
    ])]
    #[case::negative_amount(vec![
        ("amount", VariableValue::Integer(-5)),
        ("customerId", VariableValue::String("C-42".into())),
    ])]
    #[case::no_customer(vec![("amount", VariableValue::Double(10.0))])]
    #[case::blank_customer(vec![
        ("amount", VariableValue::Double(10.0)),
        ("customerId", VariableValue::String("  ".into())),
    ])]
    #[tokio::test]
    async fn invalid_payment_is_a_business_error(#[case] vars: Vec<(&str, VariableValue)>) {
        let result = handler()
            .handle(&task(vars), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result,
            ExecutionResult::bpmn_error(PAYMENT_FAILED, "Payment processing failed")
        );
    }

    #[tokio::test]
    async fn mistyped_amount_is_a_technical_error() {
        let task = task(vec![
            ("amount", VariableValue::String("ten".into())),
            ("customerId", VariableValue::String("C-42".into())),
        ]);
        let err = handler()
            .handle(&task, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("amount"), "{err}");
    }

    #[tokio::test]
    async fn cancellation_interrupts_processing() {
        let task = task(vec![
            ("amount", VariableValue::Double(10.0)),
            ("customerId", VariableValue::String("C-42".into())),
        ]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let slow = PaymentHandler::with_processing_time(Duration::from_secs(60));
        assert!(slow.handle(&task, cancel).await.is_err());
    }
}
