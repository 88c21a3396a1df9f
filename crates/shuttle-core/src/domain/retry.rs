//! RetryPolicy - 技術的失敗のリトライ計算
//!
//! # リトライ回数
//! リトライカウンタの正本はエンジン側にあります。ワーカーはタスクと一緒に
//! 受け取った `retries` を読み、失敗時に次の値を報告するだけです。
//!
//! - `retries = Some(n)`: 残り回数は `n - 1`（0 で止まる）
//! - `retries = None`（初回失敗）: 残り回数は `default_retries - 1`
//!
//! # リトライ間隔
//! - 残り回数 > 0: `retry_delay * multiplier^(attempt-1)`、上限 `max_delay`
//! - 残り回数 = 0: 間隔 0。エンジンがインシデントを作成する
//!
//! # 残り 0 回
//! 0 回は例外ではなく、報告される通常の結果です。
//! `Failure { retries: 0 }` を送らないとインシデントは作られません。

use std::time::Duration;

use super::result::ExecutionResult;
use super::task::ExternalTask;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retry budget assumed when the task carries no count yet.
    pub default_retries: u32,

    /// Delay before the engine hands the task out again after the first failure.
    pub retry_delay: Duration,

    /// Growth factor per consumed retry; `1.0` keeps the delay fixed.
    pub multiplier: f64,

    /// Upper bound for the computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_retries: 3,
            retry_delay: Duration::from_secs(5),
            multiplier: 1.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Retries left after one more failure of `task`.
    ///
    /// A task without a count starts from `default_retries`.
    pub fn remaining_after_failure(&self, task: &ExternalTask) -> u32 {
        task.retries
            .unwrap_or(self.default_retries)
            .saturating_sub(1)
    }

    /// Delay for the `attempt`-th retry (1-indexed).
    ///
    /// delay = retry_delay * multiplier^(attempt - 1), capped at `max_delay`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_secs = self.retry_delay.as_secs_f64();
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exp);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Build the failure report for `task`.
    pub fn failure_for(
        &self,
        task: &ExternalTask,
        message: impl Into<String>,
        details: Option<String>,
    ) -> ExecutionResult {
        let remaining = self.remaining_after_failure(task);
        let retry_timeout = if remaining == 0 {
            Duration::ZERO
        } else {
            let attempt = self.default_retries.saturating_sub(remaining).max(1);
            self.next_delay(attempt)
        };
        ExecutionResult::failure(message, details, remaining, retry_timeout)
    }

    /// Give a non-terminal failure without a delay the policy delay, so the
    /// engine never re-offers a failing task immediately.
    pub fn normalize(&self, result: ExecutionResult) -> ExecutionResult {
        match result {
            ExecutionResult::Failure {
                message,
                details,
                retries,
                retry_timeout,
            } if retries > 0 && retry_timeout.is_zero() => ExecutionResult::Failure {
                message,
                details,
                retries,
                retry_timeout: self.retry_delay,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, Topic, WorkerId};
    use chrono::Utc;
    use rstest::rstest;

    fn task(retries: Option<u32>) -> ExternalTask {
        ExternalTask::new(
            TaskId::new("t"),
            Topic::new("process-payment"),
            WorkerId::new("w"),
            Utc::now(),
        )
        .with_retries(retries)
    }

    #[rstest]
    #[case(None, 2)]
    #[case(Some(3), 2)]
    #[case(Some(2), 1)]
    #[case(Some(1), 0)]
    #[case(Some(0), 0)]
    fn remaining_counts_down_from_the_baseline(#[case] retries: Option<u32>, #[case] left: u32) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.remaining_after_failure(&task(retries)), left);
    }

    #[test]
    fn failure_with_retries_left_has_positive_delay() {
        let policy = RetryPolicy::default();
        let r = policy.failure_for(&task(None), "gateway down", None);

        let ExecutionResult::Failure {
            retries,
            retry_timeout,
            ..
        } = r
        else {
            panic!("expected Failure");
        };
        assert_eq!(retries, 2);
        assert_eq!(retry_timeout, Duration::from_secs(5));
    }

    #[test]
    fn last_failure_is_still_reported_with_zero_retries() {
        let policy = RetryPolicy::default();
        let r = policy.failure_for(&task(Some(1)), "gateway down", Some("trace".into()));

        assert!(r.is_incident());
        assert_eq!(
            r,
            ExecutionResult::failure("gateway down", Some("trace".into()), 0, Duration::ZERO)
        );
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            default_retries: 5,
            retry_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        };

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));

        // second failure (4 left -> 3 left) uses the second delay
        let r = policy.failure_for(&task(Some(4)), "x", None);
        assert_eq!(r, ExecutionResult::failure("x", None, 3, Duration::from_secs(4)));
    }

    #[test]
    fn normalize_fills_in_missing_delay() {
        let policy = RetryPolicy::default();
        let r = policy.normalize(ExecutionResult::failure("x", None, 1, Duration::ZERO));
        assert_eq!(r, ExecutionResult::failure("x", None, 1, Duration::from_secs(5)));

        let terminal = ExecutionResult::failure("x", None, 0, Duration::ZERO);
        assert_eq!(policy.normalize(terminal.clone()), terminal);
    }
}
