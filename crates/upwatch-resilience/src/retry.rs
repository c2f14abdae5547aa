//! ---
//! upw_section: "07-resilience-fault-tolerance"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Unbounded retry loop with failure escalation."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::fmt::Display;
use std::future::Future;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::backoff::Backoff;

/// Retries an operation until it succeeds, escalating log severity once the
/// number of consecutive failures reaches `escalate_after`.
#[derive(Debug)]
pub struct RetryLoop {
    backoff: Backoff,
    escalate_after: u32,
}

impl RetryLoop {
    /// Create a loop around the provided backoff tracker.
    pub fn new(backoff: Backoff, escalate_after: u32) -> Self {
        Self {
            backoff,
            escalate_after: escalate_after.max(1),
        }
    }

    /// Run `operation` until it returns `Ok`. The closure receives the 1-indexed
    /// attempt number. `on_escalated` fires for every failure at or beyond the
    /// escalation threshold.
    pub async fn run<T, E, F, Fut, G>(
        &mut self,
        task: &str,
        mut operation: F,
        mut on_escalated: G,
    ) -> T
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        G: FnMut(u32, &E),
    {
        self.backoff.reset();
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(task, attempt, "operation succeeded after retries");
                    }
                    self.backoff.reset();
                    return value;
                }
                Err(err) => {
                    let delay = self.backoff.next_delay();
                    if attempt >= self.escalate_after {
                        error!(
                            task,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "operation still failing; retrying"
                        );
                        on_escalated(attempt, &err);
                    } else {
                        warn!(
                            task,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "operation failed; retrying"
                        );
                    }
                    sleep(delay).await;
                }
            }
        }
    }
}
