//! # Bounded polling
//!
//! Every wait in the provisioner (platform tasks, workload network, service
//! activation) is a fixed-interval poll with a fixed attempt budget. Nothing
//! waits forever.

use crate::error::ProvisionError;
use pve_client::{PveClientTrait, PveError};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Fixed-interval poll with an attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedPoll {
    /// Delay between two probes
    pub interval: Duration,
    /// Number of probes before giving up (at least one probe always runs)
    pub max_attempts: u32,
}

impl BoundedPoll {
    #[must_use]
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Upper bound of the time spent sleeping
    #[must_use]
    pub fn total_wait(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }

    /// Probe until it yields a value.
    ///
    /// The probe returns `Ok(Some(_))` when done, `Ok(None)` to try again and
    /// `Err(_)` to stop immediately. Exhausting the budget yields
    /// [`ProvisionError::Timeout`] without diagnostics; callers attach them.
    pub async fn until<T, F, Fut>(&self, what: &str, mut probe: F) -> Result<T, ProvisionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, ProvisionError>>,
    {
        for attempt in 1..=self.max_attempts {
            if let Some(value) = probe(attempt).await? {
                return Ok(value);
            }
            debug!("{} not ready (attempt {}/{})", what, attempt, self.max_attempts);
            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(ProvisionError::Timeout {
            what: what.to_string(),
            waited: self.total_wait(),
            diagnostics: None,
        })
    }
}

/// Wait for a platform task to finish and fail if it did not end with `OK`
pub async fn wait_for_task(
    client: &dyn PveClientTrait,
    node: &str,
    upid: &str,
    poll: BoundedPoll,
) -> Result<(), ProvisionError> {
    let status = poll
        .until(&format!("task {}", upid), |_| async move {
            let status = client.task_status(node, upid).await?;
            Ok(status.is_finished().then_some(status))
        })
        .await?;

    if status.succeeded() {
        Ok(())
    } else {
        Err(PveError::Task {
            upid: upid.to_string(),
            exit_status: status.exitstatus.unwrap_or_else(|| "unknown".to_string()),
        }
        .into())
    }
}
