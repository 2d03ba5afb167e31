//! Rendezvous poller: watches the notification table the simulator writes
//! to learn when consumption starts and when a commit happened.
//!
//! Every wait is bounded by a [`PollPolicy`] deadline and can be cancelled
//! through a watch channel.

use std::future::Future;
use std::time::Duration;
use tmqrig_core::{sql, HarnessConfig, HarnessError, HarnessResult, NotifyRow, Phase, NOTIFY_TABLE};
use tmqrig_storage::SqlExecutor;
use tokio::sync::watch;
use tokio::time::Instant;

// ============================================================================
// POLL POLICY
// ============================================================================

/// Interval, deadline and optional cancellation for one wait.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub deadline: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl PollPolicy {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            deadline,
            cancel: None,
        }
    }

    /// Policy for the notification table.
    pub fn notify(config: &HarnessConfig) -> Self {
        Self::new(config.notify_poll_interval, config.wait_deadline)
    }

    /// Policy for the result table.
    pub fn results(config: &HarnessConfig) -> Self {
        Self::new(config.result_poll_interval, config.wait_deadline)
    }

    /// Abort the wait once `cancel` becomes `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }
}

/// Run `attempt` every `policy.interval` until it yields a value.
///
/// A final attempt runs at the deadline before giving up with
/// [`HarnessError::WaitExceeded`].
pub async fn poll_until<T, F, Fut>(policy: &PollPolicy, what: &str, mut attempt: F) -> HarnessResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HarnessResult<Option<T>>>,
{
    let started = Instant::now();
    let deadline = started + policy.deadline;
    let mut cancel = policy.cancel.clone();
    let mut attempts: u64 = 0;

    loop {
        if cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false) {
            tracing::info!(what, attempts, "Wait cancelled");
            return Err(HarnessError::Cancelled {
                what: what.to_string(),
            });
        }

        attempts += 1;
        if let Some(value) = attempt().await? {
            tracing::debug!(what, attempts, elapsed = ?started.elapsed(), "Wait satisfied");
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(what, attempts, deadline = ?policy.deadline, "Wait deadline exceeded");
            return Err(HarnessError::wait_exceeded(what, policy.deadline));
        }
        let pause = policy.interval.min(deadline - now);

        let mut sender_gone = false;
        match cancel.as_mut() {
            Some(rx) => {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = rx.changed() => sender_gone = changed.is_err(),
                }
            }
            None => tokio::time::sleep(pause).await,
        }
        if sender_gone {
            // Nobody can cancel any more.
            cancel = None;
        }
    }
}

// ============================================================================
// NOTIFICATION TABLE
// ============================================================================

/// Read every notification row. A missing table means the simulator has not
/// created it yet and reads as zero rows.
pub async fn read_notify_rows(executor: &dyn SqlExecutor, cdb: &str) -> HarnessResult<Vec<NotifyRow>> {
    let result = match executor.execute(&sql::select_all(cdb, NOTIFY_TABLE)).await {
        Ok(result) => result,
        Err(e) if e.is_missing_table() => {
            tracing::debug!(cdb, error = %e, "Notification table not created yet");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    result
        .rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            NotifyRow::from_row(index, row).map_err(|source| HarnessError::ResultDecode {
                table: format!("{}.{}", cdb, NOTIFY_TABLE),
                row: index,
                source,
            })
        })
        .collect()
}

/// Current phase, `None` when the rows encode no known phase.
pub async fn observe_phase(executor: &dyn SqlExecutor, cdb: &str) -> HarnessResult<Option<Phase>> {
    let rows = read_notify_rows(executor, cdb).await?;
    Ok(Phase::from_rows(&rows))
}

async fn wait_for_rows(
    executor: &dyn SqlExecutor,
    cdb: &str,
    policy: &PollPolicy,
    target: Phase,
    matches: fn(&[NotifyRow]) -> bool,
) -> HarnessResult<()> {
    let what = format!("{} phase", target);
    poll_until(policy, &what, || check_notify_rows(executor, cdb, matches)).await?;
    tracing::info!(cdb, phase = %target, "Phase reached");
    Ok(())
}

async fn check_notify_rows(
    executor: &dyn SqlExecutor,
    cdb: &str,
    matches: fn(&[NotifyRow]) -> bool,
) -> HarnessResult<Option<()>> {
    let rows = read_notify_rows(executor, cdb).await?;
    tracing::debug!(
        cdb,
        rows = rows.len(),
        phase = ?Phase::from_rows(&rows),
        "Polled notification table"
    );
    Ok(matches(&rows).then_some(()))
}

/// Wait until the notification table holds exactly one row with value 0.
pub async fn wait_for_consumption_start(
    executor: &dyn SqlExecutor,
    cdb: &str,
    policy: &PollPolicy,
) -> HarnessResult<()> {
    wait_for_rows(executor, cdb, policy, Phase::Consuming, |rows| {
        matches!(rows, [first] if first.value == 0)
    })
    .await
}

/// Wait until the notification table holds exactly two rows, the second
/// with value 1.
pub async fn wait_for_commit(executor: &dyn SqlExecutor, cdb: &str, policy: &PollPolicy) -> HarnessResult<()> {
    wait_for_rows(executor, cdb, policy, Phase::Committed, |rows| {
        matches!(rows, [_, second] if second.value == 1)
    })
    .await
}
