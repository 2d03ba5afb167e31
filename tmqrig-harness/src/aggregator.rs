//! Result aggregation: waits for one result row per consumer, then decodes
//! them all.

use crate::rendezvous::{poll_until, PollPolicy};
use tmqrig_core::{
    sql, ConsumeResult, ConsumerId, HarnessError, HarnessResult, CONSUME_RESULT_TABLE,
};
use tmqrig_storage::SqlExecutor;

/// Per-consumer results in the order the store returned them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerResults {
    results: Vec<ConsumeResult>,
}

impl ConsumerResults {
    pub fn new(results: Vec<ConsumeResult>) -> Self {
        Self { results }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConsumeResult> {
        self.results.iter()
    }

    pub fn as_slice(&self) -> &[ConsumeResult] {
        &self.results
    }

    /// Consumed row counts in storage order.
    pub fn consumed_row_counts(&self) -> Vec<i64> {
        self.results.iter().map(|r| r.consumed_row_count).collect()
    }

    /// Results ordered by consumer id.
    pub fn sorted_by_consumer(&self) -> Vec<ConsumeResult> {
        let mut sorted = self.results.clone();
        sorted.sort_by_key(|r| r.consumer_id);
        sorted
    }

    pub fn get(&self, consumer_id: ConsumerId) -> Option<&ConsumeResult> {
        self.results.iter().find(|r| r.consumer_id == consumer_id)
    }

    pub fn total_rows(&self) -> i64 {
        self.results.iter().map(|r| r.consumed_row_count).sum()
    }

    pub fn total_messages(&self) -> i64 {
        self.results.iter().map(|r| r.consumed_msg_count).sum()
    }

    pub fn into_vec(self) -> Vec<ConsumeResult> {
        self.results
    }
}

impl IntoIterator for ConsumerResults {
    type Item = ConsumeResult;
    type IntoIter = std::vec::IntoIter<ConsumeResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a ConsumerResults {
    type Item = &'a ConsumeResult;
    type IntoIter = std::slice::Iter<'a, ConsumeResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

/// Poll the result table until it holds exactly `expected_consumers` rows,
/// then decode them.
///
/// Row content is not read before the count matches.
pub async fn collect_results(
    executor: &dyn SqlExecutor,
    expected_consumers: usize,
    cdb: &str,
    policy: &PollPolicy,
) -> HarnessResult<ConsumerResults> {
    let results = poll_until(policy, "consumer results", || {
        try_collect_results(executor, cdb, expected_consumers)
    })
    .await?;

    for result in &results {
        tracing::info!(
            consumer_id = result.consumer_id,
            consumed_msgs = result.consumed_msg_count,
            consumed_rows = result.consumed_row_count,
            check_result = result.check_result,
            "Consumer result"
        );
    }
    Ok(ConsumerResults::new(results))
}

async fn try_collect_results(
    executor: &dyn SqlExecutor,
    cdb: &str,
    expected: usize,
) -> HarnessResult<Option<Vec<ConsumeResult>>> {
    let result = executor.execute(&sql::select_all(cdb, CONSUME_RESULT_TABLE)).await?;
    let count = result.row_count();
    if count != expected {
        tracing::debug!(cdb, count, expected, "Waiting for results");
        return Ok(None);
    }

    let decoded = result
        .rows
        .iter()
        .enumerate()
        .map(|(row, cells)| {
            ConsumeResult::from_row(cells).map_err(|source| HarnessError::ResultDecode {
                table: format!("{}.{}", cdb, CONSUME_RESULT_TABLE),
                row,
                source,
            })
        })
        .collect::<HarnessResult<Vec<_>>>()?;
    Ok(Some(decoded))
}
