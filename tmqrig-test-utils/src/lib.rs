//! TMQRIG Test Utilities
//!
//! Shared test infrastructure for the TMQRIG workspace:
//! - Proptest generators for scenario and coordination types
//! - Fixtures for common scenarios and fast harness configs
//! - Custom assertions for harness results
//! - A simulated consumer standing in for `tmq_sim` against the mock store

// Re-export the mock executor from its source crate
pub use tmqrig_storage::{ExecutorFactory, MockExecutor, MockExecutorFactory, SqlExecutor};

// Re-export core types for convenience
pub use tmqrig_core::{
    ColumnKind, ColumnSpec, ConsumeResult, ConsumerId, ConsumerInfo, ExecutorError, HarnessConfig,
    HarnessError, HarnessResult, NotifyRow, Phase, ScenarioConfig, ValidationError, Value,
    CONSUME_INFO_TABLE, CONSUME_RESULT_TABLE, NOTIFY_TABLE,
};

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// SIMULATED CONSUMER
// ============================================================================

/// How the simulated consumer behaves.
#[derive(Debug, Clone)]
pub struct SimulatorBehavior {
    /// Delay before reading the producer-config table
    pub start_delay: Duration,
    /// Time spent consuming after announcing the start
    pub consume_delay: Duration,
    /// Interval between checks of the produced row count
    pub poll_interval: Duration,
    /// Give up waiting for `expect_msg_count` rows after this long
    pub consume_timeout: Duration,
    /// Delay between the last notification and the result rows
    pub finish_delay: Duration,
    /// Never write notifications or results
    pub stall: bool,
}

impl Default for SimulatorBehavior {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(20),
            consume_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            consume_timeout: Duration::from_secs(5),
            finish_delay: Duration::from_millis(20),
            stall: false,
        }
    }
}

/// Plays the part of `tmq_sim` against a [`MockExecutor`] store.
///
/// Reads `consumeinfo`, announces consumption with a `(now, 0)` notification,
/// counts the rows in the data database, writes `(now, 1)` when any consumer
/// commits manually and finally one `consumeresult` row per consumer.
#[derive(Debug, Clone)]
pub struct SimulatedConsumer {
    store: MockExecutor,
    db_name: String,
    cdb: String,
    behavior: SimulatorBehavior,
}

impl SimulatedConsumer {
    pub fn new(store: &MockExecutor, db_name: impl Into<String>, cdb: impl Into<String>) -> Self {
        Self {
            store: store.session(),
            db_name: db_name.into(),
            cdb: cdb.into(),
            behavior: SimulatorBehavior::default(),
        }
    }

    pub fn with_behavior(mut self, behavior: SimulatorBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Consumers registered in the producer-config table.
    pub async fn read_consumers(&self) -> Result<Vec<ConsumerInfo>, ExecutorError> {
        let result = self
            .store
            .execute(&format!("select * from {}.{}", self.cdb, CONSUME_INFO_TABLE))
            .await?;
        result.rows.iter().map(|row| decode_consumer(row)).collect()
    }

    /// Rows currently stored across every table of the data database.
    pub fn produced_rows(&self) -> i64 {
        self.store
            .table_names(&self.db_name)
            .iter()
            .map(|table| self.store.row_count(&self.db_name, table) as i64)
            .sum()
    }

    fn populated_tables(&self) -> i64 {
        self.store
            .table_names(&self.db_name)
            .iter()
            .filter(|table| self.store.row_count(&self.db_name, table) > 0)
            .count() as i64
    }

    async fn notify(&self, cmd: i32) -> Result<(), ExecutorError> {
        self.store
            .execute(&format!(
                "create table if not exists {}.{} (ts timestamp, cmdid int)",
                self.cdb, NOTIFY_TABLE
            ))
            .await?;
        self.store
            .execute(&format!("insert into {}.{} values (now, {})", self.cdb, NOTIFY_TABLE, cmd))
            .await?;
        Ok(())
    }

    async fn wait_for_rows(&self, expected: i64) -> i64 {
        let started = Instant::now();
        loop {
            let produced = self.produced_rows();
            if produced >= expected || started.elapsed() >= self.behavior.consume_timeout {
                return produced;
            }
            tokio::time::sleep(self.behavior.poll_interval).await;
        }
    }

    /// Run one simulated session and return the results it wrote.
    pub async fn run(self) -> Result<Vec<ConsumeResult>, ExecutorError> {
        tokio::time::sleep(self.behavior.start_delay).await;
        if self.behavior.stall {
            tracing::debug!(db = %self.db_name, "Simulated consumer stalling");
            return Ok(Vec::new());
        }

        let consumers = self.read_consumers().await?;
        self.notify(0).await?;
        tokio::time::sleep(self.behavior.consume_delay).await;

        let mut results = Vec::with_capacity(consumers.len());
        for info in &consumers {
            let consumed = self.wait_for_rows(info.expect_msg_count).await;
            results.push(ConsumeResult {
                consumer_id: info.consumer_id,
                consumed_msg_count: self.populated_tables(),
                consumed_row_count: consumed,
                check_result: i32::from(info.check_data),
            });
        }

        if consumers.iter().any(|c| c.manual_commit) {
            self.notify(1).await?;
        }

        tokio::time::sleep(self.behavior.finish_delay).await;
        for result in &results {
            self.store
                .execute(&format!(
                    "insert into {}.{} values (now, {}, {}, {}, {})",
                    self.cdb,
                    CONSUME_RESULT_TABLE,
                    result.consumer_id,
                    result.consumed_msg_count,
                    result.consumed_row_count,
                    result.check_result
                ))
                .await?;
        }
        tracing::debug!(db = %self.db_name, consumers = results.len(), "Simulated consumer finished");
        Ok(results)
    }

    pub fn spawn(self) -> JoinHandle<Result<Vec<ConsumeResult>, ExecutorError>> {
        tokio::spawn(self.run())
    }
}

fn decode_consumer(row: &[Value]) -> Result<ConsumerInfo, ExecutorError> {
    let int_at = |idx: usize| {
        row.get(idx)
            .and_then(Value::as_i64)
            .ok_or_else(|| ExecutorError::InvalidResponse {
                reason: format!("consumeinfo column {} is not an integer", idx),
            })
    };
    let text_at = |idx: usize| {
        row.get(idx)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::InvalidResponse {
                reason: format!("consumeinfo column {} is not text", idx),
            })
    };
    let consumer_id = ConsumerId::try_from(int_at(1)?).map_err(|e| ExecutorError::InvalidResponse {
        reason: e.to_string(),
    })?;
    Ok(ConsumerInfo::new(consumer_id, text_at(2)?, text_at(3)?, int_at(4)?)
        .with_check_data(int_at(5)? != 0)
        .with_manual_commit(int_at(6)? != 0))
}

/// Install a test-writer subscriber; later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tmqrig=debug")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for scenario and coordination types.

    use super::*;
    use proptest::prelude::*;

    /// Plain SQL identifier.
    pub fn arb_identifier() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    pub fn arb_column_kind() -> impl Strategy<Value = ColumnKind> {
        prop_oneof![
            Just(ColumnKind::TinyInt),
            Just(ColumnKind::SmallInt),
            Just(ColumnKind::Int),
            Just(ColumnKind::BigInt),
            Just(ColumnKind::Float),
            Just(ColumnKind::Double),
            Just(ColumnKind::Bool),
            Just(ColumnKind::Binary),
            Just(ColumnKind::Varchar),
            Just(ColumnKind::NChar),
        ]
    }

    pub fn arb_column_spec() -> impl Strategy<Value = ColumnSpec> {
        (arb_column_kind(), 1u32..64, 1u32..4).prop_map(|(kind, len, count)| {
            let spec = if kind.is_string() {
                ColumnSpec::string(kind, len)
            } else {
                ColumnSpec::new(kind)
            };
            spec.with_count(count)
        })
    }

    /// Small, valid scenario configs.
    pub fn arb_scenario_config() -> impl Strategy<Value = ScenarioConfig> {
        (
            arb_identifier(),
            1u32..5,
            1u64..50,
            1u64..20,
            prop::collection::vec(arb_column_spec(), 1..4),
            prop::collection::vec(arb_column_spec(), 1..3),
        )
            .prop_map(|(db_name, ctb_num, rows_per_table, batch_size, columns, tags)| ScenarioConfig {
                db_name,
                ctb_num,
                rows_per_table,
                batch_size,
                columns,
                tags,
                ..ScenarioConfig::default()
            })
    }

    /// Comma-separated list of identifiers.
    pub fn arb_topic_list() -> impl Strategy<Value = String> {
        prop::collection::vec(arb_identifier(), 1..4).prop_map(|topics| topics.join(","))
    }

    pub fn arb_consumer_info() -> impl Strategy<Value = ConsumerInfo> {
        (
            0i32..1000,
            arb_topic_list(),
            "[a-z.]{1,12}:[a-z0-9]{1,8}",
            0i64..100_000,
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(id, topics, keys, expect, check, manual)| {
                ConsumerInfo::new(id, topics, keys, expect)
                    .with_check_data(check)
                    .with_manual_commit(manual)
            })
    }

    /// Notification table contents of any shape.
    pub fn arb_notify_rows() -> impl Strategy<Value = Vec<NotifyRow>> {
        prop::collection::vec(0i32..3, 0..5).prop_map(|values| {
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| NotifyRow::new(i as i32, v))
                .collect()
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common test scenarios.

    use super::*;
    use std::sync::Arc;

    /// Harness config with short poll intervals for mock-backed tests.
    pub fn fast_harness_config() -> HarnessConfig {
        HarnessConfig {
            notify_poll_interval: Duration::from_millis(10),
            result_poll_interval: Duration::from_millis(25),
            wait_deadline: Duration::from_secs(10),
            ..HarnessConfig::default()
        }
    }

    /// `ctb_num` child tables of `rows` rows each, flushed every `batch` rows.
    pub fn small_scenario(ctb_num: u32, rows: u64, batch: u64) -> ScenarioConfig {
        ScenarioConfig {
            ctb_num,
            rows_per_table: rows,
            batch_size: batch,
            vgroups: 1,
            ..ScenarioConfig::default()
        }
    }

    /// Consumer on `topic_a` with auto commit.
    pub fn auto_commit_consumer(id: ConsumerId, expect_msg_count: i64) -> ConsumerInfo {
        ConsumerInfo::new(
            id,
            "topic_a",
            "group.id:cgrp1,enable.auto.commit:true,auto.offset.reset:earliest",
            expect_msg_count,
        )
    }

    /// Consumer on `topic_a` committing manually.
    pub fn manual_commit_consumer(id: ConsumerId, expect_msg_count: i64) -> ConsumerInfo {
        ConsumerInfo::new(
            id,
            "topic_a",
            "group.id:cgrp1,enable.auto.commit:false,auto.offset.reset:earliest",
            expect_msg_count,
        )
        .with_manual_commit(true)
    }

    pub fn mock_factory(store: &MockExecutor) -> Arc<MockExecutorFactory> {
        Arc::new(MockExecutorFactory::new(store))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for harness results.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &HarnessResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &HarnessResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert that a wait gave up at its deadline.
    #[track_caller]
    pub fn assert_wait_exceeded<T: std::fmt::Debug>(result: &HarnessResult<T>) {
        match result {
            Err(HarnessError::WaitExceeded { .. }) => {}
            other => panic!("Expected WaitExceeded, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cancelled<T: std::fmt::Debug>(result: &HarnessResult<T>) {
        match result {
            Err(HarnessError::Cancelled { .. }) => {}
            other => panic!("Expected Cancelled, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &HarnessResult<T>) {
        match result {
            Err(HarnessError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    /// Assert that the coordination tables exist and are empty, and that no
    /// notification rows are left over.
    #[track_caller]
    pub fn assert_coordination_empty(store: &MockExecutor, cdb: &str) {
        for table in [CONSUME_INFO_TABLE, CONSUME_RESULT_TABLE] {
            assert!(store.has_table(cdb, table), "{}.{} missing", cdb, table);
            assert_eq!(store.row_count(cdb, table), 0, "{}.{} not empty", cdb, table);
        }
        assert_eq!(
            store.row_count(cdb, NOTIFY_TABLE),
            0,
            "{}.{} still holds phase rows",
            cdb,
            NOTIFY_TABLE
        );
    }

    /// Assert consumed row counts, in storage order.
    #[track_caller]
    pub fn assert_consumed_rows(actual: &[i64], expected: &[i64]) {
        assert_eq!(actual, expected, "Consumed row counts mismatch");
    }
}

// ============================================================================
// TESTS
// ============================================================================
