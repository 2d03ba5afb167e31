//! Per-run orchestrator tying the harness components together.
//!
//! An [`Orchestrator`] owns one primary executor for coordination work, hands
//! producers their own executors through the factory, and keeps every
//! simulator and producer it started so teardown can stop them.

use crate::aggregator::{self, ConsumerResults};
use crate::consumer_info;
use crate::launcher::{self, ExitInfo, SimulatorCommand, SimulatorProcess};
use crate::producer::{self, InsertPlan, InsertReport, ProducerHandle};
use crate::rendezvous::{self, PollPolicy};
use crate::schema;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tmqrig_core::{ConsumerInfo, HarnessConfig, HarnessResult, Phase, ScenarioConfig};
use tmqrig_storage::{ExecutorFactory, RestExecutorFactory, SqlExecutor};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// One scenario run.
pub struct Orchestrator {
    run_id: Uuid,
    config: HarnessConfig,
    factory: Arc<dyn ExecutorFactory>,
    executor: Box<dyn SqlExecutor>,
    simulators: Vec<SimulatorProcess>,
    /// Abort handles of spawned producers, keyed by worker name
    producers: Mutex<Vec<(String, AbortHandle)>>,
    cancel: watch::Sender<bool>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.run_id)
            .field("executor", &self.executor.name())
            .field("simulators", &self.simulators.len())
            .finish()
    }
}

impl Orchestrator {
    /// Validate `config` and open the primary executor.
    pub async fn connect(config: HarnessConfig, factory: Arc<dyn ExecutorFactory>) -> HarnessResult<Self> {
        config.validate()?;
        let executor = factory.connect().await?;
        let run_id = Uuid::now_v7();
        let (cancel, _) = watch::channel(false);
        tracing::info!(
            run_id = %run_id,
            executor = executor.name(),
            cdb = %config.coordination_db,
            "Orchestrator connected"
        );
        Ok(Self {
            run_id,
            config,
            factory,
            executor,
            simulators: Vec::new(),
            producers: Mutex::new(Vec::new()),
            cancel,
        })
    }

    /// Connect to the REST endpoint configured through `TMQRIG_*` variables.
    pub async fn from_env() -> HarnessResult<Self> {
        let config = HarnessConfig::from_env();
        let factory = Arc::new(RestExecutorFactory::new(config.clone()));
        Self::connect(config, factory).await
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn executor(&self) -> &dyn SqlExecutor {
        self.executor.as_ref()
    }

    pub fn factory(&self) -> Arc<dyn ExecutorFactory> {
        Arc::clone(&self.factory)
    }

    pub fn cdb(&self) -> &str {
        &self.config.coordination_db
    }

    /// Abort every wait in progress and every later one.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Receiver that flips to `true` on [`Self::cancel`].
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn notify_policy(&self) -> PollPolicy {
        PollPolicy::notify(&self.config).with_cancel(self.cancellation())
    }

    pub fn result_policy(&self) -> PollPolicy {
        PollPolicy::results(&self.config).with_cancel(self.cancellation())
    }

    // ------------------------------------------------------------------------
    // Provisioning and data
    // ------------------------------------------------------------------------

    pub async fn init_coordination_schema(&self) -> HarnessResult<()> {
        schema::init_coordination_schema(self.executor(), self.cdb()).await
    }

    pub async fn reset_producer_config_table(&self) -> HarnessResult<()> {
        schema::reset_producer_config_table(self.executor(), self.cdb()).await
    }

    pub async fn drop_coordination_schema(&self) -> HarnessResult<()> {
        schema::drop_coordination_schema(self.executor(), self.cdb()).await
    }

    pub async fn insert_consumer_info(&self, info: &ConsumerInfo) -> HarnessResult<()> {
        consumer_info::insert_consumer_info(self.executor(), self.cdb(), info).await
    }

    /// Insert every consumer's config row, in order.
    pub async fn insert_consumer_infos(&self, infos: &[ConsumerInfo]) -> HarnessResult<()> {
        for info in infos {
            self.insert_consumer_info(info).await?;
        }
        Ok(())
    }

    pub async fn insert_rows(&self, plan: &InsertPlan) -> HarnessResult<InsertReport> {
        plan.execute(self.executor()).await
    }

    /// Create and fill a data database on the primary executor.
    pub async fn provision_and_populate(&self, config: &ScenarioConfig) -> HarnessResult<InsertReport> {
        producer::provision_and_populate(self.executor(), config, None).await
    }

    /// Create and fill a data database on a background task with its own
    /// executor. Teardown aborts the task if it is still running, even when
    /// the handle was dropped.
    pub fn run_async(&self, config: ScenarioConfig) -> HarnessResult<ProducerHandle> {
        let handle = producer::run_async(self.factory(), config)?;
        if let Ok(mut producers) = self.producers.lock() {
            producers.retain(|(_, task)| !task.is_finished());
            producers.push((handle.worker().to_string(), handle.abort_handle()));
        }
        Ok(handle)
    }

    /// Run a raw statement on the primary executor, e.g. `create topic`.
    pub async fn execute(&self, statement: &str) -> HarnessResult<()> {
        self.executor.execute(statement).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Simulator and rendezvous
    // ------------------------------------------------------------------------

    /// Default simulator invocation against `db_name`.
    pub fn simulator_command(&self, db_name: &str) -> SimulatorCommand {
        SimulatorCommand::from_config(&self.config, db_name)
    }

    /// Launch the simulator and keep it for teardown. Returns its pid.
    ///
    /// Config rows must already be inserted.
    pub fn launch_simulator(&mut self, command: &SimulatorCommand) -> HarnessResult<Option<u32>> {
        let process = launcher::launch(command)?;
        let pid = process.pid();
        tracing::info!(run_id = %self.run_id, pid = ?pid, "Simulator attached to run");
        self.simulators.push(process);
        Ok(pid)
    }

    /// Exit watches of every launched simulator.
    pub fn simulator_exits(&self) -> Vec<watch::Receiver<Option<ExitInfo>>> {
        self.simulators.iter().map(SimulatorProcess::exited).collect()
    }

    pub async fn observe_phase(&self) -> HarnessResult<Option<Phase>> {
        rendezvous::observe_phase(self.executor(), self.cdb()).await
    }

    pub async fn wait_for_consumption_start(&self) -> HarnessResult<()> {
        rendezvous::wait_for_consumption_start(self.executor(), self.cdb(), &self.notify_policy()).await
    }

    pub async fn wait_for_commit(&self) -> HarnessResult<()> {
        rendezvous::wait_for_commit(self.executor(), self.cdb(), &self.notify_policy()).await
    }

    pub async fn collect_results(&self, expected_consumers: usize) -> HarnessResult<ConsumerResults> {
        aggregator::collect_results(
            self.executor(),
            expected_consumers,
            self.cdb(),
            &self.result_policy(),
        )
        .await
    }

    fn abort_producers(&mut self) {
        let producers = match self.producers.get_mut() {
            Ok(producers) => std::mem::take(producers),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for (worker, task) in producers {
            if !task.is_finished() {
                tracing::warn!(run_id = %self.run_id, worker = %worker, "Aborting unfinished producer");
                task.abort();
            }
        }
    }

    /// Cancel outstanding waits, abort unfinished producers and join every
    /// simulator, killing any that outlives `timeout`. All simulators are
    /// joined even if one fails; the first failure is returned.
    pub async fn teardown(&mut self, timeout: Duration) -> HarnessResult<Vec<ExitInfo>> {
        self.cancel();
        self.abort_producers();
        let mut exits = Vec::with_capacity(self.simulators.len());
        let mut first_error = None;
        for process in self.simulators.drain(..) {
            match process.join(timeout).await {
                Ok(info) => exits.push(info),
                Err(e) => {
                    tracing::warn!(run_id = %self.run_id, error = %e, "Simulator teardown failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        tracing::info!(run_id = %self.run_id, joined = exits.len(), "Teardown complete");
        match first_error {
            Some(e) => Err(e),
            None => Ok(exits),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmqrig_core::{HarnessError, CONSUME_INFO_TABLE};
    use tmqrig_storage::{MockExecutor, MockExecutorFactory};

    async fn orchestrator(mock: &MockExecutor) -> Orchestrator {
        let factory = Arc::new(MockExecutorFactory::new(mock));
        Orchestrator::connect(HarnessConfig::default(), factory).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let mock = MockExecutor::new();
        let config = HarnessConfig {
            rest_url: String::new(),
            ..HarnessConfig::default()
        };
        let factory = Arc::new(MockExecutorFactory::new(&mock));
        let err = Orchestrator::connect(config, factory).await.unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[tokio::test]
    async fn test_runs_have_distinct_ids() {
        let mock = MockExecutor::new();
        let a = orchestrator(&mock).await;
        let b = orchestrator(&mock).await;
        assert_ne!(a.run_id(), b.run_id());
    }

    #[tokio::test]
    async fn test_consumer_infos_inserted_in_order() {
        let mock = MockExecutor::new();
        let orch = orchestrator(&mock).await;
        orch.init_coordination_schema().await.unwrap();
        orch.insert_consumer_infos(&[
            ConsumerInfo::new(0, "topic_a", "group.id:cgrp1", 10),
            ConsumerInfo::new(1, "topic_a", "group.id:cgrp2", 10),
        ])
        .await
        .unwrap();

        let rows = mock.rows("cdb", CONSUME_INFO_TABLE);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1], tmqrig_core::Value::Int(1));

        orch.reset_producer_config_table().await.unwrap();
        assert_eq!(mock.row_count("cdb", CONSUME_INFO_TABLE), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_waits() {
        let mock = MockExecutor::new();
        let orch = orchestrator(&mock).await;
        orch.cancel();
        let err = orch.wait_for_consumption_start().await.unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_teardown_without_simulators() {
        let mock = MockExecutor::new();
        let mut orch = orchestrator(&mock).await;
        let exits = orch.teardown(Duration::from_secs(1)).await.unwrap();
        assert!(exits.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_aborts_dropped_producer() {
        let mock = MockExecutor::new();
        let mut orch = orchestrator(&mock).await;
        let config = ScenarioConfig {
            rows_per_table: 1_000,
            batch_size: 1,
            vgroups: 1,
            ..ScenarioConfig::default()
        };
        mock.set_latency(Some(Duration::from_millis(20)));
        let mut producer = orch.run_async(config).unwrap();
        producer.schema_ready().await.unwrap();
        // A failed run drops the handle without joining it.
        drop(producer);

        orch.teardown(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rows = mock.row_count("dbt", "ctb0");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mock.row_count("dbt", "ctb0"), rows);
        assert!(rows < 1_000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_teardown_kills_lingering_simulator() {
        let mock = MockExecutor::new();
        let mut orch = orchestrator(&mock).await;
        let command = SimulatorCommand::new("/bin/sh", "sleep 30", "dbt");
        let pid = orch.launch_simulator(&command).unwrap();
        assert!(pid.is_some());

        let err = orch.teardown(Duration::from_millis(200)).await.unwrap_err();
        assert!(err.is_wait_exceeded());
    }
}
