//! End-to-end scenario runs against the mock store, with a simulated consumer
//! in place of `tmq_sim`.

use std::time::Duration;
use tmqrig_harness::producer::join_all;
use tmqrig_harness::scenario::TopicSpec;
use tmqrig_harness::{Orchestrator, ScenarioFile};
use tmqrig_test_utils::assertions::{
    assert_cancelled, assert_consumed_rows, assert_coordination_empty, assert_wait_exceeded,
};
use tmqrig_test_utils::fixtures::{
    auto_commit_consumer, fast_harness_config, manual_commit_consumer, mock_factory, small_scenario,
};
use tmqrig_test_utils::{
    init_test_tracing, HarnessConfig, MockExecutor, Phase, SimulatedConsumer, SimulatorBehavior,
    CONSUME_INFO_TABLE, CONSUME_RESULT_TABLE, NOTIFY_TABLE, Value,
};

async fn orchestrator(store: &MockExecutor, config: HarnessConfig) -> Orchestrator {
    Orchestrator::connect(config, mock_factory(store)).await.unwrap()
}

#[tokio::test]
async fn test_two_tables_three_rows_end_to_end() {
    init_test_tracing();
    let store = MockExecutor::new();
    let orch = orchestrator(&store, fast_harness_config()).await;

    orch.init_coordination_schema().await.unwrap();
    assert_coordination_empty(&store, "cdb");

    let mut producer = orch.run_async(small_scenario(2, 3, 2)).unwrap();
    producer.schema_ready().await.unwrap();
    let topic = TopicSpec {
        name: "topic_a".to_string(),
        sql: "select * from dbt.stb".to_string(),
    };
    orch.execute(&topic.create_statement()).await.unwrap();
    assert!(store.has_topic("topic_a"));

    orch.insert_consumer_info(&auto_commit_consumer(0, 6)).await.unwrap();
    let simulator = SimulatedConsumer::new(&store, "dbt", "cdb").spawn();

    orch.wait_for_consumption_start().await.unwrap();
    assert_eq!(orch.observe_phase().await.unwrap(), Some(Phase::Consuming));

    let report = producer.join().await.unwrap();
    assert_eq!(report.statements, 2);
    assert_eq!(report.rows, 6);
    assert_eq!(store.statements_with_prefix("insert into ctb").len(), 2);

    let results = orch.collect_results(1).await.unwrap();
    assert_consumed_rows(&results.consumed_row_counts(), &[6]);
    assert_eq!(results.total_rows(), 6);

    simulator.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_manual_commit_reaches_committed_phase() {
    let store = MockExecutor::new();
    let orch = orchestrator(&store, fast_harness_config()).await;
    orch.init_coordination_schema().await.unwrap();

    orch.provision_and_populate(&small_scenario(1, 10, 4)).await.unwrap();
    orch.insert_consumer_infos(&[manual_commit_consumer(0, 10), manual_commit_consumer(1, 10)])
        .await
        .unwrap();
    SimulatedConsumer::new(&store, "dbt", "cdb").spawn();

    orch.wait_for_consumption_start().await.unwrap();
    orch.wait_for_commit().await.unwrap();
    assert_eq!(orch.observe_phase().await.unwrap(), Some(Phase::Committed));

    let results = orch.collect_results(2).await.unwrap();
    assert_consumed_rows(&results.consumed_row_counts(), &[10, 10]);
    let ids: Vec<_> = results.sorted_by_consumer().iter().map(|r| r.consumer_id).collect();
    assert_eq!(ids, vec![0, 1]);
}

#[tokio::test]
async fn test_stalled_simulator_hits_deadline() {
    let store = MockExecutor::new();
    let config = HarnessConfig {
        wait_deadline: Duration::from_millis(300),
        ..fast_harness_config()
    };
    let orch = orchestrator(&store, config).await;
    orch.init_coordination_schema().await.unwrap();
    orch.insert_consumer_info(&auto_commit_consumer(0, 1)).await.unwrap();

    let behavior = SimulatorBehavior {
        stall: true,
        ..SimulatorBehavior::default()
    };
    SimulatedConsumer::new(&store, "dbt", "cdb")
        .with_behavior(behavior)
        .spawn();

    assert_wait_exceeded(&orch.wait_for_consumption_start().await);
    assert_wait_exceeded(&orch.collect_results(1).await);
}

#[tokio::test]
async fn test_cancel_interrupts_wait() {
    let store = MockExecutor::new();
    let config = HarnessConfig {
        wait_deadline: Duration::from_secs(60),
        ..fast_harness_config()
    };
    let orch = orchestrator(&store, config).await;
    orch.init_coordination_schema().await.unwrap();

    let (result, _) = tokio::join!(orch.wait_for_commit(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.cancel();
    });
    assert_cancelled(&result);
}

#[tokio::test]
async fn test_provisioning_twice_resets_tables() {
    let store = MockExecutor::new();
    let orch = orchestrator(&store, fast_harness_config()).await;

    orch.init_coordination_schema().await.unwrap();
    orch.insert_consumer_info(&auto_commit_consumer(0, 5)).await.unwrap();
    store
        .push_row(
            "cdb",
            CONSUME_RESULT_TABLE,
            vec![Value::Int(0), Value::Int(0), Value::Int(1), Value::Int(5), Value::Int(0)],
        )
        .unwrap();
    assert_eq!(store.row_count("cdb", CONSUME_INFO_TABLE), 1);

    orch.init_coordination_schema().await.unwrap();
    assert_coordination_empty(&store, "cdb");
}

#[tokio::test]
async fn test_each_producer_gets_its_own_connection() {
    let store = MockExecutor::new();
    let factory = mock_factory(&store);
    let orch = Orchestrator::connect(fast_harness_config(), factory.clone())
        .await
        .unwrap();

    let mut second = small_scenario(2, 5, 2);
    second.db_name = "dbt2".to_string();
    let handles = vec![
        orch.run_async(small_scenario(1, 5, 2)).unwrap(),
        orch.run_async(second).unwrap(),
    ];
    let reports = join_all(handles).await.unwrap();

    assert_eq!(reports.iter().map(|r| r.rows).sum::<u64>(), 15);
    // One for the orchestrator, one per producer.
    assert_eq!(factory.connections_opened(), 3);
    assert_eq!(store.row_count("dbt2", "ctb1"), 5);
}

#[tokio::test]
async fn test_scenario_file_drives_flow() {
    let scenario = ScenarioFile::from_toml_str(
        r#"
        [producer]
        ctb_num = 3
        rows_per_table = 4
        batch_size = 3

        [[consumers]]
        consumer_id = 1
        topic_list = "topic_a"
        key_list = "group.id:cgrp1"
        expect_msg_count = 12

        [expect]
        total_rows = 12
        "#,
    )
    .unwrap();
    scenario.validate().unwrap();

    let store = MockExecutor::new();
    let orch = orchestrator(&store, fast_harness_config()).await;
    orch.init_coordination_schema().await.unwrap();
    let report = orch.provision_and_populate(&scenario.producer).await.unwrap();
    // flush point [3]: one statement per table
    assert_eq!(report.statements, 3);

    orch.insert_consumer_infos(&scenario.consumers).await.unwrap();
    SimulatedConsumer::new(&store, &scenario.producer.db_name, "cdb").spawn();
    orch.wait_for_consumption_start().await.unwrap();

    let results = orch.collect_results(scenario.consumers.len()).await.unwrap();
    assert_eq!(Some(results.total_rows()), scenario.expect.total_rows);
}

#[tokio::test]
async fn test_back_to_back_scenarios_start_from_clean_phase() {
    let store = MockExecutor::new();
    let orch = orchestrator(&store, fast_harness_config()).await;

    orch.init_coordination_schema().await.unwrap();
    orch.provision_and_populate(&small_scenario(1, 4, 2)).await.unwrap();
    orch.insert_consumer_info(&manual_commit_consumer(0, 4)).await.unwrap();
    SimulatedConsumer::new(&store, "dbt", "cdb").spawn().await.unwrap().unwrap();
    orch.wait_for_commit().await.unwrap();
    assert_eq!(store.row_count("cdb", NOTIFY_TABLE), 2);

    orch.init_coordination_schema().await.unwrap();
    assert_coordination_empty(&store, "cdb");
    assert_eq!(orch.observe_phase().await.unwrap(), Some(Phase::NotStarted));

    orch.provision_and_populate(&small_scenario(1, 4, 2)).await.unwrap();
    orch.insert_consumer_info(&auto_commit_consumer(0, 4)).await.unwrap();
    SimulatedConsumer::new(&store, "dbt", "cdb").spawn();

    orch.wait_for_consumption_start().await.unwrap();
    let results = orch.collect_results(1).await.unwrap();
    assert_consumed_rows(&results.consumed_row_counts(), &[4]);
}
