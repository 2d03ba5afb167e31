//! Runs against a real server and `tmq_sim`. Enable with `--features live-tests`
//! and point `TMQRIG_REST_URL` / `TMQRIG_SIM_BIN` at them.

#![cfg(feature = "live-tests")]

use std::time::Duration;
use tmqrig_harness::scenario::TopicSpec;
use tmqrig_harness::Orchestrator;
use tmqrig_test_utils::fixtures::{auto_commit_consumer, small_scenario};
use tmqrig_test_utils::init_test_tracing;

#[tokio::test]
async fn test_live_single_consumer_round_trip() {
    init_test_tracing();
    let mut orch = Orchestrator::from_env().await.unwrap();
    orch.init_coordination_schema().await.unwrap();

    let scenario = small_scenario(2, 3, 2);
    let mut producer = orch.run_async(scenario.clone()).unwrap();
    producer.schema_ready().await.unwrap();
    let topic = TopicSpec {
        name: "topic_a".to_string(),
        sql: format!("select * from {}.{}", scenario.db_name, scenario.stb_name),
    };
    orch.execute(&topic.create_statement()).await.unwrap();

    orch.insert_consumer_info(&auto_commit_consumer(0, 6)).await.unwrap();
    let command = orch.simulator_command(&scenario.db_name);
    orch.launch_simulator(&command).unwrap();

    orch.wait_for_consumption_start().await.unwrap();
    producer.join().await.unwrap();

    let results = orch.collect_results(1).await.unwrap();
    assert_eq!(results.total_rows(), 6);
    orch.teardown(Duration::from_secs(60)).await.unwrap();
}
