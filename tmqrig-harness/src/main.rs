//! TMQRIG entry point: runs one scenario file against a live server.

use tmqrig_core::{HarnessError, HarnessResult};
use tmqrig_harness::telemetry::{init_tracing, TelemetryConfig};
use tmqrig_harness::{ConsumerResults, Orchestrator, ScenarioFile};

#[tokio::main]
async fn main() -> HarnessResult<()> {
    init_tracing(&TelemetryConfig::default())?;
    let scenario = ScenarioFile::load()?;
    let mut orchestrator = Orchestrator::from_env().await?;

    let outcome = run(&mut orchestrator, &scenario).await;
    if let Err(e) = &outcome {
        tracing::error!(run_id = %orchestrator.run_id(), error = %e, "Scenario failed");
    }
    let teardown = orchestrator.teardown(scenario.simulator.join_timeout()).await;

    let results = outcome?;
    teardown?;
    tracing::info!(
        run_id = %orchestrator.run_id(),
        consumers = results.len(),
        total_rows = results.total_rows(),
        "Scenario passed"
    );
    Ok(())
}

async fn run(orchestrator: &mut Orchestrator, scenario: &ScenarioFile) -> HarnessResult<ConsumerResults> {
    orchestrator.init_coordination_schema().await?;

    let mut producer = orchestrator.run_async(scenario.producer.clone())?;
    producer.schema_ready().await?;
    for topic in &scenario.topics {
        orchestrator.execute(&topic.create_statement()).await?;
        tracing::info!(topic = %topic.name, "Topic created");
    }

    orchestrator.insert_consumer_infos(&scenario.consumers).await?;
    let command = scenario.simulator_command(orchestrator.config());
    orchestrator.launch_simulator(&command)?;

    orchestrator.wait_for_consumption_start().await?;
    let report = producer.join().await?;
    tracing::info!(rows = report.rows, statements = report.statements, "Producer finished");

    if scenario.expect.wait_for_commit {
        orchestrator.wait_for_commit().await?;
    }

    let results = orchestrator.collect_results(scenario.consumers.len()).await?;
    if let Some(expected) = scenario.expect.total_rows {
        let actual = results.total_rows();
        if actual != expected {
            return Err(HarnessError::ExpectationFailed {
                what: "total consumed rows".to_string(),
                expected,
                actual,
            });
        }
    }
    Ok(results)
}
