//! TMQRIG Harness - TMQ Correctness Scenario Orchestrator
//!
//! Prepares coordination and data tables, starts the external `tmq_sim`
//! consumer simulator, follows its progress through the notification table
//! and gathers the per-consumer results it writes back.

pub mod aggregator;
pub mod consumer_info;
pub mod launcher;
pub mod orchestrator;
pub mod producer;
pub mod rendezvous;
pub mod scenario;
pub mod schema;
pub mod telemetry;

pub use aggregator::{collect_results, ConsumerResults};
pub use consumer_info::insert_consumer_info;
pub use launcher::{launch, ExitInfo, SimulatorCommand, SimulatorProcess};
pub use orchestrator::Orchestrator;
pub use producer::{
    flush_points, insert_rows, provision_and_populate, run_async, InsertPlan, InsertReport,
    ProducerHandle,
};
pub use rendezvous::{wait_for_commit, wait_for_consumption_start, PollPolicy};
pub use scenario::ScenarioFile;
pub use schema::{drop_coordination_schema, init_coordination_schema, reset_producer_config_table};
pub use telemetry::{init_tracing, TelemetryConfig};
