//! Coordination schema provisioning.
//!
//! The coordination database holds the producer-config and result tables the
//! simulator reads and writes. Every scenario starts from empty tables.

use tmqrig_core::{
    sql, HarnessError, HarnessResult, CONSUME_INFO_TABLE, CONSUME_RESULT_TABLE, NOTIFY_TABLE,
};
use tmqrig_storage::{QueryResult, SqlExecutor};

/// Run one provisioning statement, tagging failures with the statement text.
pub(crate) async fn exec_provision(
    executor: &dyn SqlExecutor,
    statement: &str,
) -> HarnessResult<QueryResult> {
    tracing::debug!(executor = executor.name(), statement, "provision");
    executor
        .execute(statement)
        .await
        .map_err(|source| HarnessError::Provisioning {
            statement: statement.to_string(),
            source,
        })
}

/// Create the coordination database and recreate both coordination tables.
///
/// The notification table is dropped and left for the simulator to create,
/// so no phase rows survive from an earlier scenario. Safe to call
/// repeatedly; each call leaves the tables empty.
pub async fn init_coordination_schema(executor: &dyn SqlExecutor, cdb: &str) -> HarnessResult<()> {
    let statements = [
        sql::create_database(cdb, sql::COORDINATION_VGROUPS),
        sql::drop_table(cdb, CONSUME_INFO_TABLE),
        sql::drop_table(cdb, CONSUME_RESULT_TABLE),
        sql::drop_table(cdb, NOTIFY_TABLE),
        sql::create_consume_info_table(cdb),
        sql::create_consume_result_table(cdb),
    ];
    for statement in &statements {
        exec_provision(executor, statement).await?;
    }
    tracing::info!(cdb, "Coordination schema initialized");
    Ok(())
}

/// Drop and recreate the producer-config table only.
pub async fn reset_producer_config_table(executor: &dyn SqlExecutor, cdb: &str) -> HarnessResult<()> {
    exec_provision(executor, &sql::drop_table(cdb, CONSUME_INFO_TABLE)).await?;
    exec_provision(executor, &sql::create_consume_info_table(cdb)).await?;
    tracing::info!(cdb, table = CONSUME_INFO_TABLE, "Producer config table reset");
    Ok(())
}

/// Remove the coordination database entirely.
pub async fn drop_coordination_schema(executor: &dyn SqlExecutor, cdb: &str) -> HarnessResult<()> {
    exec_provision(executor, &sql::drop_database(cdb)).await?;
    tracing::info!(cdb, "Coordination schema dropped");
    Ok(())
}
