//! Producer-config rows: one per consumer the simulator should start.

use tmqrig_core::{sql, ConsumerInfo, HarnessError, HarnessResult, CONSUME_INFO_TABLE};
use tmqrig_storage::SqlExecutor;

/// Insert one consumer's config row. Must run before the simulator is launched.
pub async fn insert_consumer_info(
    executor: &dyn SqlExecutor,
    cdb: &str,
    info: &ConsumerInfo,
) -> HarnessResult<()> {
    info.validate()?;
    let statement = sql::insert_consumer_info(cdb, info);
    tracing::info!(consumer_id = info.consumer_id, sql = %statement, "Insert consumer info");
    executor
        .execute(&statement)
        .await
        .map_err(|source| HarnessError::Insertion {
            table: format!("{}.{}", cdb, CONSUME_INFO_TABLE),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::init_coordination_schema;
    use tmqrig_core::{Value, MAX_LIST_LEN};
    use tmqrig_storage::MockExecutor;

    #[tokio::test]
    async fn test_insert_writes_one_row() {
        let mock = MockExecutor::new();
        init_coordination_schema(&mock, "cdb").await.unwrap();

        let info = ConsumerInfo::new(7, "topic_a", "group.id:cgrp1,enable.auto.commit:false", 100)
            .with_manual_commit(true);
        insert_consumer_info(&mock, "cdb", &info).await.unwrap();

        let rows = mock.rows("cdb", CONSUME_INFO_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], Value::Int(7));
        assert_eq!(rows[0][2], Value::Text("topic_a".to_string()));
        assert_eq!(rows[0][4], Value::Int(100));
        assert_eq!(rows[0][5], Value::Int(0));
        assert_eq!(rows[0][6], Value::Int(1));
    }

    #[tokio::test]
    async fn test_invalid_info_never_reaches_executor() {
        let mock = MockExecutor::new();
        let info = ConsumerInfo::new(1, "t".repeat(MAX_LIST_LEN + 1), "", 1);
        let err = insert_consumer_info(&mock, "cdb", &info).await.unwrap_err();
        assert!(matches!(err, HarnessError::Validation(_)));
        assert!(mock.statements().is_empty());
    }

    #[tokio::test]
    async fn test_missing_table_is_insertion_error() {
        let mock = MockExecutor::new();
        let info = ConsumerInfo::new(1, "topic_a", "", 1);
        let err = insert_consumer_info(&mock, "cdb", &info).await.unwrap_err();
        assert!(matches!(err, HarnessError::Insertion { .. }));
    }
}
