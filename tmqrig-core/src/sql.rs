//! SQL text builders for the coordination tables and generated tables.
//!
//! Identifiers are validated by the config layer before they reach these
//! functions; string literals are single-quoted verbatim.

use crate::{
    expand_columns, ColumnDef, ColumnKind, ColumnSpec, ConsumerInfo, CONSUME_INFO_TABLE,
    CONSUME_RESULT_TABLE,
};

/// Literal schema of the producer-config table.
pub const CONSUME_INFO_SCHEMA: &str = "(ts timestamp, consumerid int, topiclist binary(1024), \
     keylist binary(1024), expectmsgcnt bigint, ifcheckdata int, ifmanualcommit int)";

/// Literal schema of the result table.
pub const CONSUME_RESULT_SCHEMA: &str =
    "(ts timestamp, consumerid int, consummsgcnt bigint, consumrowcnt bigint, checkresult int)";

/// Coordination database always uses a single vgroup.
pub const COORDINATION_VGROUPS: u32 = 1;

pub fn create_database(db: &str, vgroups: u32) -> String {
    format!("create database if not exists {} vgroups {}", db, vgroups)
}

pub fn drop_database(db: &str) -> String {
    format!("drop database if exists {}", db)
}

pub fn use_database(db: &str) -> String {
    format!("use {}", db)
}

pub fn drop_table(db: &str, table: &str) -> String {
    format!("drop table if exists {}.{}", db, table)
}

pub fn create_consume_info_table(cdb: &str) -> String {
    format!("create table {}.{} {}", cdb, CONSUME_INFO_TABLE, CONSUME_INFO_SCHEMA)
}

pub fn create_consume_result_table(cdb: &str) -> String {
    format!(
        "create table {}.{} {}",
        cdb, CONSUME_RESULT_TABLE, CONSUME_RESULT_SCHEMA
    )
}

pub fn select_all(db: &str, table: &str) -> String {
    format!("select * from {}.{}", db, table)
}

/// `insert into <cdb>.consumeinfo values (...)` for one consumer.
pub fn insert_consumer_info(cdb: &str, info: &ConsumerInfo) -> String {
    let ts = match info.ts {
        Some(ts) => ts.to_string(),
        None => "now".to_string(),
    };
    format!(
        "insert into {}.{} values ({}, {}, '{}', '{}', {}, {}, {})",
        cdb,
        CONSUME_INFO_TABLE,
        ts,
        info.consumer_id,
        info.topic_list,
        info.key_list,
        info.expect_msg_count,
        i32::from(info.check_data),
        i32::from(info.manual_commit),
    )
}

fn column_list(defs: &[ColumnDef]) -> String {
    defs.iter()
        .map(|d| format!("{} {}", d.name, d.sql_type))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `create stable` with a leading `ts timestamp` column.
pub fn create_super_table(db: &str, stb: &str, columns: &[ColumnSpec], tags: &[ColumnSpec]) -> String {
    let cols = expand_columns(columns, "c");
    let mut sql = format!(
        "create stable if not exists {}.{} (ts timestamp, {})",
        db,
        stb,
        column_list(&cols)
    );
    let tag_defs = expand_columns(tags, "t");
    if !tag_defs.is_empty() {
        sql.push_str(&format!(" tags ({})", column_list(&tag_defs)));
    }
    sql
}

/// `create table <db>.<name> using <db>.<stb> tags (...)`; tag values are
/// derived from the child index.
pub fn create_child_table(db: &str, stb: &str, name: &str, index: u64, tags: &[ColumnSpec]) -> String {
    let tag_defs = expand_columns(tags, "t");
    let values = tag_defs
        .iter()
        .map(|d| render_cell(d.kind, d.len, index))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "create table if not exists {}.{} using {}.{} tags ({})",
        db, name, db, stb, values
    )
}

/// Deterministic literal for row (or tag) number `n` of a column.
pub fn render_cell(kind: ColumnKind, len: u32, n: u64) -> String {
    match kind {
        ColumnKind::TinyInt => (n % 128).to_string(),
        ColumnKind::SmallInt => (n % 32_768).to_string(),
        ColumnKind::Int => (n % 2_147_483_648).to_string(),
        ColumnKind::BigInt => n.to_string(),
        ColumnKind::Float | ColumnKind::Double => format!("{}.0", n),
        ColumnKind::Bool => (n % 2 == 0).to_string(),
        ColumnKind::Binary | ColumnKind::Varchar | ColumnKind::NChar => {
            let mut text = format!("tmqrow_{}", n);
            text.truncate(len as usize);
            format!("'{}'", text)
        }
    }
}

/// `(ts, v1, v2, ...)` for row `j` of a child table.
pub fn render_row(ts: i64, j: u64, columns: &[ColumnDef]) -> String {
    let mut row = format!("({}", ts);
    for def in columns {
        row.push_str(", ");
        row.push_str(&render_cell(def.kind, def.len, j));
    }
    row.push(')');
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordination_tables_use_literal_schema() {
        assert_eq!(
            create_consume_info_table("cdb"),
            "create table cdb.consumeinfo (ts timestamp, consumerid int, topiclist binary(1024), \
             keylist binary(1024), expectmsgcnt bigint, ifcheckdata int, ifmanualcommit int)"
        );
        assert_eq!(
            create_consume_result_table("cdb"),
            "create table cdb.consumeresult (ts timestamp, consumerid int, consummsgcnt bigint, \
             consumrowcnt bigint, checkresult int)"
        );
    }

    #[test]
    fn test_insert_consumer_info_renders_flags_as_ints() {
        let info = ConsumerInfo::new(1, "topic_a,topic_b", "group.id:cgrp1", 50)
            .with_check_data(true);
        assert_eq!(
            insert_consumer_info("cdb", &info),
            "insert into cdb.consumeinfo values (now, 1, 'topic_a,topic_b', 'group.id:cgrp1', 50, 1, 0)"
        );
    }

    #[test]
    fn test_default_row_payload() {
        let cols = expand_columns(
            &[
                ColumnSpec::new(ColumnKind::Int),
                ColumnSpec::string(ColumnKind::Binary, 20),
            ],
            "c",
        );
        assert_eq!(render_row(1000, 7, &cols), "(1000, 7, 'tmqrow_7')");
    }

    #[test]
    fn test_render_cell_truncates_strings() {
        assert_eq!(render_cell(ColumnKind::Binary, 4, 123), "'tmqr'");
        assert_eq!(render_cell(ColumnKind::Bool, 0, 3), "false");
        assert_eq!(render_cell(ColumnKind::Double, 0, 3), "3.0");
    }

    #[test]
    fn test_create_super_and_child_table() {
        let cols = vec![ColumnSpec::new(ColumnKind::Int)];
        let tags = vec![ColumnSpec::new(ColumnKind::Int)];
        assert_eq!(
            create_super_table("dbt", "stb", &cols, &tags),
            "create stable if not exists dbt.stb (ts timestamp, c1 int) tags (t1 int)"
        );
        assert_eq!(
            create_child_table("dbt", "stb", "ctb3", 3, &tags),
            "create table if not exists dbt.ctb3 using dbt.stb tags (3)"
        );
    }
}
