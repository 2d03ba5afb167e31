//! Producer coordinator: provisions a data database and fills its child
//! tables with deterministic rows, optionally on a background task.
//!
//! Rows are batched per child table. A batch is flushed at row index `j` when
//! `j > 0 && j % batch_size == 0` or when `j` is the last row, so every row is
//! written exactly once and the final row always closes the final batch.

use crate::schema::exec_provision;
use std::sync::Arc;
use tmqrig_core::{
    expand_columns, sql, ColumnDef, ColumnKind, ColumnSpec, HarnessError, HarnessResult,
    ScenarioConfig, DEFAULT_STRING_LEN,
};
use tmqrig_storage::{ExecutorFactory, SqlExecutor};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::Instrument;

// ============================================================================
// FLUSH RULE
// ============================================================================

/// Whether row `j` closes a batch.
pub fn is_flush_point(j: u64, rows_per_table: u64, batch_size: u64) -> bool {
    if rows_per_table == 0 || batch_size == 0 {
        return false;
    }
    (j > 0 && j % batch_size == 0) || j == rows_per_table - 1
}

/// Row indices at which a batch is flushed, in ascending order.
pub fn flush_points(rows_per_table: u64, batch_size: u64) -> Vec<u64> {
    (0..rows_per_table)
        .filter(|j| is_flush_point(*j, rows_per_table, batch_size))
        .collect()
}

// ============================================================================
// ROW INSERTION
// ============================================================================

/// What a populate run wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub tables: u32,
    pub statements: usize,
    pub rows: u64,
}

/// Row layout and volume for one database's child tables.
#[derive(Debug, Clone)]
pub struct InsertPlan {
    pub db: String,
    pub table_prefix: String,
    pub table_count: u32,
    pub rows_per_table: u64,
    pub batch_size: u64,
    pub start_ts: i64,
    /// Data columns after `ts`
    pub columns: Vec<ColumnDef>,
}

impl InsertPlan {
    /// Plan with the default `(ts, int, binary(20))` row payload.
    pub fn new(
        db: impl Into<String>,
        table_prefix: impl Into<String>,
        table_count: u32,
        rows_per_table: u64,
        batch_size: u64,
        start_ts: i64,
    ) -> Self {
        Self {
            db: db.into(),
            table_prefix: table_prefix.into(),
            table_count,
            rows_per_table,
            batch_size,
            start_ts,
            columns: default_columns(),
        }
    }

    pub fn from_config(config: &ScenarioConfig) -> Self {
        Self {
            db: config.db_name.clone(),
            table_prefix: config.ctb_prefix.clone(),
            table_count: config.ctb_num,
            rows_per_table: config.rows_per_table,
            batch_size: config.batch_size,
            start_ts: config.start_ts,
            columns: expand_columns(&config.columns, "c"),
        }
    }

    /// Insert statements for one child table, one per flush.
    pub fn statements_for_table(&self, index: u32) -> Vec<String> {
        let table = format!("{}{}", self.table_prefix, index);
        let mut statements = Vec::new();
        let mut values = String::new();
        for j in 0..self.rows_per_table {
            let ts = self.start_ts.saturating_add(j as i64);
            values.push(' ');
            values.push_str(&sql::render_row(ts, j, &self.columns));
            if is_flush_point(j, self.rows_per_table, self.batch_size) {
                statements.push(format!("insert into {} values{}", table, values));
                values.clear();
            }
        }
        statements
    }

    /// Write every row of every child table through `executor`.
    pub async fn execute(&self, executor: &dyn SqlExecutor) -> HarnessResult<InsertReport> {
        executor
            .execute(&sql::use_database(&self.db))
            .await
            .map_err(|source| HarnessError::Insertion {
                table: self.db.clone(),
                source,
            })?;

        let mut report = InsertReport::default();
        for index in 0..self.table_count {
            let statements = self.statements_for_table(index);
            for statement in &statements {
                executor
                    .execute(statement)
                    .await
                    .map_err(|source| HarnessError::Insertion {
                        table: format!("{}.{}{}", self.db, self.table_prefix, index),
                        source,
                    })?;
            }
            report.tables += 1;
            report.statements += statements.len();
            report.rows += self.rows_per_table;
            tracing::debug!(
                db = %self.db,
                table_index = index,
                statements = statements.len(),
                "Child table populated"
            );
        }

        tracing::info!(
            db = %self.db,
            tables = report.tables,
            statements = report.statements,
            rows = report.rows,
            "Insert rows complete"
        );
        Ok(report)
    }
}

fn default_columns() -> Vec<ColumnDef> {
    expand_columns(
        &[
            ColumnSpec::new(ColumnKind::Int),
            ColumnSpec::string(ColumnKind::Binary, DEFAULT_STRING_LEN),
        ],
        "c",
    )
}

/// Insert `rows_per_table` rows into each of `<table_prefix>0..table_count`
/// in `db`, batched by `batch_size`, with timestamps from `start_ts`.
pub async fn insert_rows(
    executor: &dyn SqlExecutor,
    db: &str,
    table_prefix: &str,
    table_count: u32,
    rows_per_table: u64,
    batch_size: u64,
    start_ts: i64,
) -> HarnessResult<InsertReport> {
    InsertPlan::new(db, table_prefix, table_count, rows_per_table, batch_size, start_ts)
        .execute(executor)
        .await
}

// ============================================================================
// DDL HELPERS
// ============================================================================

/// Create the data database, dropping it first when asked.
pub async fn create_database(
    executor: &dyn SqlExecutor,
    db: &str,
    vgroups: u32,
    drop_existing: bool,
) -> HarnessResult<()> {
    if drop_existing {
        exec_provision(executor, &sql::drop_database(db)).await?;
    }
    exec_provision(executor, &sql::create_database(db, vgroups)).await?;
    tracing::info!(db, vgroups, drop_existing, "Database created");
    Ok(())
}

pub async fn create_super_table(executor: &dyn SqlExecutor, config: &ScenarioConfig) -> HarnessResult<()> {
    let statement =
        sql::create_super_table(&config.db_name, &config.stb_name, &config.columns, &config.tags);
    exec_provision(executor, &statement).await?;
    tracing::info!(db = %config.db_name, stb = %config.stb_name, "Super table created");
    Ok(())
}

/// Create `ctb_num` child tables; tag values derive from the child index.
pub async fn create_child_tables(executor: &dyn SqlExecutor, config: &ScenarioConfig) -> HarnessResult<u32> {
    for index in 0..config.ctb_num {
        let statement = sql::create_child_table(
            &config.db_name,
            &config.stb_name,
            &config.child_table_name(index),
            u64::from(index),
            &config.tags,
        );
        exec_provision(executor, &statement).await?;
    }
    tracing::info!(db = %config.db_name, count = config.ctb_num, "Child tables created");
    Ok(config.ctb_num)
}

// ============================================================================
// READINESS SIGNALS
// ============================================================================

/// Sending half of the producer's readiness signals.
#[derive(Debug)]
pub struct ReadySignals {
    schema: watch::Sender<bool>,
    data: watch::Sender<bool>,
}

impl ReadySignals {
    pub fn schema_ready(&self) {
        self.schema.send_replace(true);
    }

    pub fn data_ready(&self) {
        self.data.send_replace(true);
    }
}

/// Receiving half of the producer's readiness signals.
#[derive(Debug, Clone)]
pub struct ReadyWatch {
    worker: String,
    schema: watch::Receiver<bool>,
    data: watch::Receiver<bool>,
}

impl ReadyWatch {
    /// Resolves once the database, super table and child tables exist.
    pub async fn schema_ready(&mut self) -> HarnessResult<()> {
        Self::wait(&mut self.schema, &self.worker, "schema").await
    }

    /// Resolves once the last batch has been written.
    pub async fn data_ready(&mut self) -> HarnessResult<()> {
        Self::wait(&mut self.data, &self.worker, "data").await
    }

    async fn wait(rx: &mut watch::Receiver<bool>, worker: &str, what: &str) -> HarnessResult<()> {
        rx.wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| HarnessError::WorkerFailed {
                worker: worker.to_string(),
                reason: format!("exited before {} was ready", what),
            })
    }
}

/// Create a linked pair of readiness signals.
pub fn ready_channel(worker: impl Into<String>) -> (ReadySignals, ReadyWatch) {
    let (schema_tx, schema_rx) = watch::channel(false);
    let (data_tx, data_rx) = watch::channel(false);
    (
        ReadySignals {
            schema: schema_tx,
            data: data_tx,
        },
        ReadyWatch {
            worker: worker.into(),
            schema: schema_rx,
            data: data_rx,
        },
    )
}

// ============================================================================
// PRODUCER
// ============================================================================

/// Create the data database, super table and child tables, then fill them.
///
/// `signals`, when given, fire after the schema exists and after the last batch.
pub async fn provision_and_populate(
    executor: &dyn SqlExecutor,
    config: &ScenarioConfig,
    signals: Option<&ReadySignals>,
) -> HarnessResult<InsertReport> {
    config.validate()?;

    create_database(executor, &config.db_name, config.vgroups, config.drop_existing).await?;
    create_super_table(executor, config).await?;
    create_child_tables(executor, config).await?;
    if let Some(signals) = signals {
        signals.schema_ready();
    }

    let report = InsertPlan::from_config(config).execute(executor).await?;
    if let Some(signals) = signals {
        signals.data_ready();
    }
    Ok(report)
}

/// Joinable handle to a background producer.
#[derive(Debug)]
pub struct ProducerHandle {
    worker: String,
    ready: ReadyWatch,
    task: JoinHandle<HarnessResult<InsertReport>>,
}

impl ProducerHandle {
    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub async fn schema_ready(&mut self) -> HarnessResult<()> {
        self.ready.schema_ready().await
    }

    pub async fn data_ready(&mut self) -> HarnessResult<()> {
        self.ready.data_ready().await
    }

    /// A watch that outlives the handle, for waiting from another task.
    pub fn ready_watch(&self) -> ReadyWatch {
        self.ready.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the worker; a later `join` reports it as failed.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Handle that can abort the worker after this handle is gone.
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Wait for the worker and surface its result or failure.
    pub async fn join(self) -> HarnessResult<InsertReport> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(HarnessError::WorkerFailed {
                worker: self.worker,
                reason: if e.is_cancelled() {
                    "cancelled".to_string()
                } else {
                    format!("panicked: {}", e)
                },
            }),
        }
    }
}

/// Spawn a producer on its own task with its own executor.
pub fn run_async(factory: Arc<dyn ExecutorFactory>, config: ScenarioConfig) -> HarnessResult<ProducerHandle> {
    config.validate()?;

    let worker = format!("producer:{}", config.db_name);
    let (signals, ready) = ready_channel(worker.clone());
    let span = tracing::info_span!("producer", db = %config.db_name, tables = config.ctb_num);

    let task = tokio::spawn(produce(factory, config, signals).instrument(span));

    tracing::info!(worker = %worker, "Producer spawned");
    Ok(ProducerHandle {
        worker,
        ready,
        task,
    })
}

async fn produce(
    factory: Arc<dyn ExecutorFactory>,
    config: ScenarioConfig,
    signals: ReadySignals,
) -> HarnessResult<InsertReport> {
    let executor = factory.connect().await?;
    let result = provision_and_populate(executor.as_ref(), &config, Some(&signals)).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Producer failed");
    }
    result
}

/// Join every handle; the first failure wins, but all workers are awaited.
pub async fn join_all(handles: Vec<ProducerHandle>) -> HarnessResult<Vec<InsertReport>> {
    let mut reports = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        match handle.join().await {
            Ok(report) => reports.push(report),
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(e) => tracing::warn!(error = %e, "Additional producer failure"),
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}
