//! In-memory mock executor for testing.
//!
//! Understands the handful of statement shapes the harness issues (database
//! and table DDL, multi-table `insert into ... values`, `select *`) and keeps
//! every statement in a log. Clones and [`MockExecutor::session`] share the
//! stored tables but each has its own `use <db>` session, like separate
//! connections to one server.

use crate::{ExecutorFactory, QueryResult, SqlExecutor};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tmqrig_core::{ExecutorError, Value};

static CREATE_DB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^create database (?:if not exists )?(\w+)").expect("Invalid create db regex")
});
static DROP_DB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^drop database (if exists )?(\w+)$").expect("Invalid drop db regex")
});
static USE_DB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^use (\w+)$").expect("Invalid use regex"));
static DROP_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^drop (?:s)?table (if exists )?([\w.]+)$").expect("Invalid drop table regex")
});
static CREATE_CHILD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^create table (?:if not exists )?([\w.]+) using ([\w.]+) tags \((.*)\)$")
        .expect("Invalid create child regex")
});
static CREATE_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^create (s)?table (if not exists )?([\w.]+) \(").expect("Invalid create table regex")
});
static CREATE_TOPIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^create topic (?:if not exists )?(\w+) as (.+)$").expect("Invalid create topic regex")
});
static TAGS_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*tags \((.*)\)$").expect("Invalid tags regex"));
static SELECT_ALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^select \* from ([\w.]+)$").expect("Invalid select regex")
});

#[derive(Debug, Clone, Default)]
struct MockTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
struct MockState {
    databases: BTreeSet<String>,
    /// Keyed by `db.table`
    tables: BTreeMap<String, MockTable>,
    /// Topic name to its query
    topics: BTreeMap<String, String>,
    statements: Vec<String>,
    failures: Vec<(String, ExecutorError)>,
    latency: Option<Duration>,
}

/// In-memory executor sharing state with its clones.
#[derive(Debug, Default)]
pub struct MockExecutor {
    state: Arc<RwLock<MockState>>,
    session_db: Mutex<Option<String>>,
}

impl Clone for MockExecutor {
    /// A clone is a new session on the same store.
    fn clone(&self) -> Self {
        self.session()
    }
}

impl MockExecutor {
    /// Create a new, empty mock store with one session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open another session (connection) on the same store.
    pub fn session(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            session_db: Mutex::new(None),
        }
    }

    /// Delay every statement by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut state) = self.state.write() {
            state.latency = latency;
        }
    }

    /// Fail every statement containing `pattern` with `error`.
    pub fn fail_on(&self, pattern: impl Into<String>, error: ExecutorError) {
        if let Ok(mut state) = self.state.write() {
            state.failures.push((pattern.into(), error));
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.write() {
            state.failures.clear();
        }
    }

    /// Every statement executed so far, across all sessions.
    pub fn statements(&self) -> Vec<String> {
        self.state
            .read()
            .map(|s| s.statements.clone())
            .unwrap_or_default()
    }

    /// Statements starting with `prefix` (case-insensitive).
    pub fn statements_with_prefix(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_ascii_lowercase();
        self.statements()
            .into_iter()
            .filter(|s| s.to_ascii_lowercase().starts_with(&prefix))
            .collect()
    }

    pub fn has_database(&self, db: &str) -> bool {
        self.state
            .read()
            .map(|s| s.databases.contains(db))
            .unwrap_or(false)
    }

    pub fn has_table(&self, db: &str, table: &str) -> bool {
        self.state
            .read()
            .map(|s| s.tables.contains_key(&format!("{}.{}", db, table)))
            .unwrap_or(false)
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.state
            .read()
            .map(|s| s.topics.contains_key(topic))
            .unwrap_or(false)
    }

    /// Names of the tables in `db`, without the database prefix.
    pub fn table_names(&self, db: &str) -> Vec<String> {
        let prefix = format!("{}.", db);
        self.state
            .read()
            .map(|s| {
                s.tables
                    .keys()
                    .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rows of `db.table`, empty when the table does not exist.
    pub fn rows(&self, db: &str, table: &str) -> Vec<Vec<Value>> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.tables.get(&format!("{}.{}", db, table)).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    pub fn row_count(&self, db: &str, table: &str) -> usize {
        self.rows(db, table).len()
    }

    /// Create `db.table` directly, creating the database if needed.
    pub fn create_table(&self, db: &str, table: &str, columns: &[&str]) -> Result<(), ExecutorError> {
        let mut state = self.state.write().map_err(|_| ExecutorError::LockPoisoned)?;
        state.databases.insert(db.to_string());
        state
            .tables
            .entry(format!("{}.{}", db, table))
            .or_insert_with(|| MockTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            });
        Ok(())
    }

    /// Append a row to an existing table, bypassing SQL.
    pub fn push_row(&self, db: &str, table: &str, row: Vec<Value>) -> Result<(), ExecutorError> {
        let mut state = self.state.write().map_err(|_| ExecutorError::LockPoisoned)?;
        let key = format!("{}.{}", db, table);
        let table = state
            .tables
            .get_mut(&key)
            .ok_or(ExecutorError::TableNotFound { table: key })?;
        table.rows.push(row);
        Ok(())
    }

    fn qualify(&self, name: &str) -> Result<String, ExecutorError> {
        if name.contains('.') {
            return Ok(name.to_string());
        }
        let session = self.session_db.lock().map_err(|_| ExecutorError::LockPoisoned)?;
        match session.as_deref() {
            Some(db) => Ok(format!("{}.{}", db, name)),
            None => Err(ExecutorError::Server {
                code: 0x0388,
                desc: format!("no database selected for table {}", name),
            }),
        }
    }

    fn apply(&self, sql: &str) -> Result<QueryResult, ExecutorError> {
        let lower = sql.to_ascii_lowercase();

        if let Some(caps) = USE_DB.captures(sql) {
            let db = caps[1].to_string();
            let state = self.state.read().map_err(|_| ExecutorError::LockPoisoned)?;
            if !state.databases.contains(&db) {
                return Err(ExecutorError::DatabaseNotFound { database: db });
            }
            drop(state);
            let mut session = self.session_db.lock().map_err(|_| ExecutorError::LockPoisoned)?;
            *session = Some(db);
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = CREATE_DB.captures(sql) {
            let mut state = self.state.write().map_err(|_| ExecutorError::LockPoisoned)?;
            state.databases.insert(caps[1].to_string());
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = DROP_DB.captures(sql) {
            let db = caps[2].to_string();
            let mut state = self.state.write().map_err(|_| ExecutorError::LockPoisoned)?;
            if !state.databases.remove(&db) && caps.get(1).is_none() {
                return Err(ExecutorError::DatabaseNotFound { database: db });
            }
            let prefix = format!("{}.", db);
            state.tables.retain(|key, _| !key.starts_with(&prefix));
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = DROP_TABLE.captures(sql) {
            let key = self.qualify(&caps[2])?;
            let mut state = self.state.write().map_err(|_| ExecutorError::LockPoisoned)?;
            if state.tables.remove(&key).is_none() && caps.get(1).is_none() {
                return Err(ExecutorError::TableNotFound { table: key });
            }
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = CREATE_CHILD.captures(sql) {
            if caps[3].trim().is_empty() {
                return Err(empty_tags(sql));
            }
            let key = self.qualify(&caps[1])?;
            let stb = self.qualify(&caps[2])?;
            let mut state = self.state.write().map_err(|_| ExecutorError::LockPoisoned)?;
            ensure_database(&state, &key)?;
            let columns = state
                .tables
                .get(&stb)
                .map(|t| t.columns.clone())
                .ok_or(ExecutorError::TableNotFound { table: stb })?;
            state.tables.entry(key).or_insert(MockTable {
                columns,
                rows: Vec::new(),
            });
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = CREATE_TABLE.captures(sql) {
            let is_super = caps.get(1).is_some();
            let if_not_exists = caps.get(2).is_some();
            let key = self.qualify(&caps[3])?;
            let open = caps.get(0).map(|m| m.end() - 1).unwrap_or(0);
            let (inside, rest) = balanced(&sql[open..]).ok_or_else(|| ExecutorError::Unsupported {
                statement: sql.to_string(),
            })?;
            if is_super {
                let has_tags = TAGS_CLAUSE
                    .captures(rest)
                    .map(|tags| !tags[1].trim().is_empty())
                    .unwrap_or(false);
                if !has_tags {
                    return Err(empty_tags(sql));
                }
            }
            let columns = split_top_level(inside)
                .iter()
                .filter_map(|def| def.split_whitespace().next().map(str::to_string))
                .collect();
            let mut state = self.state.write().map_err(|_| ExecutorError::LockPoisoned)?;
            ensure_database(&state, &key)?;
            if state.tables.contains_key(&key) {
                if if_not_exists {
                    return Ok(QueryResult::empty());
                }
                return Err(ExecutorError::Server {
                    code: 0x2603,
                    desc: format!("Table already exists: {}", key),
                });
            }
            state.tables.insert(key, MockTable { columns, rows: Vec::new() });
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = CREATE_TOPIC.captures(sql) {
            let mut state = self.state.write().map_err(|_| ExecutorError::LockPoisoned)?;
            state
                .topics
                .entry(caps[1].to_string())
                .or_insert_with(|| caps[2].to_string());
            return Ok(QueryResult::empty());
        }

        if lower.starts_with("insert into") {
            return self.apply_insert(sql);
        }

        if let Some(caps) = SELECT_ALL.captures(sql) {
            let key = self.qualify(&caps[1])?;
            let state = self.state.read().map_err(|_| ExecutorError::LockPoisoned)?;
            let table = state
                .tables
                .get(&key)
                .ok_or(ExecutorError::TableNotFound { table: key })?;
            return Ok(QueryResult::new(table.columns.clone(), table.rows.clone()));
        }

        Err(ExecutorError::Unsupported {
            statement: sql.to_string(),
        })
    }

    /// `insert into t1 values (..) (..) t2 values (..)`
    fn apply_insert(&self, sql: &str) -> Result<QueryResult, ExecutorError> {
        let unsupported = || ExecutorError::Unsupported {
            statement: sql.to_string(),
        };
        let mut rest = sql["insert into".len()..].trim_start();
        let mut pending: Vec<(String, Vec<Vec<Value>>)> = Vec::new();

        while !rest.is_empty() {
            let name_end = rest.find(char::is_whitespace).ok_or_else(unsupported)?;
            let table = self.qualify(&rest[..name_end])?;
            rest = rest[name_end..].trim_start();
            if !rest.to_ascii_lowercase().starts_with("values") {
                return Err(unsupported());
            }
            rest = rest["values".len()..].trim_start();

            let mut rows = Vec::new();
            while rest.starts_with('(') {
                let (inside, after) = balanced(rest).ok_or_else(unsupported)?;
                rows.push(
                    split_top_level(inside)
                        .iter()
                        .map(|literal| parse_literal(literal))
                        .collect(),
                );
                rest = after.trim_start();
            }
            if rows.is_empty() {
                return Err(unsupported());
            }
            pending.push((table, rows));
        }

        let mut state = self.state.write().map_err(|_| ExecutorError::LockPoisoned)?;
        // Validate every target before appending anything.
        for (key, rows) in &pending {
            let table = state
                .tables
                .get(key)
                .ok_or_else(|| ExecutorError::TableNotFound { table: key.clone() })?;
            if rows.iter().any(|r| r.len() != table.columns.len()) {
                return Err(ExecutorError::Server {
                    code: 0x2602,
                    desc: format!("Invalid column count for {}", key),
                });
            }
        }
        let mut affected = 0i64;
        for (key, rows) in pending {
            affected += rows.len() as i64;
            if let Some(table) = state.tables.get_mut(&key) {
                table.rows.extend(rows);
            }
        }
        Ok(QueryResult::new(
            vec!["affected_rows".to_string()],
            vec![vec![Value::Int(affected)]],
        ))
    }
}

fn empty_tags(sql: &str) -> ExecutorError {
    ExecutorError::Server {
        code: 0x2621,
        desc: format!("Tags required: {}", sql),
    }
}

fn ensure_database(state: &MockState, key: &str) -> Result<(), ExecutorError> {
    let db = key.split('.').next().unwrap_or_default();
    if state.databases.contains(db) {
        Ok(())
    } else {
        Err(ExecutorError::DatabaseNotFound {
            database: db.to_string(),
        })
    }
}

/// Split `"(a, (b), 'c)')rest"` into the text inside the first balanced
/// parentheses and the remainder after it.
fn balanced(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let mut in_quote = false;
    for (i, ch) in s.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some((&s[1..i], &s[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas that are outside quotes and parentheses.
fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    for ch in s.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            '(' if !in_quote => {
                depth += 1;
                current.push(ch);
            }
            ')' if !in_quote => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if !in_quote && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn parse_literal(literal: &str) -> Value {
    let literal = literal.trim();
    if literal.len() >= 2 && literal.starts_with('\'') && literal.ends_with('\'') {
        return Value::Text(literal[1..literal.len() - 1].to_string());
    }
    match literal.to_ascii_lowercase().as_str() {
        "now" | "now()" => return Value::Int(chrono::Utc::now().timestamp_millis()),
        "null" => return Value::Null,
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = literal.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = literal.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Text(literal.to_string())
}

#[async_trait]
impl SqlExecutor for MockExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryResult, ExecutorError> {
        let sql = sql.trim().trim_end_matches(';').trim();
        let (latency, failure) = {
            let mut state = self.state.write().map_err(|_| ExecutorError::LockPoisoned)?;
            state.statements.push(sql.to_string());
            let failure = state
                .failures
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, err)| err.clone());
            (state.latency, failure)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }
        self.apply(sql)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Hands out independent sessions on one shared [`MockExecutor`] store.
#[derive(Debug, Default)]
pub struct MockExecutorFactory {
    store: MockExecutor,
    connections: AtomicUsize,
}

impl MockExecutorFactory {
    pub fn new(store: &MockExecutor) -> Self {
        Self {
            store: store.session(),
            connections: AtomicUsize::new(0),
        }
    }

    /// Number of sessions opened through this factory.
    pub fn connections_opened(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutorFactory for MockExecutorFactory {
    async fn connect(&self) -> Result<Box<dyn SqlExecutor>, ExecutorError> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.store.session()))
    }
}
