//! Configuration types

use crate::{ConfigError, ValidationError, COORDINATION_DB};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Declared length of string columns when a spec omits `len`.
pub const DEFAULT_STRING_LEN: u32 = 20;

/// Start timestamp used by generated scenarios: 2022-01-01 00:00:00 UTC, ms.
pub const DEFAULT_START_TS: i64 = 1_640_995_200_000;

// ============================================================================
// COLUMN SPECS
// ============================================================================

/// Column data type of a generated super table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Bool,
    Binary,
    Varchar,
    NChar,
}

impl ColumnKind {
    pub fn is_string(&self) -> bool {
        matches!(self, ColumnKind::Binary | ColumnKind::Varchar | ColumnKind::NChar)
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            ColumnKind::TinyInt => "tinyint",
            ColumnKind::SmallInt => "smallint",
            ColumnKind::Int => "int",
            ColumnKind::BigInt => "bigint",
            ColumnKind::Float => "float",
            ColumnKind::Double => "double",
            ColumnKind::Bool => "bool",
            ColumnKind::Binary => "binary",
            ColumnKind::Varchar => "varchar",
            ColumnKind::NChar => "nchar",
        }
    }
}

/// `count` columns of one kind, e.g. `{ kind = "binary", len = 20, count = 2 }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnSpec {
    pub kind: ColumnKind,
    #[serde(default)]
    pub len: Option<u32>,
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    1
}

impl ColumnSpec {
    pub fn new(kind: ColumnKind) -> Self {
        Self {
            kind,
            len: None,
            count: 1,
        }
    }

    pub fn string(kind: ColumnKind, len: u32) -> Self {
        Self {
            kind,
            len: Some(len),
            count: 1,
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn sql_type(&self) -> String {
        if self.kind.is_string() {
            format!("{}({})", self.kind.keyword(), self.len.unwrap_or(DEFAULT_STRING_LEN))
        } else {
            self.kind.keyword().to_string()
        }
    }
}

/// A concrete, named column after expanding `ColumnSpec::count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    pub len: u32,
    pub sql_type: String,
}

/// Expand specs into `<prefix>1`, `<prefix>2`, ... column definitions.
pub fn expand_columns(specs: &[ColumnSpec], prefix: &str) -> Vec<ColumnDef> {
    let mut defs = Vec::new();
    for spec in specs {
        for _ in 0..spec.count {
            defs.push(ColumnDef {
                name: format!("{}{}", prefix, defs.len() + 1),
                kind: spec.kind,
                len: spec.len.unwrap_or(DEFAULT_STRING_LEN),
                sql_type: spec.sql_type(),
            });
        }
    }
    defs
}

// ============================================================================
// SCENARIO CONFIG
// ============================================================================

/// Everything a producer task needs to provision and populate its database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    pub db_name: String,
    pub stb_name: String,
    pub ctb_prefix: String,
    pub ctb_num: u32,
    pub rows_per_table: u64,
    pub batch_size: u64,
    /// First row timestamp in milliseconds.
    pub start_ts: i64,
    pub vgroups: u32,
    /// Drop the database before creating it.
    pub drop_existing: bool,
    pub columns: Vec<ColumnSpec>,
    pub tags: Vec<ColumnSpec>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            db_name: "dbt".to_string(),
            stb_name: "stb".to_string(),
            ctb_prefix: "ctb".to_string(),
            ctb_num: 1,
            rows_per_table: 100,
            batch_size: 10,
            start_ts: DEFAULT_START_TS,
            vgroups: 4,
            drop_existing: true,
            columns: vec![
                ColumnSpec::new(ColumnKind::Int),
                ColumnSpec::string(ColumnKind::Binary, DEFAULT_STRING_LEN),
            ],
            tags: vec![
                ColumnSpec::new(ColumnKind::Int),
                ColumnSpec::string(ColumnKind::Binary, DEFAULT_STRING_LEN),
            ],
        }
    }
}

impl ScenarioConfig {
    pub fn child_table_name(&self, index: u32) -> String {
        format!("{}{}", self.ctb_prefix, index)
    }

    pub fn total_rows(&self) -> u64 {
        u64::from(self.ctb_num) * self.rows_per_table
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - identifiers are non-empty and made of `[A-Za-z0-9_]`
    /// - ctb_num, rows_per_table, batch_size and vgroups are >= 1
    /// - at least one data column and at least one tag
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("db_name", &self.db_name)?;
        validate_identifier("stb_name", &self.stb_name)?;
        validate_identifier("ctb_prefix", &self.ctb_prefix)?;

        for (field, value) in [
            ("ctb_num", u64::from(self.ctb_num)),
            ("rows_per_table", self.rows_per_table),
            ("batch_size", self.batch_size),
            ("vgroups", u64::from(self.vgroups)),
        ] {
            if value == 0 {
                return Err(ValidationError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be >= 1".to_string(),
                });
            }
        }

        if expand_columns(&self.columns, "c").is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "columns".to_string(),
            });
        }
        // A super table needs at least one tag.
        if expand_columns(&self.tags, "t").is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "tags".to_string(),
            });
        }
        Ok(())
    }
}

/// Accept only plain SQL identifiers.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: field.to_string(),
        });
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            reason: format!("'{}' is not a plain identifier", value),
        });
    }
    Ok(())
}

// ============================================================================
// HARNESS CONFIG
// ============================================================================

/// Connection, simulator and polling settings for one orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Base URL of the REST SQL endpoint
    pub rest_url: String,
    pub user: String,
    pub password: String,
    pub request_timeout: Duration,
    /// Root of the server build tree; used to locate `tmq_sim`
    pub build_dir: PathBuf,
    /// Explicit simulator binary, overrides the build-tree default
    pub sim_binary: Option<PathBuf>,
    /// Explicit client config dir, overrides the build-tree default
    pub cfg_dir: Option<PathBuf>,
    pub coordination_db: String,
    pub notify_poll_interval: Duration,
    pub result_poll_interval: Duration,
    /// Upper bound on every rendezvous or result wait
    pub wait_deadline: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            rest_url: "http://localhost:6041".to_string(),
            user: "root".to_string(),
            password: "taosdata".to_string(),
            request_timeout: Duration::from_secs(30),
            build_dir: PathBuf::from("."),
            sim_binary: None,
            cfg_dir: None,
            coordination_db: COORDINATION_DB.to_string(),
            notify_poll_interval: Duration::from_millis(100),
            result_poll_interval: Duration::from_secs(5),
            wait_deadline: Duration::from_secs(600),
        }
    }
}

impl HarnessConfig {
    /// Create HarnessConfig from environment variables.
    ///
    /// Environment variables:
    /// - `TMQRIG_REST_URL`: REST SQL endpoint (default: http://localhost:6041)
    /// - `TMQRIG_USER` / `TMQRIG_PASSWORD`: credentials (default: root / taosdata)
    /// - `TMQRIG_REQUEST_TIMEOUT_MS`: per-request timeout (default: 30000)
    /// - `TMQRIG_BUILD_DIR`: server build tree (default: .)
    /// - `TMQRIG_SIM_BIN`: simulator binary path
    /// - `TMQRIG_CFG_DIR`: client config dir passed with `-c`
    /// - `TMQRIG_COORDINATION_DB`: coordination database (default: cdb)
    /// - `TMQRIG_NOTIFY_POLL_MS`: notification poll interval (default: 100)
    /// - `TMQRIG_RESULT_POLL_MS`: result poll interval (default: 5000)
    /// - `TMQRIG_WAIT_DEADLINE_SECS`: bound on every wait (default: 600)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rest_url: std::env::var("TMQRIG_REST_URL").unwrap_or(defaults.rest_url),
            user: std::env::var("TMQRIG_USER").unwrap_or(defaults.user),
            password: std::env::var("TMQRIG_PASSWORD").unwrap_or(defaults.password),
            request_timeout: env_millis("TMQRIG_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            build_dir: std::env::var("TMQRIG_BUILD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.build_dir),
            sim_binary: std::env::var("TMQRIG_SIM_BIN").ok().map(PathBuf::from),
            cfg_dir: std::env::var("TMQRIG_CFG_DIR").ok().map(PathBuf::from),
            coordination_db: std::env::var("TMQRIG_COORDINATION_DB")
                .unwrap_or(defaults.coordination_db),
            notify_poll_interval: env_millis("TMQRIG_NOTIFY_POLL_MS")
                .unwrap_or(defaults.notify_poll_interval),
            result_poll_interval: env_millis("TMQRIG_RESULT_POLL_MS")
                .unwrap_or(defaults.result_poll_interval),
            wait_deadline: std::env::var("TMQRIG_WAIT_DEADLINE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.wait_deadline),
        }
    }

    /// Path of the `tmq_sim` binary.
    pub fn sim_binary_path(&self) -> PathBuf {
        match &self.sim_binary {
            Some(path) => path.clone(),
            None => {
                let exe = if cfg!(windows) { "tmq_sim.exe" } else { "tmq_sim" };
                self.build_dir.join("build").join("bin").join(exe)
            }
        }
    }

    /// Client config dir handed to the simulator with `-c`.
    pub fn client_cfg_dir(&self) -> PathBuf {
        match &self.cfg_dir {
            Some(path) => path.clone(),
            None => self.build_dir.join("..").join("sim").join("psim").join("cfg"),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rest_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "rest_url".to_string(),
            });
        }
        if !(self.rest_url.starts_with("http://") || self.rest_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "rest_url".to_string(),
                value: self.rest_url.clone(),
                reason: "must be an http(s) URL".to_string(),
            });
        }
        validate_identifier("coordination_db", &self.coordination_db).map_err(|e| {
            ConfigError::InvalidValue {
                field: "coordination_db".to_string(),
                value: self.coordination_db.clone(),
                reason: e.to_string(),
            }
        })?;

        for (field, value) in [
            ("request_timeout", self.request_timeout),
            ("notify_poll_interval", self.notify_poll_interval),
            ("result_poll_interval", self.result_poll_interval),
            ("wait_deadline", self.wait_deadline),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: format!("{:?}", value),
                    reason: format!("{} must be positive", field),
                });
            }
        }
        Ok(())
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scenario_is_valid() {
        assert!(ScenarioConfig::default().validate().is_ok());
    }

    #[test]
    fn test_scenario_rejects_zero_batch() {
        let config = ScenarioConfig {
            batch_size: 0,
            ..Default::default()
        };
        match config.validate() {
            Err(ValidationError::InvalidValue { field, .. }) => assert_eq!(field, "batch_size"),
            other => panic!("expected batch_size error, got {:?}", other),
        }
    }

    #[test]
    fn test_scenario_rejects_missing_tags() {
        for tags in [Vec::new(), vec![ColumnSpec::new(ColumnKind::Int).with_count(0)]] {
            let config = ScenarioConfig {
                tags,
                ..Default::default()
            };
            match config.validate() {
                Err(ValidationError::RequiredFieldMissing { field }) => assert_eq!(field, "tags"),
                other => panic!("expected tags error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_scenario_rejects_bad_identifier() {
        let config = ScenarioConfig {
            db_name: "db; drop database x".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_columns_numbers_sequentially() {
        let defs = expand_columns(
            &[
                ColumnSpec::new(ColumnKind::Int).with_count(2),
                ColumnSpec::string(ColumnKind::NChar, 8),
            ],
            "c",
        );
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["c1", "c2", "c3"]);
        assert_eq!(defs[2].sql_type, "nchar(8)");
    }

    #[test]
    fn test_column_spec_from_toml() {
        let spec: ColumnSpec = toml::from_str("kind = \"binary\"\nlen = 16").unwrap();
        assert_eq!(spec.kind, ColumnKind::Binary);
        assert_eq!(spec.count, 1);
        assert_eq!(spec.sql_type(), "binary(16)");
    }

    #[test]
    fn test_harness_config_paths() {
        let config = HarnessConfig {
            build_dir: PathBuf::from("/opt/td/debug"),
            ..Default::default()
        };
        assert!(config.sim_binary_path().ends_with("build/bin/tmq_sim") || cfg!(windows));
        assert!(config.client_cfg_dir().ends_with("sim/psim/cfg"));
    }

    #[test]
    fn test_harness_config_validate_rejects_zero_interval() {
        let config = HarnessConfig {
            notify_poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(HarnessConfig::default().validate().is_ok());
    }

    #[test]
    fn test_harness_config_validate_rejects_non_http_url() {
        let config = HarnessConfig {
            rest_url: "localhost:6041".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
