//! TOML scenario files for the `tmqrig` binary.
//!
//! ```toml
//! [producer]
//! db_name = "dbt"
//! ctb_num = 2
//! rows_per_table = 1000
//! batch_size = 100
//!
//! [simulator]
//! poll_delay = 100
//!
//! [[topics]]
//! name = "topic_a"
//! sql = "select * from dbt.stb"
//!
//! [[consumers]]
//! consumer_id = 0
//! topic_list = "topic_a"
//! key_list = "group.id:cgrp1,enable.auto.commit:false"
//! expect_msg_count = 2000
//!
//! [expect]
//! total_rows = 2000
//! ```

use crate::launcher::{SimulatorCommand, DEFAULT_POLL_DELAY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tmqrig_core::{
    validate_identifier, ConfigError, ConsumerInfo, HarnessConfig, HarnessResult, ScenarioConfig,
    ValidationError,
};

/// Simulator launch options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorOptions {
    pub poll_delay: u64,
    pub show_messages: bool,
    pub show_rows: bool,
    pub valgrind: bool,
    /// How long teardown waits for the simulator before killing it.
    pub join_timeout_secs: u64,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            poll_delay: DEFAULT_POLL_DELAY,
            show_messages: true,
            show_rows: true,
            valgrind: false,
            join_timeout_secs: 60,
        }
    }
}

impl SimulatorOptions {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

/// A topic created before the simulator starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicSpec {
    pub name: String,
    /// Subscription query, e.g. `select * from dbt.stb`.
    pub sql: String,
}

impl TopicSpec {
    pub fn create_statement(&self) -> String {
        format!("create topic if not exists {} as {}", self.name, self.sql)
    }
}

/// What the run must observe to pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Expectations {
    /// Sum of consumed rows over all consumers
    pub total_rows: Option<i64>,
    /// Also wait for the commit notification
    pub wait_for_commit: bool,
}

/// A complete scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioFile {
    #[serde(default)]
    pub producer: ScenarioConfig,
    #[serde(default)]
    pub simulator: SimulatorOptions,
    #[serde(default)]
    pub topics: Vec<TopicSpec>,
    pub consumers: Vec<ConsumerInfo>,
    #[serde(default)]
    pub expect: Expectations,
}

impl ScenarioFile {
    /// Load from `--scenario <path>` or `TMQRIG_SCENARIO`, then validate.
    pub fn load() -> HarnessResult<Self> {
        let path = scenario_path_from_args()
            .or_else(scenario_path_from_env)
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "scenario (use --scenario or TMQRIG_SCENARIO)".to_string(),
            })?;
        let scenario = Self::from_path(&path)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.producer.validate()?;
        if self.consumers.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "consumers".to_string(),
            });
        }
        for consumer in &self.consumers {
            consumer.validate()?;
        }
        let mut ids: Vec<_> = self.consumers.iter().map(|c| c.consumer_id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(ValidationError::InvalidValue {
                field: "consumers".to_string(),
                reason: "consumer ids must be unique".to_string(),
            });
        }
        for topic in &self.topics {
            validate_identifier("topics.name", &topic.name)?;
            if topic.sql.trim().is_empty() {
                return Err(ValidationError::RequiredFieldMissing {
                    field: format!("topics.{}.sql", topic.name),
                });
            }
        }
        Ok(())
    }

    /// Simulator invocation for this scenario.
    pub fn simulator_command(&self, config: &HarnessConfig) -> SimulatorCommand {
        SimulatorCommand::from_config(config, self.producer.db_name.clone())
            .with_poll_delay(self.simulator.poll_delay)
            .with_show_messages(self.simulator.show_messages)
            .with_show_rows(self.simulator.show_rows)
            .with_valgrind(self.simulator.valgrind)
    }
}

fn scenario_path_from_env() -> Option<PathBuf> {
    std::env::var("TMQRIG_SCENARIO").ok().map(PathBuf::from)
}

fn scenario_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--scenario" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmqrig_core::ColumnKind;

    const SAMPLE: &str = r#"
        [producer]
        db_name = "dbt"
        ctb_num = 2
        rows_per_table = 3
        batch_size = 2
        columns = [{ kind = "int" }, { kind = "binary", len = 16 }]

        [simulator]
        poll_delay = 20
        valgrind = true

        [[topics]]
        name = "topic_a"
        sql = "select * from dbt.stb"

        [[consumers]]
        consumer_id = 0
        topic_list = "topic_a"
        key_list = "group.id:cgrp1"
        expect_msg_count = 6

        [expect]
        total_rows = 6
    "#;

    #[test]
    fn test_parse_sample() {
        let scenario = ScenarioFile::from_toml_str(SAMPLE).unwrap();
        assert_eq!(scenario.producer.ctb_num, 2);
        assert_eq!(scenario.producer.columns[1].kind, ColumnKind::Binary);
        assert_eq!(scenario.producer.vgroups, 4);
        assert_eq!(scenario.simulator.poll_delay, 20);
        assert!(scenario.simulator.show_rows);
        assert_eq!(scenario.consumers.len(), 1);
        assert!(!scenario.consumers[0].manual_commit);
        assert_eq!(scenario.expect.total_rows, Some(6));
        assert!(scenario.validate().is_ok());
        assert_eq!(
            scenario.topics[0].create_statement(),
            "create topic if not exists topic_a as select * from dbt.stb"
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ScenarioFile::from_toml_str("bogus = 1\nconsumers = []").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_requires_consumers() {
        let scenario = ScenarioFile::from_toml_str("consumers = []").unwrap();
        assert!(matches!(
            scenario.validate(),
            Err(ValidationError::RequiredFieldMissing { .. })
        ));
    }

    #[test]
    fn test_duplicate_consumer_ids_rejected() {
        let mut scenario = ScenarioFile::from_toml_str(SAMPLE).unwrap();
        scenario.consumers.push(scenario.consumers[0].clone());
        assert!(matches!(
            scenario.validate(),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_simulator_command_from_options() {
        let scenario = ScenarioFile::from_toml_str(SAMPLE).unwrap();
        let config = HarnessConfig {
            sim_binary: Some(PathBuf::from("/opt/tmq_sim")),
            cfg_dir: Some(PathBuf::from("/opt/cfg")),
            ..HarnessConfig::default()
        };
        let cmd = scenario.simulator_command(&config);
        assert!(cmd.under_valgrind);
        assert_eq!(cmd.poll_delay, 20);
        assert_eq!(cmd.db_name, "dbt");
        assert_eq!(cmd.binary, PathBuf::from("/opt/tmq_sim"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ScenarioFile::from_path(Path::new("/nonexistent/scenario.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
