//! Master configuration.
//!
//! A small `KEY = value` file plus one `goal` line per replication policy:
//!
//! ```text
//! LISTEN = 0.0.0.0:9421
//! DATA_PATH = /var/lib/lizardfs
//! LOCK_TIMEOUT_MS = 60000
//! goal 1 default: std {_ 2}
//! goal 2 important: std {_ 2} | xor3 {_ 1}
//! ```
//!
//! The file is re-read in place on `reload-config`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, format_err, Context, Error};

use lfs_api_types::{Goal, GoalId};

#[derive(Clone, Debug)]
pub struct MasterConfig {
    pub listen: SocketAddr,
    pub data_path: PathBuf,
    pub lock_timeout: Duration,
    pub goals: Vec<(GoalId, Goal)>,
    pub default_goal: GoalId,
}

impl Default for MasterConfig {
    fn default() -> Self {
        let default_goal: Goal = "default: std {_ 2}".parse().unwrap();
        MasterConfig {
            listen: "0.0.0.0:9421".parse().unwrap(),
            data_path: PathBuf::from("."),
            lock_timeout: Duration::from_secs(60),
            goals: vec![(GoalId::new(1).unwrap(), default_goal)],
            default_goal: GoalId::new(1).unwrap(),
        }
    }
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        Self::parse(&text).with_context(|| format!("parsing config file {:?}", path))
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut config = MasterConfig {
            goals: Vec::new(),
            ..Default::default()
        };

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(goal_line) = line.strip_prefix("goal ") {
                let (id_text, definition) = goal_line
                    .trim()
                    .split_once(' ')
                    .ok_or_else(|| format_err!("line {}: malformed goal line", number + 1))?;
                let id = GoalId::new(id_text.parse()?)?;
                let goal: Goal = definition.trim().parse()?;
                if config.goals.iter().any(|(have, _)| *have == id) {
                    bail!("line {}: duplicate goal id {}", number + 1, id);
                }
                config.goals.push((id, goal));
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format_err!("line {}: expected KEY = value", number + 1))?;
            match key.trim() {
                "LISTEN" => config.listen = value.trim().parse()?,
                "DATA_PATH" => config.data_path = PathBuf::from(value.trim()),
                "LOCK_TIMEOUT_MS" => {
                    config.lock_timeout = Duration::from_millis(value.trim().parse()?)
                }
                "DEFAULT_GOAL" => config.default_goal = GoalId::new(value.trim().parse()?)?,
                other => bail!("line {}: unknown config key '{}'", number + 1, other),
            }
        }

        if config.goals.is_empty() {
            config.goals = MasterConfig::default().goals;
        }
        if !config
            .goals
            .iter()
            .any(|(id, _)| *id == config.default_goal)
        {
            bail!("default goal {} is not defined", config.default_goal);
        }
        Ok(config)
    }

    pub fn goal(&self, id: GoalId) -> Option<&Goal> {
        self.goals
            .iter()
            .find(|(have, _)| *have == id)
            .map(|(_, goal)| goal)
    }
}
