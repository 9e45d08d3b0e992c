use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use super::{ConfigError, Params};
use crate::topology::{RankMap, TorusDims};

/// A numeric parameter given either in base units or as a unit-suffixed string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(f64),
    Text(String),
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Number(n) => write!(f, "{n}"),
            Quantity::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Quantity::Text(value.to_owned())
    }
}

/// Parameters shared by every rank of a ghost-exchange run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSection {
    pub x_dim: i64,
    pub y_dim: i64,
    pub latency: Quantity,
    pub bandwidth: Quantity,
    pub compute_time: Quantity,
    #[serde(default)]
    pub exchange_msg_len: Option<Quantity>,
    #[serde(default)]
    pub debug: u8,
}

/// A block of logical ranks mapped onto transport endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRange {
    pub from: u32,
    pub to: u32,
    pub range: u32,
}

/// Description of a whole simulation run, usually read from a TOML file:
///
/// ```toml
/// seed = 42
/// rounds = 10
///
/// [pattern]
/// x_dim = 4
/// y_dim = 4
/// latency = "50ns"
/// bandwidth = "1GB/s"
/// compute_time = "10us"
///
/// [[mapping]]
/// from = 0
/// to = 100
/// range = 16
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub rounds: Option<u32>,
    pub pattern: PatternSection,
    /// Dense rank-to-endpoint ranges; identity mapping when empty.
    #[serde(default)]
    pub mapping: Vec<MappingRange>,
}

impl RunConfig {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    pub fn dims(&self) -> Result<TorusDims, ConfigError> {
        TorusDims::new(self.pattern.x_dim, self.pattern.y_dim)
    }

    /// Expands the run into one parameter set per rank, in rank order.
    pub fn rank_params(&self) -> Result<Vec<Params>, ConfigError> {
        let dims = self.dims()?;
        let mut shared = Params::new();
        shared.insert("x_dim".into(), dims.x_dim().to_string());
        shared.insert("y_dim".into(), dims.y_dim().to_string());
        shared.insert("latency".into(), self.pattern.latency.to_string());
        shared.insert("bandwidth".into(), self.pattern.bandwidth.to_string());
        shared.insert("compute_time".into(), self.pattern.compute_time.to_string());
        if let Some(len) = &self.pattern.exchange_msg_len {
            shared.insert("exchange_msg_len".into(), len.to_string());
        }
        shared.insert("debug".into(), self.pattern.debug.to_string());
        if let Some(rounds) = self.rounds {
            shared.insert("rounds".into(), rounds.to_string());
        }

        Ok(dims
            .ranks()
            .map(|rank| {
                let mut params = shared.clone();
                params.insert("rank".into(), rank.to_string());
                params
            })
            .collect())
    }

    pub fn rank_map(&self) -> Result<RankMap, ConfigError> {
        if self.mapping.is_empty() {
            return Ok(RankMap::identity_of(self.dims()?.size()));
        }
        let mut map = RankMap::dense();
        for range in &self.mapping {
            map.init_mapping(range.from, range.to, range.range)?;
        }
        Ok(map)
    }
}

/// Command line arguments of the `ghost-sim` runner.
///
/// Values given as flags override the ones read from `--config`.
#[derive(clap::Parser, Debug, Clone, Default)]
#[command(name = "ghost-sim", version, about = "Ghost-exchange traffic over a 2D torus")]
pub struct SimArgs {
    /// TOML run description.
    #[arg(long, env = "GHOST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Torus width.
    #[arg(long)]
    pub x_dim: Option<i64>,

    /// Torus height.
    #[arg(long)]
    pub y_dim: Option<i64>,

    /// Per-message latency, e.g. `50ns`.
    #[arg(long)]
    pub latency: Option<String>,

    /// Link bandwidth, e.g. `1GB/s`.
    #[arg(long)]
    pub bandwidth: Option<String>,

    /// Simulated compute time per round, e.g. `10us`.
    #[arg(long)]
    pub compute_time: Option<String>,

    /// Exchange payload size, e.g. `128B`.
    #[arg(long)]
    pub exchange_msg_len: Option<String>,

    /// Per-rank diagnostic verbosity.
    #[arg(long)]
    pub debug: Option<u8>,

    /// Rounds every rank runs before stopping.
    #[arg(long)]
    pub rounds: Option<u32>,

    /// Seed for the simulation. If not provided, a random seed will be used.
    #[arg(long, env = "GHOST_SEED")]
    pub seed: Option<u64>,

    /// Checkpoint and restore every rank once virtual time reaches this many nanoseconds.
    #[arg(long)]
    pub checkpoint_at: Option<u64>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<tracing::level_filters::LevelFilter>,

    /// Print the final report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SimArgs {
    pub fn build(&self) -> Result<RunConfig, ConfigError> {
        let mut run = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig {
                seed: 0,
                rounds: None,
                pattern: PatternSection {
                    x_dim: self.x_dim.ok_or(ConfigError::MissingParameter("x_dim"))?,
                    y_dim: self.y_dim.ok_or(ConfigError::MissingParameter("y_dim"))?,
                    latency: required_flag(&self.latency, "latency")?,
                    bandwidth: required_flag(&self.bandwidth, "bandwidth")?,
                    compute_time: required_flag(&self.compute_time, "compute_time")?,
                    exchange_msg_len: None,
                    debug: 0,
                },
                mapping: Vec::new(),
            },
        };

        let pattern = &mut run.pattern;
        if let Some(x_dim) = self.x_dim {
            pattern.x_dim = x_dim;
        }
        if let Some(y_dim) = self.y_dim {
            pattern.y_dim = y_dim;
        }
        if let Some(latency) = &self.latency {
            pattern.latency = latency.as_str().into();
        }
        if let Some(bandwidth) = &self.bandwidth {
            pattern.bandwidth = bandwidth.as_str().into();
        }
        if let Some(compute_time) = &self.compute_time {
            pattern.compute_time = compute_time.as_str().into();
        }
        if let Some(len) = &self.exchange_msg_len {
            pattern.exchange_msg_len = Some(len.as_str().into());
        }
        if let Some(debug) = self.debug {
            pattern.debug = debug;
        }
        if self.rounds.is_some() {
            run.rounds = self.rounds;
        }
        match self.seed {
            Some(seed) => run.seed = seed,
            None if self.config.is_none() => run.seed = rand::random(),
            None => {}
        }
        Ok(run)
    }
}

fn required_flag(value: &Option<String>, name: &'static str) -> Result<Quantity, ConfigError> {
    value
        .as_deref()
        .map(Quantity::from)
        .ok_or(ConfigError::MissingParameter(name))
}
