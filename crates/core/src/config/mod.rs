use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    cost::{self, CostModel},
    topology::{Rank, TorusDims},
};

mod run;
pub mod units;

pub use run::{MappingRange, PatternSection, Quantity, RunConfig, SimArgs};

/// Default payload size of every exchange message, in bytes.
pub const DEFAULT_EXCHANGE_MSG_LEN: u64 = 128;

/// Registry name of the ghost-exchange pattern generator.
pub const GHOST_COMPONENT: &str = "patterns.ghost";

/// Raw component parameters, as handed over by the simulation builder.
pub type Params = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required parameter `{0}`")]
    MissingParameter(&'static str),
    #[error("invalid value `{value}` for `{name}`: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
    #[error("torus dimensions must be positive (x_dim: {x_dim}, y_dim: {y_dim})")]
    NonPositiveDims { x_dim: i64, y_dim: i64 },
    #[error("torus of {x_dim}x{y_dim} ranks is too large")]
    DimsOverflow { x_dim: i64, y_dim: i64 },
    #[error("rank {rank} is outside of a torus with {size} ranks")]
    RankOutOfRange { rank: i64, size: u32 },
    #[error("torus {dims} holds {expected} ranks but {actual} were configured")]
    RankCountMismatch {
        dims: TorusDims,
        expected: u32,
        actual: usize,
    },
    #[error("rank {rank} was configured for a {found} torus, expected {expected}")]
    InconsistentDims {
        rank: Rank,
        expected: TorusDims,
        found: TorusDims,
    },
    #[error("rank {0} is configured more than once")]
    DuplicateRank(Rank),
    #[error("invalid rank mapping: {0}")]
    InvalidMapping(String),
    #[error("rank {0} has no endpoint mapping")]
    Unmapped(Rank),
    #[error("failed reading configuration: {0}")]
    Load(String),
}

impl ConfigError {
    fn invalid(name: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.to_owned(),
            value: value.to_owned(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimingModelError {
    #[error("latency must be a finite, non-negative number of nanoseconds (got {0})")]
    InvalidLatency(f64),
    #[error("bandwidth must be a finite, positive number of bytes per second (got {0})")]
    InvalidBandwidth(f64),
    #[error("compute_time must be a finite, non-negative number of nanoseconds (got {0})")]
    InvalidComputeTime(f64),
}

/// Anything that aborts building a component.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    TimingModel(#[from] TimingModelError),
    #[error("unknown component type `{0}`")]
    UnknownComponent(String),
}

/// Validated configuration of a single ghost-exchange rank.
///
/// Times are in nanoseconds and bandwidth in bytes per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhostConfig {
    pub rank: Rank,
    pub dims: TorusDims,
    pub latency_ns: f64,
    pub bandwidth: f64,
    pub compute_time_ns: f64,
    pub exchange_msg_len: u64,
    /// Verbosity of this component's diagnostic output.
    pub debug: u8,
    /// Number of rounds after which the rank stops; unbounded when unset.
    pub rounds: Option<u32>,
}

impl GhostConfig {
    /// Builds the configuration out of string parameters.
    ///
    /// Unknown keys are ignored so a shared parameter set can feed several
    /// component types.
    pub fn from_params(params: &Params) -> Result<Self, BuildError> {
        for key in params.keys() {
            if !KNOWN_PARAMS.contains(&key.as_str()) {
                tracing::debug!(key = %key, "Ignoring unknown ghost pattern parameter");
            }
        }

        let x_dim = required(params, "x_dim", parse_int)?;
        let y_dim = required(params, "y_dim", parse_int)?;
        let dims = TorusDims::new(x_dim, y_dim)?;
        let rank = dims.rank(required(params, "rank", parse_int)?)?;

        let config = Self {
            rank,
            dims,
            latency_ns: required(params, "latency", units::parse_time_ns)?,
            bandwidth: required(params, "bandwidth", units::parse_bandwidth)?,
            compute_time_ns: required(params, "compute_time", units::parse_time_ns)?,
            exchange_msg_len: optional(params, "exchange_msg_len", units::parse_bytes)?
                .unwrap_or(DEFAULT_EXCHANGE_MSG_LEN),
            debug: optional(params, "debug", |v| {
                v.trim().parse::<u8>().map_err(|e| e.to_string())
            })?
            .unwrap_or(0),
            rounds: optional(params, "rounds", |v| {
                v.trim().parse::<u32>().map_err(|e| e.to_string())
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants a decoded or hand-built configuration must hold.
    pub fn validate(&self) -> Result<(), BuildError> {
        if !self.dims.contains(self.rank) {
            return Err(ConfigError::RankOutOfRange {
                rank: self.rank.as_u32().into(),
                size: self.dims.size(),
            }
            .into());
        }
        if self.rounds == Some(0) {
            return Err(ConfigError::invalid("rounds", "0", "at least one round is required").into());
        }
        self.cost_model()?;
        if !(self.compute_time_ns.is_finite() && self.compute_time_ns >= 0.0) {
            return Err(TimingModelError::InvalidComputeTime(self.compute_time_ns).into());
        }
        Ok(())
    }

    pub fn cost_model(&self) -> Result<CostModel, TimingModelError> {
        CostModel::new(self.latency_ns, self.bandwidth)
    }

    /// Simulated duration of one compute phase.
    pub fn compute_delay(&self) -> Duration {
        cost::nanos_to_duration(self.compute_time_ns)
    }

    /// Renders the configuration back into parameters `from_params` accepts.
    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        params.insert("rank".into(), self.rank.to_string());
        params.insert("x_dim".into(), self.dims.x_dim().to_string());
        params.insert("y_dim".into(), self.dims.y_dim().to_string());
        params.insert("latency".into(), self.latency_ns.to_string());
        params.insert("bandwidth".into(), self.bandwidth.to_string());
        params.insert("compute_time".into(), self.compute_time_ns.to_string());
        params.insert("exchange_msg_len".into(), self.exchange_msg_len.to_string());
        params.insert("debug".into(), self.debug.to_string());
        if let Some(rounds) = self.rounds {
            params.insert("rounds".into(), rounds.to_string());
        }
        params
    }
}

const KNOWN_PARAMS: &[&str] = &[
    "rank",
    "x_dim",
    "y_dim",
    "latency",
    "bandwidth",
    "compute_time",
    "exchange_msg_len",
    "debug",
    "rounds",
];

fn parse_int(value: &str) -> Result<i64, String> {
    value.trim().parse::<i64>().map_err(|e| e.to_string())
}

fn required<T>(
    params: &Params,
    name: &'static str,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<T, ConfigError> {
    optional(params, name, parse)?.ok_or(ConfigError::MissingParameter(name))
}

fn optional<T>(
    params: &Params,
    name: &'static str,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<Option<T>, ConfigError> {
    params
        .get(name)
        .map(|value| parse(value).map_err(|reason| ConfigError::invalid(name, value, reason)))
        .transpose()
}

/// Installs the global tracing subscriber once; later calls are no-ops.
pub fn set_logger(level: Option<tracing::level_filters::LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: std::sync::atomic::AtomicBool =
            std::sync::atomic::AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(err) = crate::logging::init_tracer(level) {
            eprintln!("failed tracing initialization: {err}");
        }
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base() -> Params {
        params(&[
            ("rank", "5"),
            ("x_dim", "4"),
            ("y_dim", "4"),
            ("latency", "50ns"),
            ("bandwidth", "1GB/s"),
            ("compute_time", "10us"),
        ])
    }

    #[test]
    fn test_from_params_defaults() {
        let config = GhostConfig::from_params(&base()).unwrap();
        assert_eq!(config.rank, Rank::new(5));
        assert_eq!(config.latency_ns, 50.0);
        assert_eq!(config.bandwidth, 1e9);
        assert_eq!(config.compute_time_ns, 10_000.0);
        assert_eq!(config.exchange_msg_len, DEFAULT_EXCHANGE_MSG_LEN);
        assert_eq!(config.debug, 0);
        assert_eq!(config.rounds, None);
        assert_eq!(config.compute_delay(), Duration::from_micros(10));
    }

    #[test]
    fn test_from_params_round_trips_through_to_params() {
        let mut p = base();
        p.insert("exchange_msg_len".into(), "4KiB".into());
        p.insert("rounds".into(), "3".into());
        p.insert("debug".into(), "2".into());
        let config = GhostConfig::from_params(&p).unwrap();
        assert_eq!(config.exchange_msg_len, 4096);
        assert_eq!(GhostConfig::from_params(&config.to_params()).unwrap(), config);
    }

    #[test]
    fn test_missing_parameter() {
        let mut p = base();
        p.remove("bandwidth");
        assert_eq!(
            GhostConfig::from_params(&p),
            Err(BuildError::Config(ConfigError::MissingParameter("bandwidth")))
        );
    }

    #[test]
    fn test_rank_out_of_range() {
        let mut p = base();
        p.insert("rank".into(), "16".into());
        assert_eq!(
            GhostConfig::from_params(&p),
            Err(BuildError::Config(ConfigError::RankOutOfRange { rank: 16, size: 16 }))
        );
    }

    #[test]
    fn test_invalid_value() {
        let mut p = base();
        p.insert("x_dim".into(), "four".into());
        assert!(matches!(
            GhostConfig::from_params(&p),
            Err(BuildError::Config(ConfigError::InvalidValue { name, .. })) if name == "x_dim"
        ));
    }

    #[test]
    fn test_timing_errors() {
        let mut p = base();
        p.insert("bandwidth".into(), "0".into());
        assert_eq!(
            GhostConfig::from_params(&p),
            Err(BuildError::TimingModel(TimingModelError::InvalidBandwidth(0.0)))
        );

        let mut p = base();
        p.insert("latency".into(), "-1".into());
        assert_eq!(
            GhostConfig::from_params(&p),
            Err(BuildError::TimingModel(TimingModelError::InvalidLatency(-1.0)))
        );

        let mut p = base();
        p.insert("compute_time".into(), "-5ns".into());
        assert_eq!(
            GhostConfig::from_params(&p),
            Err(BuildError::TimingModel(TimingModelError::InvalidComputeTime(-5.0)))
        );
    }

    #[test]
    fn test_zero_rounds_rejected() {
        let mut p = base();
        p.insert("rounds".into(), "0".into());
        assert!(matches!(
            GhostConfig::from_params(&p),
            Err(BuildError::Config(ConfigError::InvalidValue { .. }))
        ));
    }
}
