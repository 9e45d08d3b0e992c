//! Run files on disk and the `ghost-sim` command line.

use std::io::Write;

use clap::Parser;
use ghost_sim::{
    config::Quantity, ComponentRegistry, ConfigError, PatternState, RunConfig,
    SimArgs, SimError, Simulation,
};
use testresult::TestResult;

const RUN: &str = r#"
seed = 11
rounds = 2

[pattern]
x_dim = 3
y_dim = 3
latency = "50ns"
bandwidth = "1GB/s"
compute_time = "10us"
debug = 2

[[mapping]]
from = 0
to = 1000
range = 9
"#;

fn write_run(contents: &str) -> Result<tempfile::NamedTempFile, std::io::Error> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[test_log::test]
fn test_load_and_run_file() -> TestResult {
    let file = write_run(RUN)?;
    let run = RunConfig::load(file.path())?;
    assert_eq!(run.seed, 11);
    assert_eq!(run.pattern.debug, 2);
    assert_eq!(run.rank_map()?.map(8), Some(1008));

    let mut sim = Simulation::build(&run, ComponentRegistry::with_builtins())?;
    let report = sim.run()?;
    assert_eq!(report.seed, 11);
    assert_eq!(report.ranks.len(), 9);
    assert!(report
        .ranks
        .iter()
        .all(|r| r.state == PatternState::Done && r.rounds == 2));
    Ok(())
}

#[test]
fn test_load_missing_file() -> TestResult {
    let dir = tempfile::tempdir()?;
    let err = RunConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Load(msg) if msg.contains("absent.toml")));
    Ok(())
}

#[test]
fn test_flags_override_file() -> TestResult {
    let file = write_run(RUN)?;
    let path = file.path().to_string_lossy().into_owned();
    let args = SimArgs::try_parse_from([
        "ghost-sim",
        "--config",
        path.as_str(),
        "--latency",
        "1us",
        "--rounds",
        "5",
        "--checkpoint-at",
        "15000",
        "--json",
    ])?;
    assert_eq!(args.checkpoint_at, Some(15_000));
    assert!(args.json);

    let run = args.build()?;
    assert_eq!(run.pattern.latency, Quantity::from("1us"));
    assert_eq!(run.pattern.bandwidth, Quantity::from("1GB/s"));
    assert_eq!(run.rounds, Some(5));
    // the file's seed survives when no --seed is given
    assert_eq!(run.seed, 11);
    Ok(())
}

#[test]
fn test_flags_only() -> TestResult {
    let args = SimArgs::try_parse_from([
        "ghost-sim",
        "--x-dim",
        "2",
        "--y-dim",
        "1",
        "--latency",
        "50ns",
        "--bandwidth",
        "1GB/s",
        "--compute-time",
        "10us",
        "--exchange-msg-len",
        "64B",
        "--rounds",
        "1",
        "--seed",
        "3",
    ])?;
    let run = args.build()?;
    assert_eq!(run.seed, 3);

    let mut sim = Simulation::build(&run, ComponentRegistry::with_builtins())?;
    let report = sim.run()?;
    // 50ns + 64B at 1GB/s
    assert_eq!(report.end_time_ns, 10_114);
    assert_eq!(report.network.bytes_sent, 2 * 4 * 64);
    Ok(())
}

#[test]
fn test_invalid_parameters_fail_the_build() -> TestResult {
    let mut run = RunConfig::from_toml(RUN)?;
    run.pattern.bandwidth = Quantity::Number(0.0);
    let err = Simulation::build(&run, ComponentRegistry::with_builtins()).unwrap_err();
    assert!(matches!(err, SimError::Build(_)), "{err}");

    let mut run = RunConfig::from_toml(RUN)?;
    run.pattern.x_dim = 0;
    assert!(matches!(
        Simulation::build(&run, ComponentRegistry::with_builtins()),
        Err(SimError::Build(_))
    ));

    // mapping leaves rank 8 without an endpoint
    let mut run = RunConfig::from_toml(RUN)?;
    run.mapping[0].range = 8;
    let err = Simulation::build(&run, ComponentRegistry::with_builtins()).unwrap_err();
    assert!(err.to_string().contains('8'), "{err}");
    Ok(())
}
