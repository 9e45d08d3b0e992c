use anyhow::{bail, Context};
use clap::Parser;
use ghost_sim::{set_logger, ComponentRegistry, SimArgs, Simulation};

fn main() -> anyhow::Result<()> {
    let args = SimArgs::parse();
    set_logger(args.log_level);

    let run = args.build().context("invalid run configuration")?;
    if run.rounds.is_none() {
        bail!("a round limit (`rounds` or --rounds) is required to run to completion");
    }

    let mut sim = Simulation::build(&run, ComponentRegistry::with_builtins())?;
    if let Some(at) = args.checkpoint_at {
        sim.run_until(at)?;
        let blobs = sim.checkpoint_all()?;
        let bytes: usize = blobs.iter().map(|(_, blob)| blob.len()).sum();
        tracing::info!(time = at, ranks = blobs.len(), bytes, "Checkpointed every rank");
        sim.restore_all(blobs)?;
    }
    let report = sim.run()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}
