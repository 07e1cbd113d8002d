use clap::Parser;
use training::util::{run_train, TrainArgs};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    init_tracing();
    run_train(args)?;
    Ok(())
}

/// Plain progress lines on stdout; `RUST_LOG` overrides the `info` default.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .with_level(false)
        .with_target(false)
        .init();
}
