mod manager;

use std::env;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

const DEFAULT_NPROCS: usize = 4;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let nprocs = match env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("invalid core count {arg:?}"))?,
        None => DEFAULT_NPROCS,
    };
    manager::run_demo(nprocs)
}
