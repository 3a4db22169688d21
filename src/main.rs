use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use accelira::cli::{Cli, Command};
use accelira::error::Error;
use accelira::executor::Executor;
use accelira::report;

const LOGO: &str = r"
+===================================+
|    _                _ _           |
|   / \   ___ ___ ___| (_)_ __ __ _ |
|  / _ \ / __/ __/ _ \ | | '__/ _` ||
| / ___ \ (_| (_|  __/ | | | | (_| ||
|/_/   \_\___\___\___|_|_|_|  \__,_||
+===================================+
";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run { script, dashboard } => run(script, dashboard),
    }
}

fn run(script: PathBuf, dashboard: bool) -> anyhow::Result<()> {
    print!("{LOGO}");

    let code = std::fs::read_to_string(&script).map_err(|source| Error::ScriptRead {
        path: script.clone(),
        source,
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;

    let mut outcome = runtime.block_on(Executor::new(code).with_dashboard(dashboard).run())?;
    report::render(&mut outcome.aggregates);
    Ok(())
}
