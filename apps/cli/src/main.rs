//! treedump CLI: dump a document store export into a path-sorted store.

mod commands;

use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::runtime::Runtime;

use commands::Cli;

/// How long exit waits for stage threads that ignored cancellation.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(commands::run(cli));
    shutdown(runtime);
    result
}

/// Stop the runtime without joining blocking threads still stuck in a source call.
fn shutdown(runtime: Runtime) {
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
}
