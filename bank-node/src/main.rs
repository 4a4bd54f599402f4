use std::{io::IsTerminal, time::Duration};

use anyhow::Result;
use clap::Parser;
use tokio::time::timeout;
use tracing::{info, warn};

use bank_node::{
    cli::{Cli, Command, ServeArgs},
    client,
    events::{spawn_jsonl_sink, Events},
    node::NodeController,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.resolve()?;
    let events = Events::new();
    let sink = config
        .event_log
        .clone()
        .map(|path| spawn_jsonl_sink(&events, path));

    let controller = NodeController::new(events);
    let addr = controller.start(&config).await?;
    info!("bank node listening on {}", addr);

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler failed: {err:?}");
    }
    info!("shutting down");
    controller.stop().await;

    // The sink finishes once the last `Events` handle is gone.
    drop(controller);
    if let Some(sink) = sink {
        if timeout(Duration::from_secs(2), sink).await.is_err() {
            warn!("event log did not finish flushing");
        }
    }

    Ok(())
}
