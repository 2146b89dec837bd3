use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{
    broker::Broker,
    cli::{Cli, Command},
    config::BrokerConfig,
    console,
};

fn init_tracing(to_stderr: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // The client owns stdout for the chat itself, so its logs go to stderr.
    let _ = if to_stderr {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(std::io::stdout().is_terminal())
            .try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Command::Client(_)));

    match cli.command {
        Command::Broker(args) => {
            let broker = Broker::bind(&BrokerConfig::from(args)).await?;
            let addr = broker.local_addr()?;
            info!("broker listening on {}", addr);
            if let Err(err) = broker.run_until_ctrl_c().await {
                warn!("broker exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => console::run(args.into()).await?,
    }

    Ok(())
}
