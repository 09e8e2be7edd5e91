use anyhow::{Result, bail};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::error;

use runcore::config::RuncoreConfig;
use runcore::daemon::Daemon;
use runcore::logging::init_logging;
use runcore::platform::{NativePlatform, Platform};

fn parse_config_arg(args: &[String]) -> Result<Option<PathBuf>> {
    let mut config = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                let Some(path) = args.get(i + 1) else {
                    bail!("--config needs a path");
                };
                config = Some(PathBuf::from(path));
                i += 2;
            }
            "--help" | "-h" => {
                println!("Usage: runcore [--config <path>]");
                std::process::exit(0);
            }
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(config)
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_config_arg(&args)?;
    let data_dir = NativePlatform::data_dir();

    let config = RuncoreConfig::load(config_path.as_deref(), &data_dir).await?;
    init_logging(&config.logging.level);

    let daemon = Daemon::build(&config, &data_dir).await?;
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });
    daemon.run(shutdown).await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{:#}", e);
        eprintln!("runcore: {:#}", e);
        std::process::exit(1);
    }
}
